// 上传队列配置
//
// QueueConfig 是不可变快照：所有组件通过 ConfigStore::load() 读取当前快照，
// updateConfig 通过 QueueConfigPatch 生成新快照并整体替换，读取方不会看到新旧字段混合

use crate::error::QueueError;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 默认分片大小: 10MB
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 最小分片大小: 256KB
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// 最大分片大小: 512MB
pub const MAX_CHUNK_SIZE: u64 = 512 * 1024 * 1024;

/// 优先级模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// 按到达顺序
    #[default]
    Fifo,
    /// 小文件优先
    SmallestFirst,
    /// 大文件优先
    LargestFirst,
}

impl std::str::FromStr for PriorityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(PriorityMode::Fifo),
            "smallest_first" => Ok(PriorityMode::SmallestFirst),
            "largest_first" => Ok(PriorityMode::LargestFirst),
            other => Err(format!("未知的优先级模式: {}", other)),
        }
    }
}

/// 上传队列配置快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks_per_file")]
    pub max_concurrent_chunks_per_file: usize,
    /// 单分片最大重试次数
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// 重试基础延迟（毫秒），第 n 次重试等待 base * 2^(n-1)
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// 优先级模式
    #[serde(default)]
    pub priority_mode: PriorityMode,
    /// 是否根据传输表现自适应并发
    #[serde(default = "default_true")]
    pub adaptive_optimization_enabled: bool,
    /// 是否根据网络状况限制并发
    #[serde(default = "default_true")]
    pub network_optimization_enabled: bool,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 无进度多久视为卡住（秒）
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// 进度采样间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 上传目标提前多久视为过期（秒）
    #[serde(default = "default_target_expiry_margin_secs")]
    pub target_expiry_margin_secs: u64,
}

fn default_max_concurrent_files() -> usize {
    3
}
fn default_max_concurrent_chunks_per_file() -> usize {
    3
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_base_retry_delay_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_stall_threshold_secs() -> u64 {
    30
}
fn default_progress_interval_ms() -> u64 {
    500
}
fn default_target_expiry_margin_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_chunks_per_file: default_max_concurrent_chunks_per_file(),
            retry_attempts: default_retry_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            priority_mode: PriorityMode::default(),
            adaptive_optimization_enabled: true,
            network_optimization_enabled: true,
            chunk_size: default_chunk_size(),
            stall_threshold_secs: default_stall_threshold_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            target_expiry_margin_secs: default_target_expiry_margin_secs(),
        }
    }
}

impl QueueConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn target_expiry_margin(&self) -> Duration {
        Duration::from_secs(self.target_expiry_margin_secs)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_concurrent_files == 0 {
            return Err(QueueError::InvalidConfig(
                "max_concurrent_files 必须大于 0".to_string(),
            ));
        }
        if self.max_concurrent_chunks_per_file == 0 {
            return Err(QueueError::InvalidConfig(
                "max_concurrent_chunks_per_file 必须大于 0".to_string(),
            ));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(QueueError::InvalidConfig(format!(
                "chunk_size 必须在 {} 到 {} 字节之间，当前值: {}",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.progress_interval_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "progress_interval_ms 必须大于 0".to_string(),
            ));
        }
        if self.stall_threshold_secs == 0 {
            return Err(QueueError::InvalidConfig(
                "stall_threshold_secs 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 应用部分更新，返回新快照（不修改 self）
    pub fn apply(&self, patch: &QueueConfigPatch) -> Result<QueueConfig, QueueError> {
        let mut next = self.clone();
        if let Some(v) = patch.max_concurrent_files {
            next.max_concurrent_files = v;
        }
        if let Some(v) = patch.max_concurrent_chunks_per_file {
            next.max_concurrent_chunks_per_file = v;
        }
        if let Some(v) = patch.retry_attempts {
            next.retry_attempts = v;
        }
        if let Some(v) = patch.base_retry_delay_ms {
            next.base_retry_delay_ms = v;
        }
        if let Some(v) = patch.priority_mode {
            next.priority_mode = v;
        }
        if let Some(v) = patch.adaptive_optimization_enabled {
            next.adaptive_optimization_enabled = v;
        }
        if let Some(v) = patch.network_optimization_enabled {
            next.network_optimization_enabled = v;
        }
        if let Some(v) = patch.chunk_size {
            next.chunk_size = v;
        }
        if let Some(v) = patch.stall_threshold_secs {
            next.stall_threshold_secs = v;
        }
        if let Some(v) = patch.progress_interval_ms {
            next.progress_interval_ms = v;
        }
        if let Some(v) = patch.target_expiry_margin_secs {
            next.target_expiry_margin_secs = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// 配置部分更新（updateConfig 的输入）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_chunks_per_file: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_mode: Option<PriorityMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_optimization_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_optimization_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_threshold_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_expiry_margin_secs: Option<u64>,
}

/// 配置快照存储
///
/// 读取无锁（ArcSwap），写入串行化（Mutex），保证 read-modify-write 不丢更新
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<QueueConfig>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            write_lock: Mutex::new(()),
        })
    }

    /// 获取当前快照
    pub fn load(&self) -> Arc<QueueConfig> {
        self.current.load_full()
    }

    /// 应用部分更新并整体替换快照
    ///
    /// # 返回
    /// (旧快照, 新快照)
    pub fn update(
        &self,
        patch: &QueueConfigPatch,
    ) -> Result<(Arc<QueueConfig>, Arc<QueueConfig>), QueueError> {
        let _guard = self.write_lock.lock();
        let old = self.current.load_full();
        let next = Arc::new(old.apply(patch)?);
        self.current.store(next.clone());
        info!(
            "🔧 队列配置已更新: 文件并发 {} -> {}, 分片并发 {} -> {}, 优先级 {:?} -> {:?}",
            old.max_concurrent_files,
            next.max_concurrent_files,
            old.max_concurrent_chunks_per_file,
            next.max_concurrent_chunks_per_file,
            old.priority_mode,
            next.priority_mode
        );
        Ok((old, next))
    }
}
