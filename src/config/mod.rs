// 配置管理模块

pub mod queue;

use crate::network::ConnectionClass;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

pub use queue::{
    ConfigStore, PriorityMode, QueueConfig, QueueConfigPatch, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 网络监测配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 性能统计配置
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// 上传服务接口配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 网络监测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 兜底定时采样间隔（秒），用于没有变化通知的平台
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// 启动时假定的连接类型
    #[serde(default)]
    pub initial_class: ConnectionClass,
}

fn default_sample_interval_secs() -> u64 {
    30
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            initial_class: ConnectionClass::default(),
        }
    }
}

/// 性能统计配置
///
/// optimal_concurrency 的调节规则：
/// - 连续 success_streak 次成功：+1
/// - 窗口内失败次数达到 failure_burst：减半（不低于 1）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// 滚动窗口大小（样本数）
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// 连续成功多少次后提升并发
    #[serde(default = "default_success_streak")]
    pub success_streak: u32,
    /// 窗口内多少次失败视为失败突发
    #[serde(default = "default_failure_burst")]
    pub failure_burst: u32,
    /// 初始推荐并发数（None 表示使用 max_concurrent_files）
    #[serde(default)]
    pub initial_concurrency: Option<usize>,
}

fn default_window_size() -> usize {
    20
}
fn default_success_streak() -> u32 {
    3
}
fn default_failure_burst() -> u32 {
    2
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            success_streak: default_success_streak(),
            failure_burst: default_failure_burst(),
            initial_concurrency: None,
        }
    }
}

/// 上传服务接口配置（会话创建、上传地址签发）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 接口根地址
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 分片 PUT 超时（秒）
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// 访问令牌（由上层登录流程写入，可为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

fn default_api_base_url() -> String {
    "http://localhost:3000/api".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_chunk_timeout_secs() -> u64 {
    300
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            access_token: None,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .queue
            .validate()
            .context("配置文件中的队列配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.queue.validate().context("保存配置失败：队列配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }
                default_config
            }
        }
    }
}
