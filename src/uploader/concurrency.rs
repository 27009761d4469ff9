// 并发控制器
//
// 有效上限 = 静态配置上限
//   → 开启网络优化时按连接类型收紧
//   → 开启自适应优化时按推荐并发收紧（不高于网络上限，不低于 1）
//
// 每次计算都读取最新的配置快照、网络快照和性能统计，调度循环在每次激活前重新查询；
// 对外报告的是调度循环已执行的上限（applied）

use crate::config::ConfigStore;
use crate::network::{ConnectionClass, NetworkMetrics, NetworkMonitor};
use crate::uploader::performance::PerformanceTracker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// 有效并发上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub max_files: usize,
    pub max_chunks_per_file: usize,
}

/// 连接类型对应的上限（文件数, 单文件分片数），None 表示不额外限制
pub fn network_caps(metrics: &NetworkMetrics) -> Option<EffectiveLimits> {
    let (files, chunks) = match metrics.class {
        ConnectionClass::Offline => (0, 0),
        ConnectionClass::Slow2g | ConnectionClass::TwoG => (1, 1),
        ConnectionClass::ThreeG => (2, 2),
        ConnectionClass::FourG => (3, 4),
        ConnectionClass::Broadband | ConnectionClass::Unknown => {
            return if metrics.save_data {
                Some(EffectiveLimits {
                    max_files: 1,
                    max_chunks_per_file: usize::MAX,
                })
            } else {
                None
            };
        }
    };
    let files = if metrics.save_data { files.min(1) } else { files };
    Some(EffectiveLimits {
        max_files: files,
        max_chunks_per_file: chunks,
    })
}

/// 并发控制器
pub struct ConcurrencyController {
    config: Arc<ConfigStore>,
    network: Arc<NetworkMonitor>,
    performance: Arc<PerformanceTracker>,
    /// 调度循环最近一次执行的上限
    last: Mutex<Option<EffectiveLimits>>,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("last", &*self.last.lock())
            .finish()
    }
}

impl ConcurrencyController {
    pub fn new(
        config: Arc<ConfigStore>,
        network: Arc<NetworkMonitor>,
        performance: Arc<PerformanceTracker>,
    ) -> Self {
        Self {
            config,
            network,
            performance,
            last: Mutex::new(None),
        }
    }

    /// 计算当前有效上限
    pub fn effective_limits(&self) -> EffectiveLimits {
        let config = self.config.load();
        let mut limits = EffectiveLimits {
            max_files: config.max_concurrent_files,
            max_chunks_per_file: config.max_concurrent_chunks_per_file,
        };

        if config.network_optimization_enabled {
            if let Some(caps) = network_caps(&self.network.current()) {
                limits.max_files = limits.max_files.min(caps.max_files);
                limits.max_chunks_per_file =
                    limits.max_chunks_per_file.min(caps.max_chunks_per_file);
            }
        }

        if config.adaptive_optimization_enabled {
            let optimal = self.performance.optimal_concurrency().max(1);
            limits.max_files = limits.max_files.min(optimal);
        }

        limits
    }

    /// 单文件分片上限（Worker 每次派发前读取）
    pub fn max_chunks_per_file(&self) -> usize {
        self.effective_limits().max_chunks_per_file
    }

    /// 调度循环已生效的上限（尚未调度过时按当前状况计算）
    pub fn applied(&self) -> EffectiveLimits {
        match *self.last.lock() {
            Some(limits) => limits,
            None => self.effective_limits(),
        }
    }

    /// 记录调度循环已执行的上限
    ///
    /// 收缩时须在超额文件挂起之后调用，扩张时须在激活新文件之前调用，
    /// 保证任何时刻运行中的文件数不超过 `applied()`
    ///
    /// # 返回
    /// 上限是否变化（变化时由调用方发布 LimitsChanged）
    pub fn apply(&self, limits: EffectiveLimits) -> bool {
        let changed = {
            let mut last = self.last.lock();
            let changed = last.map_or(true, |prev| prev != limits);
            *last = Some(limits);
            changed
        };

        if changed {
            info!(
                "🔧 有效并发上限: 文件 {}, 单文件分片 {}",
                limits.max_files, limits.max_chunks_per_file
            );
        }
        changed
    }
}
