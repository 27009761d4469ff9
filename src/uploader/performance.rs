// 传输表现统计
//
// 消费完成/失败事件与周期性速度样本，维护滚动窗口，给出保守的推荐并发数：
// - 连续 success_streak 次文件成功：推荐并发 +1（不超过上限）
// - 窗口内失败数达到 failure_burst：推荐并发减半（不低于 1），并清空窗口内的失败记录

use crate::config::PerformanceConfig;
use crate::events::{EventBus, QueueEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 性能统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// 已结束的文件数
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// 分片级失败次数（含已重试成功的）
    pub chunk_failures: u64,
    /// 滚动平均吞吐（字节/秒）
    pub average_throughput: f64,
    /// 当前占用槽位的文件数
    pub active_concurrency: usize,
    /// 推荐并发文件数
    pub optimal_concurrency: usize,
}

impl PerformanceMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.successful as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct TrackerState {
    metrics: PerformanceMetrics,
    /// 最近的成功/失败结果
    outcomes: VecDeque<Outcome>,
    /// 最近的吞吐样本（字节/秒）
    throughput: VecDeque<f64>,
    success_streak: u32,
    /// 推荐并发上限（随配置变化）
    max_concurrency: usize,
}

/// 传输表现统计器
#[derive(Debug)]
pub struct PerformanceTracker {
    config: PerformanceConfig,
    state: Mutex<TrackerState>,
    events: EventBus,
}

impl PerformanceTracker {
    /// 创建统计器
    ///
    /// # 参数
    /// * `max_concurrency` - 推荐并发上限（通常为 max_concurrent_files）
    pub fn new(config: PerformanceConfig, max_concurrency: usize, events: EventBus) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let initial = config
            .initial_concurrency
            .unwrap_or(max_concurrency)
            .clamp(1, max_concurrency);

        info!(
            "性能统计器已创建: 初始推荐并发 {}, 上限 {}, 窗口 {}",
            initial, max_concurrency, config.window_size
        );

        Self {
            state: Mutex::new(TrackerState {
                metrics: PerformanceMetrics {
                    optimal_concurrency: initial,
                    ..Default::default()
                },
                outcomes: VecDeque::with_capacity(config.window_size),
                throughput: VecDeque::with_capacity(config.window_size),
                success_streak: 0,
                max_concurrency,
            }),
            config,
            events,
        }
    }

    /// 当前统计快照
    pub fn metrics(&self) -> PerformanceMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn optimal_concurrency(&self) -> usize {
        self.state.lock().metrics.optimal_concurrency
    }

    /// 文件上传成功
    pub fn record_file_completed(&self, bytes: u64, elapsed: Duration) {
        let snapshot = {
            let mut state = self.state.lock();
            state.metrics.total += 1;
            state.metrics.successful += 1;

            let secs = elapsed.as_secs_f64();
            if secs > 0.0 {
                self.push_throughput(&mut state, bytes as f64 / secs);
            }
            self.push_outcome(&mut state, Outcome::Success);

            state.success_streak += 1;
            if state.success_streak >= self.config.success_streak {
                state.success_streak = 0;
                let current = state.metrics.optimal_concurrency;
                let next = (current + 1).min(state.max_concurrency);
                if next != current {
                    info!("📈 传输稳定，推荐并发 {} -> {}", current, next);
                    state.metrics.optimal_concurrency = next;
                }
            }
            state.metrics.clone()
        };
        self.publish(snapshot);
    }

    /// 文件最终失败
    pub fn record_file_failed(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            state.metrics.total += 1;
            state.metrics.failed += 1;
            self.record_failure(&mut state);
            state.metrics.clone()
        };
        self.publish(snapshot);
    }

    /// 分片传输失败（随后可能重试成功）
    pub fn record_chunk_failure(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            state.metrics.chunk_failures += 1;
            self.record_failure(&mut state);
            state.metrics.clone()
        };
        self.publish(snapshot);
    }

    /// 周期性速度样本（字节/秒），不发布事件
    pub fn record_speed_sample(&self, bytes_per_sec: u64) {
        let mut state = self.state.lock();
        self.push_throughput(&mut state, bytes_per_sec as f64);
    }

    /// 更新当前活跃文件数
    pub fn set_active(&self, active: usize) {
        self.state.lock().metrics.active_concurrency = active;
    }

    /// 配置变化时调整推荐并发上限
    pub fn set_max_concurrency(&self, max: usize) {
        let mut state = self.state.lock();
        state.max_concurrency = max.max(1);
        if state.metrics.optimal_concurrency > state.max_concurrency {
            state.metrics.optimal_concurrency = state.max_concurrency;
        }
    }

    fn record_failure(&self, state: &mut TrackerState) {
        state.success_streak = 0;
        self.push_outcome(state, Outcome::Failure);

        let failures = state
            .outcomes
            .iter()
            .filter(|o| **o == Outcome::Failure)
            .count() as u32;
        if failures >= self.config.failure_burst.max(1) {
            let current = state.metrics.optimal_concurrency;
            let next = (current / 2).max(1);
            warn!(
                "📉 窗口内失败 {} 次，推荐并发 {} -> {}",
                failures, current, next
            );
            state.metrics.optimal_concurrency = next;
            state.outcomes.retain(|o| *o != Outcome::Failure);
        } else {
            debug!("窗口内失败 {} 次", failures);
        }
    }

    fn push_outcome(&self, state: &mut TrackerState, outcome: Outcome) {
        if state.outcomes.len() >= self.config.window_size.max(1) {
            state.outcomes.pop_front();
        }
        state.outcomes.push_back(outcome);
    }

    fn push_throughput(&self, state: &mut TrackerState, value: f64) {
        if state.throughput.len() >= self.config.window_size.max(1) {
            state.throughput.pop_front();
        }
        state.throughput.push_back(value);
        state.metrics.average_throughput =
            state.throughput.iter().sum::<f64>() / state.throughput.len() as f64;
    }

    fn publish(&self, metrics: PerformanceMetrics) {
        self.events.emit(QueueEvent::PerformanceUpdate { metrics });
    }
}
