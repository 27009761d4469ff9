//! 进度事件节流器
//!
//! 每个上传文件一个节流器，多个分片共享，避免进度事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 时间戳以节流器创建时刻为零点，存为纳秒；0 表示从未发布过
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次发布时间（相对 origin 的纳秒 + 1，0 表示未发布）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 距离上次发布超过间隔时返回 true 并记录本次发布
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（完成时的最后一次进度）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos.store(self.now_nanos(), Ordering::Relaxed);
        true
    }

    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 + 1
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
