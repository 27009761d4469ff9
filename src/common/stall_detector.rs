//! 卡住检测器
//!
//! 文件处于上传状态但累计字节长时间不增长时报告一次，进度恢复后重新计时。
//! 只用于诊断，不会中断传输

use std::time::{Duration, Instant};
use tracing::debug;

/// 单文件卡住检测器
#[derive(Debug)]
pub struct StallDetector {
    threshold: Duration,
    last_progress_at: Instant,
    last_bytes: u64,
    /// 本轮停滞是否已经报告过
    reported: bool,
}

impl StallDetector {
    pub fn new(threshold: Duration, now: Instant, bytes: u64) -> Self {
        Self {
            threshold,
            last_progress_at: now,
            last_bytes: bytes,
            reported: false,
        }
    }

    /// 观察一次进度
    ///
    /// # 参数
    /// * `paused` - 暂停期间不计入停滞，恢复后重新计时
    ///
    /// # 返回
    /// - `Some(idle)`: 本轮停滞首次超过阈值
    /// - `None`: 正常，或本轮已报告过
    pub fn observe(&mut self, now: Instant, bytes: u64, paused: bool) -> Option<Duration> {
        if paused || bytes > self.last_bytes {
            if self.reported && !paused {
                debug!("传输已恢复: {} bytes", bytes);
            }
            self.last_progress_at = now;
            self.last_bytes = bytes;
            self.reported = false;
            return None;
        }

        // 重试回退了分片进度，重新计时
        if bytes < self.last_bytes {
            self.last_bytes = bytes;
            self.last_progress_at = now;
            return None;
        }

        let idle = now.saturating_duration_since(self.last_progress_at);
        if idle >= self.threshold && !self.reported {
            self.reported = true;
            return Some(idle);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_episode() {
        let t0 = Instant::now();
        let mut d = StallDetector::new(Duration::from_secs(30), t0, 0);

        assert!(d.observe(t0 + Duration::from_secs(10), 0, false).is_none());
        let idle = d.observe(t0 + Duration::from_secs(31), 0, false);
        assert_eq!(idle, Some(Duration::from_secs(31)));
        // 同一轮停滞不重复报告
        assert!(d.observe(t0 + Duration::from_secs(60), 0, false).is_none());

        // 进度恢复后重新计时
        assert!(d.observe(t0 + Duration::from_secs(61), 100, false).is_none());
        assert!(d.observe(t0 + Duration::from_secs(95), 100, false).is_some());
    }

    #[test]
    fn test_paused_is_not_stalled() {
        let t0 = Instant::now();
        let mut d = StallDetector::new(Duration::from_secs(5), t0, 0);

        assert!(d.observe(t0 + Duration::from_secs(60), 0, true).is_none());
        // 暂停结束后从零计时
        assert!(d.observe(t0 + Duration::from_secs(62), 0, false).is_none());
        assert!(d.observe(t0 + Duration::from_secs(64), 0, false).is_none());
        assert!(d.observe(t0 + Duration::from_secs(65), 0, false).is_some());
    }
}
