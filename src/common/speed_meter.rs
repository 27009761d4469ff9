//! 速度与剩余时间估算
//!
//! 核心机制：
//! 1. 只在两次采样间隔达到最小值时计算瞬时速度，避免相邻回调产生的尖峰
//! 2. 瞬时速度经指数加权平均（EWMA）平滑
//! 3. 速度接近零时 ETA 为 None，否则限制在上限以内

use std::time::{Duration, Instant};
use tracing::trace;

/// 速度估算配置
#[derive(Clone, Debug)]
pub struct SpeedMeterConfig {
    /// 两次有效采样的最小间隔
    pub min_sample_interval: Duration,
    /// 平滑系数（0~1，越大越偏向最新样本）
    pub alpha: f64,
    /// 低于此速度视为停止（字节/秒）
    pub min_speed: f64,
    /// ETA 上限（秒）
    pub max_eta_secs: u64,
}

impl Default for SpeedMeterConfig {
    fn default() -> Self {
        Self {
            min_sample_interval: Duration::from_millis(500),
            alpha: 0.3,
            min_speed: 1.0,
            max_eta_secs: 7 * 24 * 3600, // 7天
        }
    }
}

/// 单文件速度估算器
#[derive(Debug)]
pub struct SpeedMeter {
    config: SpeedMeterConfig,
    /// 上一次有效采样（时间，累计字节）
    last_sample: Option<(Instant, u64)>,
    /// 平滑后的速度（字节/秒）
    speed: f64,
    /// 是否已有第一个速度样本
    warmed_up: bool,
}

impl SpeedMeter {
    pub fn new(config: SpeedMeterConfig) -> Self {
        Self {
            config,
            last_sample: None,
            speed: 0.0,
            warmed_up: false,
        }
    }

    pub fn with_interval(min_sample_interval: Duration) -> Self {
        Self::new(SpeedMeterConfig {
            min_sample_interval,
            ..Default::default()
        })
    }

    /// 记录累计字节数
    ///
    /// 距离上次有效采样不足最小间隔时忽略，返回当前速度（字节/秒）
    pub fn sample(&mut self, now: Instant, total_bytes: u64) -> u64 {
        let (last_at, last_bytes) = match self.last_sample {
            Some(last) => last,
            None => {
                self.last_sample = Some((now, total_bytes));
                return self.speed();
            }
        };

        let elapsed = now.saturating_duration_since(last_at);
        if elapsed < self.config.min_sample_interval || elapsed.is_zero() {
            return self.speed();
        }

        // 重试会回退分片进度，此时本次增量按 0 计
        let delta = total_bytes.saturating_sub(last_bytes);
        let instant_speed = delta as f64 / elapsed.as_secs_f64();

        if self.warmed_up {
            self.speed = self.config.alpha * instant_speed + (1.0 - self.config.alpha) * self.speed;
        } else {
            self.speed = instant_speed;
            self.warmed_up = true;
        }
        self.last_sample = Some((now, total_bytes));

        trace!(
            "速度采样: 增量 {} bytes / {:?}, 瞬时 {:.0} B/s, 平滑 {:.0} B/s",
            delta,
            elapsed,
            instant_speed,
            self.speed
        );

        self.speed()
    }

    /// 当前速度（字节/秒）
    pub fn speed(&self) -> u64 {
        if self.speed < self.config.min_speed {
            0
        } else {
            self.speed.round() as u64
        }
    }

    /// 剩余时间估算（秒），速度接近零时返回 None
    pub fn eta(&self, remaining_bytes: u64) -> Option<u64> {
        if self.speed < self.config.min_speed {
            return None;
        }
        let secs = (remaining_bytes as f64 / self.speed).ceil();
        Some((secs as u64).min(self.config.max_eta_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter() -> SpeedMeter {
        SpeedMeter::with_interval(Duration::from_millis(500))
    }

    #[test]
    fn test_first_sample_has_no_speed() {
        let mut m = meter();
        assert_eq!(m.sample(Instant::now(), 1024), 0);
        assert_eq!(m.eta(1024), None);
    }

    #[test]
    fn test_close_samples_ignored() {
        let mut m = meter();
        let t0 = Instant::now();
        m.sample(t0, 0);
        // 10ms 后的回调不产生速度尖峰
        assert_eq!(m.sample(t0 + Duration::from_millis(10), 10 * 1024 * 1024), 0);

        let speed = m.sample(t0 + Duration::from_secs(1), 1_000_000);
        assert_eq!(speed, 1_000_000);
    }

    #[test]
    fn test_ewma_smoothing() {
        let mut m = meter();
        let t0 = Instant::now();
        m.sample(t0, 0);
        m.sample(t0 + Duration::from_secs(1), 1000);
        // 第二秒瞬时 2000 B/s，平滑后 0.3*2000 + 0.7*1000 = 1300
        let speed = m.sample(t0 + Duration::from_secs(2), 3000);
        assert_eq!(speed, 1300);
    }

    #[test]
    fn test_eta_clamped() {
        let mut m = SpeedMeter::new(SpeedMeterConfig {
            min_sample_interval: Duration::from_millis(100),
            max_eta_secs: 3600,
            ..Default::default()
        });
        let t0 = Instant::now();
        m.sample(t0, 0);
        m.sample(t0 + Duration::from_secs(1), 2);

        assert_eq!(m.eta(10), Some(5));
        assert_eq!(m.eta(u64::MAX / 2), Some(3600));
    }

    #[test]
    fn test_bytes_going_backwards() {
        let mut m = meter();
        let t0 = Instant::now();
        m.sample(t0, 5000);
        let speed = m.sample(t0 + Duration::from_secs(1), 1000);
        assert_eq!(speed, 0);
        assert_eq!(m.eta(1000), None);
    }
}
