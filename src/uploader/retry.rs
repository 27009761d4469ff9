// 分片重试策略
//
// 第 n 次重试（n 从 1 开始）等待 base * 2^(n-1)，重试次数不超过 retry_attempts；
// 限流（429）同样使用该公式

use crate::config::QueueConfig;
use std::time::Duration;

/// 单次退避等待上限，防止 2^n 溢出后的异常值
pub const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// 计算第 attempt 次重试的等待时间（attempt 从 1 开始，0 按 1 处理）
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.max(1) - 1;
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// 重试策略（取自激活时的配置快照）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            base_delay: config.base_retry_delay(),
        }
    }

    /// 第 attempt 次重试的等待时间；超过重试上限返回 None
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(backoff_delay(self.base_delay, attempt))
    }
}
