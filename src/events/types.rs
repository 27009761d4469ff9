//! 队列事件类型定义
//!
//! 所有生命周期通知都是 `QueueEvent` 的一个变体，订阅方可以穷尽匹配

use crate::config::QueueConfig;
use crate::error::FailureReason;
use crate::network::NetworkMetrics;
use crate::uploader::{EffectiveLimits, PerformanceMetrics};
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、取消等关键事件
    High = 2,
}

/// 事件名称（订阅键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Started,
    Progress,
    Retried,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Resumed,
    Throttled,
    Stalled,
    NetworkChanged,
    PerformanceUpdate,
    LimitsChanged,
    ConfigUpdated,
}

/// 队列事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// 文件进入等待队列
    Queued {
        file_id: String,
        file_name: String,
        file_size: u64,
    },
    /// 文件被激活，开始（或继续）上传
    Started {
        file_id: String,
        /// 继续上传时已保留的字节数
        resumed_bytes: u64,
        total_chunks: usize,
    },
    /// 进度更新
    Progress {
        file_id: String,
        transferred: u64,
        total_size: u64,
        /// 字节/秒
        speed: u64,
        /// 剩余秒数，None 表示无法估算
        eta_secs: Option<u64>,
        progress: f64,
        completed_chunks: usize,
        total_chunks: usize,
    },
    /// 分片重试
    Retried {
        file_id: String,
        chunk_index: usize,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// 上传完成
    Completed {
        file_id: String,
        artifact_id: String,
        transferred: u64,
        completed_at: i64,
    },
    /// 上传失败（终态）
    Failed {
        file_id: String,
        reason: FailureReason,
    },
    /// 已取消
    Cancelled { file_id: String },
    /// 已暂停
    Paused { file_id: String },
    /// 已恢复（重新排队）
    Resumed { file_id: String },
    /// 因并发上限收缩被挂起，保留进度重新排队
    Throttled { file_id: String },
    /// 疑似卡住（仅诊断，不影响传输）
    Stalled {
        file_id: String,
        idle_secs: u64,
        transferred: u64,
    },
    /// 网络状况变化
    NetworkChanged { metrics: NetworkMetrics },
    /// 性能统计更新
    PerformanceUpdate { metrics: PerformanceMetrics },
    /// 有效并发上限变化
    LimitsChanged { limits: EffectiveLimits },
    /// 配置已更新
    ConfigUpdated { config: QueueConfig },
}

impl QueueEvent {
    /// 事件名称
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::Queued { .. } => EventKind::Queued,
            QueueEvent::Started { .. } => EventKind::Started,
            QueueEvent::Progress { .. } => EventKind::Progress,
            QueueEvent::Retried { .. } => EventKind::Retried,
            QueueEvent::Completed { .. } => EventKind::Completed,
            QueueEvent::Failed { .. } => EventKind::Failed,
            QueueEvent::Cancelled { .. } => EventKind::Cancelled,
            QueueEvent::Paused { .. } => EventKind::Paused,
            QueueEvent::Resumed { .. } => EventKind::Resumed,
            QueueEvent::Throttled { .. } => EventKind::Throttled,
            QueueEvent::Stalled { .. } => EventKind::Stalled,
            QueueEvent::NetworkChanged { .. } => EventKind::NetworkChanged,
            QueueEvent::PerformanceUpdate { .. } => EventKind::PerformanceUpdate,
            QueueEvent::LimitsChanged { .. } => EventKind::LimitsChanged,
            QueueEvent::ConfigUpdated { .. } => EventKind::ConfigUpdated,
        }
    }

    /// 关联的文件 ID（全局事件返回 None）
    pub fn file_id(&self) -> Option<&str> {
        match self {
            QueueEvent::Queued { file_id, .. }
            | QueueEvent::Started { file_id, .. }
            | QueueEvent::Progress { file_id, .. }
            | QueueEvent::Retried { file_id, .. }
            | QueueEvent::Completed { file_id, .. }
            | QueueEvent::Failed { file_id, .. }
            | QueueEvent::Cancelled { file_id }
            | QueueEvent::Paused { file_id }
            | QueueEvent::Resumed { file_id }
            | QueueEvent::Throttled { file_id }
            | QueueEvent::Stalled { file_id, .. } => Some(file_id),
            QueueEvent::NetworkChanged { .. }
            | QueueEvent::PerformanceUpdate { .. }
            | QueueEvent::LimitsChanged { .. }
            | QueueEvent::ConfigUpdated { .. } => None,
        }
    }

    /// 事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            QueueEvent::Progress { .. } | QueueEvent::PerformanceUpdate { .. } => {
                EventPriority::Low
            }
            QueueEvent::Completed { .. }
            | QueueEvent::Failed { .. }
            | QueueEvent::Cancelled { .. } => EventPriority::High,
            _ => EventPriority::Medium,
        }
    }

    /// 是否为终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEvent::Completed { .. } | QueueEvent::Failed { .. } | QueueEvent::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = QueueEvent::Retried {
            file_id: "f1".to_string(),
            chunk_index: 1,
            attempt: 2,
            delay_ms: 400,
            error: "timeout".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "retried");
        assert_eq!(json["delay_ms"], 400);
        assert_eq!(event.kind(), EventKind::Retried);
        assert_eq!(event.file_id(), Some("f1"));
    }

    #[test]
    fn test_failed_event_carries_category() {
        let event = QueueEvent::Failed {
            file_id: "f2".to_string(),
            reason: FailureReason::Validation("HTTP 415".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["reason"]["category"], "validation");
        assert!(event.is_terminal());
        assert_eq!(event.priority(), EventPriority::High);
    }
}
