// 错误类型定义
//
// 三层错误：
// - TransferError：单次传输（分片 PUT / 上传目标申请）的失败，用于重试分类
// - FailureReason：文件进入 failed 终态时对调用方可见的原因
// - QueueError：公共 API 误用（任务不存在、状态不允许等）

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 传输错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferErrorKind {
    /// 网络错误（连接断开、DNS 等，可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误 5xx（可重试）
    ServerError,
    /// 限流 429（可重试）
    RateLimited,
    /// 参数错误 / 校验失败（不可重试）
    BadRequest,
    /// 文件被拒绝：类型不支持、权限不足等（不可重试）
    Rejected,
    /// 文件过大（不可重试）
    TooLarge,
    /// 上传目标已过期（需要重新申请，不计入重试）
    Expired,
    /// 本地读取失败（不可重试）
    Local,
    /// 未知错误（按网络错误处理，可重试）
    Unknown,
}

impl TransferErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransferErrorKind::Network
                | TransferErrorKind::Timeout
                | TransferErrorKind::ServerError
                | TransferErrorKind::RateLimited
                | TransferErrorKind::Unknown
        )
    }

    /// 根据 HTTP 状态码分类
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => TransferErrorKind::Timeout,
            410 => TransferErrorKind::Expired,
            413 => TransferErrorKind::TooLarge,
            429 => TransferErrorKind::RateLimited,
            400 | 409 | 411 | 412 | 416 | 422 => TransferErrorKind::BadRequest,
            401 | 403 | 404 | 405 | 415 => TransferErrorKind::Rejected,
            500..=599 => TransferErrorKind::ServerError,
            _ => TransferErrorKind::Unknown,
        }
    }
}

/// 单次传输失败
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Timeout, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Expired, message)
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self::new(TransferErrorKind::Local, message)
    }

    /// 从 HTTP 状态码和响应体构造
    ///
    /// 预签名地址过期时对象存储通常返回 403 + "Request has expired"，
    /// 这种情况归类为 Expired 而不是 Rejected
    pub fn from_status(status: u16, body: &str) -> Self {
        let mut kind = TransferErrorKind::from_status(status);
        if status == 403 && body.to_lowercase().contains("expired") {
            kind = TransferErrorKind::Expired;
        }
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            body.chars().take(512).collect()
        };
        Self {
            kind,
            status: Some(status),
            message,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_expired(&self) -> bool {
        self.kind == TransferErrorKind::Expired
    }
}

/// 失败原因类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Network,
    Validation,
    Expired,
    Internal,
}

/// 终态失败原因（对调用方可见）
///
/// 调用方据此决定是否提供"手动重试"：网络类失败通常值得重试，校验类失败不值得
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("网络错误: {0}")]
    Network(String),
    #[error("校验失败: {0}")]
    Validation(String),
    #[error("上传地址已过期: {0}")]
    Expired(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

impl FailureReason {
    pub fn category(&self) -> FailureCategory {
        match self {
            FailureReason::Network(_) => FailureCategory::Network,
            FailureReason::Validation(_) => FailureCategory::Validation,
            FailureReason::Expired(_) => FailureCategory::Expired,
            FailureReason::Internal(_) => FailureCategory::Internal,
        }
    }

    /// 是否建议提供手动重试
    pub fn is_retry_suggested(&self) -> bool {
        !matches!(self, FailureReason::Validation(_))
    }
}

impl From<&TransferError> for FailureReason {
    fn from(e: &TransferError) -> Self {
        match e.kind {
            TransferErrorKind::Expired => FailureReason::Expired(e.to_string()),
            TransferErrorKind::Local => FailureReason::Internal(e.to_string()),
            TransferErrorKind::BadRequest
            | TransferErrorKind::Rejected
            | TransferErrorKind::TooLarge => FailureReason::Validation(e.to_string()),
            _ => FailureReason::Network(e.to_string()),
        }
    }
}

/// 公共 API 错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("任务不存在: {0}")]
    NotFound(String),
    #[error("任务 {id} 当前状态 {status} 不支持该操作")]
    InvalidState { id: String, status: String },
    #[error("配置无效: {0}")]
    InvalidConfig(String),
    #[error("上传队列已关闭")]
    Shutdown,
}

/// 文件状态的简短显示，用于 InvalidState
pub(crate) fn status_label(status: impl fmt::Debug) -> String {
    format!("{:?}", status).to_lowercase()
}
