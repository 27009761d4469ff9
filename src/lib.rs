// Adaptive Upload Queue
// 自适应上传队列：按网络状况和传输表现调整并发的分片上传调度器

// 上传接口客户端
pub mod client;

// 公共工具（测速、卡顿检测）
pub mod common;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 队列事件
pub mod events;

// 日志
pub mod logging;

// 网络状况监测
pub mod network;

// 上传队列
pub mod uploader;

// 导出常用类型
pub use client::HttpUploadClient;
pub use config::{AppConfig, PriorityMode, QueueConfig, QueueConfigPatch};
pub use error::{FailureReason, QueueError, TransferError, TransferErrorKind};
pub use events::{EventBus, EventKind, QueueEvent};
pub use network::{ConnectionClass, NetworkMetrics, NetworkMonitor, StaticProbe};
pub use uploader::{
    Collaborators, EffectiveLimits, FileSnapshot, FileStatus, ManagerOptions, NewUpload,
    PerformanceMetrics, UploadQueueManager,
};
