// 上传队列模块
//
// - scheduler: 等待队列排序（fifo / smallest_first / largest_first + 优先级提示）
// - concurrency: 有效并发上限（静态配置 ∩ 网络状况 ∩ 自适应推荐）
// - performance: 传输表现统计与推荐并发
// - worker: 单文件分片上传状态机
// - manager: 公共 API 与调度循环

pub mod chunk;
pub mod concurrency;
pub mod manager;
pub mod performance;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod transport;
pub mod worker;

pub use chunk::{ChunkPlan, ChunkState, UploadChunk};
pub use concurrency::{network_caps, ConcurrencyController, EffectiveLimits};
pub use manager::{ManagerOptions, UploadQueueManager};
pub use performance::{PerformanceMetrics, PerformanceTracker};
pub use retry::{backoff_delay, RetryPolicy, MAX_BACKOFF};
pub use scheduler::{rank_files, PriorityScheduler, SharedRecord};
pub use task::{
    content_type_for, ActiveUpload, FileDescriptor, FileId, FileSnapshot, FileStatus, NewUpload,
    QueuedFile, UploadProgress, UploadRecord,
};
pub use transport::{
    ChunkReceipt, ChunkRequest, ChunkTransport, Collaborators, ProgressSink, SessionMetadata,
    SessionService, UploadSource, UploadTarget, UploadTargetIssuer, UploadTargetRequest,
};
pub use worker::{WorkerControl, WorkerOutcome, WorkerReport};
