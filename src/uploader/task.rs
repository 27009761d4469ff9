// 上传文件记录定义
//
// QueuedFile 从入队到终态一直存在；ActiveUpload 只在文件被激活后存在，
// 暂停或被挂起时随记录保留，终态时销毁

use crate::error::FailureReason;
use crate::uploader::chunk::ChunkPlan;
use crate::uploader::transport::{UploadSource, UploadTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// 文件 ID
pub type FileId = String;

/// 文件状态
///
/// 正常流转：Queued → Active ⇄ Retrying → Completed | Failed，任意非终态 → Cancelled。
/// 允许回退的情况：
/// - Queued/Active/Retrying → Paused → Queued（用户暂停、恢复）
/// - Active/Retrying → Queued（并发上限收缩被挂起，保留进度；管理器关闭时被中止）
/// - Failed → Queued（手动重试）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// 等待中（含被挂起、等待重新激活的文件）
    Queued,
    /// 上传中
    Active,
    /// 已暂停
    Paused,
    /// 分片等待重试
    Retrying,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Failed | FileStatus::Cancelled
        )
    }

    /// 是否占用传输槽位
    pub fn is_running(&self) -> bool {
        matches!(self, FileStatus::Active | FileStatus::Retrying)
    }
}

/// 文件内容描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub content_type: String,
}

/// 入队请求
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub source: UploadSource,
    pub descriptor: FileDescriptor,
    pub size: u64,
    /// 优先级提示，越大越靠前；None 等同于 0
    pub priority: Option<i32>,
}

impl NewUpload {
    /// 从本地文件创建（读取文件大小，按扩展名推断媒体类型）
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, crate::error::TransferError> {
        let path = path.as_ref();
        let source = UploadSource::File(path.to_path_buf());
        let size = source.len().await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let content_type = content_type_for(&name).to_string();

        Ok(Self {
            source,
            descriptor: FileDescriptor { name, content_type },
            size,
            priority: None,
        })
    }

    /// 从内存数据创建
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let size = data.len() as u64;
        Self {
            source: UploadSource::Memory(Arc::new(data)),
            descriptor: FileDescriptor {
                name: name.into(),
                content_type: content_type.into(),
            },
            size,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// 按扩展名推断媒体类型
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// 队列中的文件
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub id: FileId,
    pub descriptor: FileDescriptor,
    pub size: u64,
    pub source: UploadSource,
    /// 优先级提示
    pub priority: i32,
    /// 到达序号（同优先级按此排序）
    pub seq: u64,
    pub status: FileStatus,
    /// 当前重试次数：各分片已重试次数的最大值，不超过 retry_attempts
    pub attempts: u32,
    /// 创建时间（Unix 毫秒）
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<FailureReason>,
    /// 完成后的产物 ID
    pub artifact_id: Option<String>,
}

impl QueuedFile {
    pub fn new(upload: NewUpload, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            descriptor: upload.descriptor,
            size: upload.size,
            source: upload.source,
            priority: upload.priority.unwrap_or(0),
            seq,
            status: FileStatus::Queued,
            attempts: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            completed_at: None,
            error: None,
            artifact_id: None,
        }
    }

    pub fn mark_active(&mut self) {
        self.status = FileStatus::Active;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    pub fn mark_completed(&mut self, artifact_id: String) {
        self.status = FileStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.artifact_id = Some(artifact_id);
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.status = FileStatus::Failed;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.error = Some(reason);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = FileStatus::Cancelled;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
    }
}

/// 激活后的上传状态
#[derive(Debug, Clone)]
pub struct ActiveUpload {
    pub session_id: String,
    pub target: UploadTarget,
    /// 当前上传目标的签发时间（用于估算有效期）
    pub target_issued_at: DateTime<Utc>,
    pub plan: ChunkPlan,
}

/// 进度快照（由 Worker 定期写入）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UploadProgress {
    pub transferred: u64,
    /// 字节/秒
    pub speed: u64,
    pub eta_secs: Option<u64>,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

/// 文件记录（队列内部共享）
#[derive(Debug)]
pub struct UploadRecord {
    pub file: QueuedFile,
    pub progress: UploadProgress,
    /// 暂停或被挂起时保留的上传状态
    pub retained: Option<ActiveUpload>,
}

impl UploadRecord {
    pub fn new(file: QueuedFile) -> Self {
        Self {
            file,
            progress: UploadProgress::default(),
            retained: None,
        }
    }

    /// Worker 切换 Active / Retrying；文件已离开运行状态时不覆盖
    pub fn set_running_status(&mut self, status: FileStatus) -> bool {
        if self.file.status.is_running() && status.is_running() {
            self.file.status = status;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> FileSnapshot {
        let file = &self.file;
        let progress = if file.status == FileStatus::Completed {
            100.0
        } else if file.size == 0 {
            0.0
        } else {
            (self.progress.transferred as f64 / file.size as f64) * 100.0
        };

        FileSnapshot {
            id: file.id.clone(),
            file_name: file.descriptor.name.clone(),
            content_type: file.descriptor.content_type.clone(),
            size: file.size,
            status: file.status,
            priority: file.priority,
            attempts: file.attempts,
            transferred: self.progress.transferred,
            speed: self.progress.speed,
            eta_secs: self.progress.eta_secs,
            progress,
            completed_chunks: self.progress.completed_chunks,
            total_chunks: self.progress.total_chunks,
            created_at: file.created_at,
            started_at: file.started_at,
            completed_at: file.completed_at,
            error: file.error.clone(),
            artifact_id: file.artifact_id.clone(),
        }
    }
}

/// 文件状态快照（getStatus 返回值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub id: FileId,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub status: FileStatus,
    pub priority: i32,
    pub attempts: u32,
    pub transferred: u64,
    pub speed: u64,
    pub eta_secs: Option<u64>,
    /// 百分比
    pub progress: f64,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(size: u64) -> QueuedFile {
        QueuedFile::new(NewUpload::from_bytes("a.mp4", "video/mp4", vec![0; size as usize]), 1)
    }

    #[test]
    fn test_file_creation() {
        let file = queued(1000);
        assert_eq!(file.status, FileStatus::Queued);
        assert_eq!(file.priority, 0);
        assert_eq!(file.size, 1000);
        assert!(file.started_at.is_none());
    }

    #[test]
    fn test_status_transitions() {
        let mut file = queued(10);
        file.mark_active();
        assert!(file.status.is_running());
        assert!(file.started_at.is_some());

        file.mark_failed(FailureReason::Network("timeout".to_string()));
        assert!(file.status.is_terminal());
        assert!(file.completed_at.is_some());
    }

    #[test]
    fn test_running_status_not_overwritten() {
        let mut record = UploadRecord::new(queued(10));
        record.file.mark_active();
        assert!(record.set_running_status(FileStatus::Retrying));
        assert_eq!(record.file.status, FileStatus::Retrying);

        record.file.status = FileStatus::Paused;
        assert!(!record.set_running_status(FileStatus::Active));
        assert_eq!(record.file.status, FileStatus::Paused);
    }

    #[test]
    fn test_snapshot_progress() {
        let mut record = UploadRecord::new(queued(1000));
        record.progress.transferred = 250;
        assert_eq!(record.snapshot().progress, 25.0);

        record.file.mark_completed("artifact-1".to_string());
        let snapshot = record.snapshot();
        assert_eq!(snapshot.progress, 100.0);
        assert_eq!(snapshot.artifact_id.as_deref(), Some("artifact-1"));
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(content_type_for("clip.MP4"), "video/mp4");
        assert_eq!(content_type_for("movie.mov"), "video/quicktime");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn test_priority_hint() {
        let upload = NewUpload::from_bytes("a", "text/plain", vec![1]).with_priority(5);
        assert_eq!(QueuedFile::new(upload, 0).priority, 5);
    }
}
