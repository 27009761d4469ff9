// 外部协作方接口
//
// 上传队列只依赖三个窄接口：
// - SessionService：创建上传会话
// - UploadTargetIssuer：申请（过期后重新申请）上传目标，全部分片完成后合并
// - ChunkTransport：把一个字节范围 PUT 到上传目标并报告已发送字节数

use crate::error::TransferError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 上传数据来源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    File(PathBuf),
    /// 内存数据
    Memory(Arc<Vec<u8>>),
}

impl UploadSource {
    /// 读取指定字节范围
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, TransferError> {
        let len = (range.end - range.start) as usize;
        match self {
            UploadSource::Memory(data) => {
                let start = range.start as usize;
                data.get(start..start + len)
                    .map(|slice| slice.to_vec())
                    .ok_or_else(|| {
                        TransferError::local(format!(
                            "读取范围越界: {}-{} (数据长度 {})",
                            range.start,
                            range.end,
                            data.len()
                        ))
                    })
            }
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await.map_err(|e| {
                    TransferError::local(format!("打开上传文件失败 {:?}: {}", path, e))
                })?;
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .map_err(|e| TransferError::local(format!("文件定位失败: {}", e)))?;

                let mut buffer = vec![0u8; len];
                file.read_exact(&mut buffer)
                    .await
                    .map_err(|e| TransferError::local(format!("读取分片数据失败: {}", e)))?;

                debug!(
                    "读取分片数据: {:?} bytes={}-{}, 大小={} bytes",
                    path, range.start, range.end, len
                );
                Ok(buffer)
            }
        }
    }

    /// 数据总长度
    pub async fn len(&self) -> Result<u64, TransferError> {
        match self {
            UploadSource::Memory(data) => Ok(data.len() as u64),
            UploadSource::File(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .map_err(|e| TransferError::local(format!("读取文件信息失败 {:?}: {}", path, e))),
        }
    }
}

/// 会话元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub title: String,
    pub file_count: usize,
    pub total_size: u64,
}

/// 上传目标申请参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTargetRequest {
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
}

/// 上传目标（预签名地址）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub upload_id: String,
    /// 分片 PUT 地址
    #[serde(alias = "transferTarget")]
    pub url: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub chunk_size_hint: Option<u64>,
}

impl UploadTarget {
    /// 在 margin 之内即将过期也视为过期
    pub fn is_expired(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + margin >= self.expires_at
    }
}

/// 分片上传回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub index: usize,
    pub size: u64,
    /// 服务器返回的分片标识（ETag 等）
    #[serde(default)]
    pub etag: Option<String>,
}

/// 单个分片的 PUT 请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub target: UploadTarget,
    pub index: usize,
    pub range: Range<u64>,
    /// 文件总大小（用于 Content-Range）
    pub total_size: u64,
    pub data: Vec<u8>,
}

/// 分片已发送字节数
///
/// 传输实现边发送边累加；重试前由调用方清零
#[derive(Debug, Clone, Default)]
pub struct ProgressSink(Arc<AtomicU64>);

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.set(0);
    }
}

/// 会话服务
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(&self, metadata: &SessionMetadata) -> Result<String, TransferError>;
}

/// 上传目标签发
#[async_trait]
pub trait UploadTargetIssuer: Send + Sync {
    async fn request_upload_target(
        &self,
        session_id: &str,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError>;

    /// 全部分片完成后的合并步骤，返回最终产物 ID
    async fn complete_upload(
        &self,
        target: &UploadTarget,
        _parts: &[ChunkReceipt],
    ) -> Result<String, TransferError> {
        Ok(target.upload_id.clone())
    }
}

/// 分片传输
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn put_chunk(
        &self,
        request: ChunkRequest,
        progress: ProgressSink,
    ) -> Result<ChunkReceipt, TransferError>;
}

/// 外部协作方集合
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionService>,
    pub issuer: Arc<dyn UploadTargetIssuer>,
    pub transport: Arc<dyn ChunkTransport>,
}

impl Collaborators {
    pub fn new(
        sessions: Arc<dyn SessionService>,
        issuer: Arc<dyn UploadTargetIssuer>,
        transport: Arc<dyn ChunkTransport>,
    ) -> Self {
        Self {
            sessions,
            issuer,
            transport,
        }
    }

    /// 同一个对象同时实现三个接口时使用（例如 HttpUploadClient）
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: SessionService + UploadTargetIssuer + ChunkTransport + 'static,
    {
        Self {
            sessions: client.clone(),
            issuer: client.clone(),
            transport: client,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
