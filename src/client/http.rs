// 基于 reqwest 的上传接口客户端
//
// 接口约定：
// - POST {base}/upload-sessions                      创建会话
// - POST {base}/upload-sessions/{session}/targets    申请上传目标（预签名地址）
// - PUT  {target.url}                                分片上传，带 Content-Range
// - POST {base}/uploads/{upload_id}/complete         合并分片，返回产物 ID

use crate::config::ApiConfig;
use crate::error::{TransferError, TransferErrorKind};
use crate::uploader::transport::{
    ChunkReceipt, ChunkRequest, ChunkTransport, ProgressSink, SessionMetadata, SessionService,
    UploadTarget, UploadTargetIssuer, UploadTargetRequest,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 分片请求体按此大小切片发送，每发出一片更新一次进度
pub const STREAM_SLICE_SIZE: usize = 64 * 1024;

const USER_AGENT: &str = concat!("upload-queue/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(alias = "sessionId", alias = "session_id")]
    id: String,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    parts: &'a [ChunkReceipt],
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    #[serde(alias = "artifactId", alias = "artifact_id")]
    id: String,
}

/// 上传接口客户端
#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    client: Client,
    base_url: String,
    chunk_timeout: Duration,
}

impl HttpUploadClient {
    /// 创建客户端
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.access_token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .context("访问令牌包含非法字符")?;
            headers.insert(AUTHORIZATION, value);
        }

        // 分片 PUT 在请求上单独覆盖超时
        let request_timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化上传客户端: base_url={}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chunk_timeout: Duration::from_secs(config.chunk_timeout_secs.max(1)),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// 发送 JSON 请求并解析响应，非 2xx 按状态码分类
    async fn send_json<T: DeserializeOwned>(
        &self,
        step: &str,
        request: RequestBuilder,
    ) -> Result<T, TransferError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let response = check_status(step, response).await?;
        let text = response.text().await.map_err(map_reqwest_error)?;
        debug!("{} 响应: {}", step, text);

        serde_json::from_str(&text).map_err(|e| {
            TransferError::new(
                TransferErrorKind::ServerError,
                format!("解析{}响应失败: {}", step, e),
            )
        })
    }
}

#[async_trait]
impl SessionService for HttpUploadClient {
    async fn create_session(&self, metadata: &SessionMetadata) -> Result<String, TransferError> {
        let url = self.endpoint("upload-sessions");
        let response: SessionResponse = self
            .send_json("创建会话", self.client.post(&url).json(metadata))
            .await?;
        Ok(response.id)
    }
}

#[async_trait]
impl UploadTargetIssuer for HttpUploadClient {
    async fn request_upload_target(
        &self,
        session_id: &str,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError> {
        let url = self.endpoint(&format!(
            "upload-sessions/{}/targets",
            urlencoding::encode(session_id)
        ));
        self.send_json("申请上传目标", self.client.post(&url).json(request))
            .await
    }

    async fn complete_upload(
        &self,
        target: &UploadTarget,
        parts: &[ChunkReceipt],
    ) -> Result<String, TransferError> {
        let url = self.endpoint(&format!(
            "uploads/{}/complete",
            urlencoding::encode(&target.upload_id)
        ));
        let response: CompleteResponse = self
            .send_json("合并分片", self.client.post(&url).json(&CompleteRequest { parts }))
            .await?;
        Ok(response.id)
    }
}

#[async_trait]
impl ChunkTransport for HttpUploadClient {
    async fn put_chunk(
        &self,
        request: ChunkRequest,
        progress: ProgressSink,
    ) -> Result<ChunkReceipt, TransferError> {
        let ChunkRequest {
            target,
            index,
            range,
            total_size,
            data,
        } = request;
        let size = data.len() as u64;

        debug!(
            "上传分片: upload_id={}, part={}, range={:?}, size={}",
            target.upload_id, index, range, size
        );

        let response = self
            .client
            .put(&target.url)
            .timeout(self.chunk_timeout)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_RANGE, content_range(&range, total_size))
            .body(streaming_body(data, progress.clone()))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let response = check_status("分片上传", response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        // 服务器确认后才算全部发送完成
        progress.set(size);
        debug!("分片上传成功: part={}, etag={:?}", index, etag);

        Ok(ChunkReceipt { index, size, etag })
    }
}

/// Content-Range 头（空文件使用 `bytes */0`）
fn content_range(range: &Range<u64>, total_size: u64) -> String {
    if range.end <= range.start {
        format!("bytes */{}", total_size)
    } else {
        format!("bytes {}-{}/{}", range.start, range.end - 1, total_size)
    }
}

/// 把分片数据切成小片，每被取走一片累加进度
fn progress_slices(
    data: Vec<u8>,
    progress: ProgressSink,
) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send + Sync + 'static {
    let slices: Vec<Vec<u8>> = data
        .chunks(STREAM_SLICE_SIZE)
        .map(|slice| slice.to_vec())
        .collect();
    futures::stream::iter(slices.into_iter().map(move |slice| {
        progress.add(slice.len() as u64);
        Ok(slice)
    }))
}

fn streaming_body(data: Vec<u8>, progress: ProgressSink) -> reqwest::Body {
    reqwest::Body::wrap_stream(progress_slices(data, progress))
}

/// 非 2xx 响应转换为 TransferError
async fn check_status(step: &str, response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = TransferError::from_status(status.as_u16(), &body);
    warn!("{}失败: {}", step, error);
    Err(error)
}

fn map_reqwest_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::timeout(e.to_string())
    } else if let Some(status) = e.status() {
        TransferError::from_status(status.as_u16(), &e.to_string())
    } else {
        TransferError::network(e.to_string())
    }
}
