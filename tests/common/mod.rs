// 集成测试用的内存协作方
//
// ScriptedClient 同时实现三个协作接口：
// - 分片失败脚本：按 (文件名, 分片序号) 预置若干次失败
// - gate：关闭时分片 PUT 一直等待，用于观察在途状态
// - 统计最大在途分片数、上传目标申请次数
// - 可设置上传目标有效期，或让某个文件的 PUT 一律报告目标过期

#![allow(dead_code)]

use adaptive_upload_queue::uploader::{
    ChunkReceipt, ChunkRequest, ChunkTransport, ProgressSink, SessionMetadata, SessionService,
    UploadTarget, UploadTargetIssuer, UploadTargetRequest,
};
use adaptive_upload_queue::{
    Collaborators, EventKind, QueueEvent, StaticProbe, TransferError, UploadQueueManager,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const MB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct PutRecord {
    pub upload_id: String,
    pub index: usize,
    pub len: usize,
}

pub struct ScriptedClient {
    /// upload_id -> 分片序号 -> 依次返回的错误
    failures: Mutex<HashMap<(String, usize), VecDeque<TransferError>>>,
    /// 文件名 -> 已签发的上传目标次数
    targets_issued: DashMap<String, usize>,
    /// PUT 一律返回 403 过期的文件名
    always_expired: Mutex<HashSet<String>>,
    target_lifetime: Mutex<chrono::Duration>,
    gate: watch::Sender<bool>,
    put_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    puts: Mutex<Vec<PutRecord>>,
    sessions: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            targets_issued: DashMap::new(),
            always_expired: Mutex::new(HashSet::new()),
            target_lifetime: Mutex::new(chrono::Duration::hours(1)),
            gate,
            put_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            puts: Mutex::new(Vec::new()),
            sessions: AtomicUsize::new(0),
        })
    }

    /// 文件 `file_name` 的第 `index` 个分片依次返回这些错误
    pub fn fail_chunk(&self, file_name: &str, index: usize, errors: Vec<TransferError>) {
        self.failures
            .lock()
            .insert((upload_id_for(file_name, 1), index), errors.into());
    }

    /// 指定版本的上传目标在分片 PUT 时报告过期
    pub fn expire_target(&self, file_name: &str, generation: usize, index: usize) {
        self.failures.lock().insert(
            (upload_id_for(file_name, generation), index),
            VecDeque::from(vec![TransferError::expired("Request has expired")]),
        );
    }

    /// 文件 `file_name` 的所有 PUT 都被服务端以过期拒绝（新签发的目标也一样）
    pub fn always_expire(&self, file_name: &str) {
        self.always_expired.lock().insert(file_name.to_string());
    }

    /// 之后签发的上传目标的有效期
    pub fn set_target_lifetime(&self, lifetime: Duration) {
        *self.target_lifetime.lock() =
            chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::hours(1));
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn targets_issued(&self, file_name: &str) -> usize {
        self.targets_issued.get(file_name).map(|v| *v).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.puts.lock().clone()
    }
}

fn upload_id_for(file_name: &str, generation: usize) -> String {
    format!("{}#{}", file_name, generation)
}

#[async_trait]
impl SessionService for ScriptedClient {
    async fn create_session(&self, _metadata: &SessionMetadata) -> Result<String, TransferError> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("session-{}", n))
    }
}

#[async_trait]
impl UploadTargetIssuer for ScriptedClient {
    async fn request_upload_target(
        &self,
        _session_id: &str,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError> {
        let generation = {
            let mut issued = self
                .targets_issued
                .entry(request.file_name.clone())
                .or_insert(0);
            *issued += 1;
            *issued
        };
        Ok(UploadTarget {
            upload_id: upload_id_for(&request.file_name, generation),
            url: format!("memory://{}", request.file_name),
            expires_at: chrono::Utc::now() + *self.target_lifetime.lock(),
            chunk_size_hint: None,
        })
    }

    async fn complete_upload(
        &self,
        target: &UploadTarget,
        parts: &[ChunkReceipt],
    ) -> Result<String, TransferError> {
        Ok(format!("artifact:{}:{}", target.upload_id, parts.len()))
    }
}

#[async_trait]
impl ChunkTransport for ScriptedClient {
    async fn put_chunk(
        &self,
        request: ChunkRequest,
        progress: ProgressSink,
    ) -> Result<ChunkReceipt, TransferError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.transfer(&request, &progress).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedClient {
    async fn transfer(
        &self,
        request: &ChunkRequest,
        progress: &ProgressSink,
    ) -> Result<ChunkReceipt, TransferError> {
        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(TransferError::network("gate dropped"));
        }

        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            progress.set(request.data.len() as u64 / 2);
            tokio::time::sleep(delay).await;
        }

        let file_name = request
            .target
            .upload_id
            .rsplit_once('#')
            .map(|(name, _)| name.to_string())
            .unwrap_or_default();
        if self.always_expired.lock().contains(&file_name) {
            return Err(TransferError::from_status(403, "Request has expired"));
        }

        let scripted = self
            .failures
            .lock()
            .get_mut(&(request.target.upload_id.clone(), request.index))
            .and_then(|errors| errors.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        self.puts.lock().push(PutRecord {
            upload_id: request.target.upload_id.clone(),
            index: request.index,
            len: request.data.len(),
        });
        progress.set(request.data.len() as u64);
        Ok(ChunkReceipt {
            index: request.index,
            size: request.data.len() as u64,
            etag: Some(format!("etag-{}", request.index)),
        })
    }
}

/// 收集指定事件
pub fn collect(manager: &UploadQueueManager, kinds: &[EventKind]) -> Arc<Mutex<Vec<QueueEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let kinds = kinds.to_vec();
    let sink = events.clone();
    manager.events().on_any(move |event| {
        if kinds.contains(&event.kind()) {
            sink.lock().push(event.clone());
        }
    });
    events
}

pub fn collaborators(client: &Arc<ScriptedClient>) -> Collaborators {
    Collaborators::from_client(client.clone())
}

pub fn broadband() -> Arc<StaticProbe> {
    Arc::new(StaticProbe::new(adaptive_upload_queue::ConnectionClass::Broadband))
}

/// 轮询直到条件成立（最多约 2 秒）
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("条件在超时前未满足");
}
