// 上传队列管理器
//
// 负责：
// - 入队、暂停/恢复/取消、手动重试、状态查询
// - 单一调度循环：每次激活前重新查询有效上限，超出上限时挂起排名靠后的文件
// - 汇总 Worker 结果，统一处理终态转换与终态事件
//
// 锁顺序：state → record。Worker 与分片任务只锁 record，发布事件时不持有任何锁

use crate::config::{
    AppConfig, ConfigStore, NetworkConfig, PerformanceConfig, QueueConfig, QueueConfigPatch,
};
use crate::error::{status_label, FailureReason, QueueError};
use crate::events::{EventBus, EventKind, QueueEvent, SubscriptionId};
use crate::network::{ConnectionProbe, NetworkMonitor};
use crate::uploader::concurrency::{ConcurrencyController, EffectiveLimits};
use crate::uploader::performance::{PerformanceMetrics, PerformanceTracker};
use crate::uploader::scheduler::{rank_files, PriorityScheduler, SharedRecord};
use crate::uploader::task::{
    FileId, FileSnapshot, FileStatus, NewUpload, QueuedFile, UploadProgress, UploadRecord,
};
use crate::uploader::transport::{Collaborators, SessionMetadata};
use crate::uploader::worker::{run_worker, WorkerContext, WorkerControl, WorkerOutcome, WorkerReport};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 管理器构造参数
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub queue: QueueConfig,
    pub network: NetworkConfig,
    pub performance: PerformanceConfig,
    /// 已有的会话 ID；None 时由第一个激活的文件创建
    pub session_id: Option<String>,
}

impl ManagerOptions {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            network: config.network.clone(),
            performance: config.performance.clone(),
            session_id: None,
        }
    }
}

/// 正在运行（或正在排空）的 Worker
struct WorkerHandle {
    control: watch::Sender<WorkerControl>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct QueueState {
    scheduler: PriorityScheduler,
    workers: HashMap<FileId, WorkerHandle>,
}

struct ManagerInner {
    config: Arc<ConfigStore>,
    events: EventBus,
    network: Arc<NetworkMonitor>,
    performance: Arc<PerformanceTracker>,
    controller: Arc<ConcurrencyController>,
    collaborators: Collaborators,
    session: Arc<OnceCell<String>>,
    state: Mutex<QueueState>,
    /// 全部文件记录（含终态）
    records: DashMap<FileId, SharedRecord>,
    wake: Arc<Notify>,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

/// 上传队列管理器
///
/// 必须在 tokio 运行时内创建（会启动调度循环和网络兜底采样）
pub struct UploadQueueManager {
    inner: Arc<ManagerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for UploadQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueueManager")
            .field("files", &self.inner.records.len())
            .field("waiting", &self.inner.state.lock().scheduler.len())
            .field("limits", &self.inner.controller.applied())
            .finish()
    }
}

impl UploadQueueManager {
    /// 使用默认网络与性能配置创建
    pub fn new(
        config: QueueConfig,
        collaborators: Collaborators,
        probe: Arc<dyn ConnectionProbe>,
    ) -> Result<Self, QueueError> {
        Self::with_options(
            ManagerOptions {
                queue: config,
                ..Default::default()
            },
            collaborators,
            probe,
        )
    }

    /// 使用完整参数创建
    pub fn with_options(
        options: ManagerOptions,
        collaborators: Collaborators,
        probe: Arc<dyn ConnectionProbe>,
    ) -> Result<Self, QueueError> {
        let config = Arc::new(ConfigStore::new(options.queue)?);
        let snapshot = config.load();
        let events = EventBus::new();

        let network = Arc::new(NetworkMonitor::new(probe, events.clone()));
        let performance = Arc::new(PerformanceTracker::new(
            options.performance,
            snapshot.max_concurrent_files,
            events.clone(),
        ));
        let controller = Arc::new(ConcurrencyController::new(
            config.clone(),
            network.clone(),
            performance.clone(),
        ));

        // 网络变化与性能更新都会改变有效上限，唤醒调度循环重新计算
        let wake = Arc::new(Notify::new());
        for kind in [EventKind::NetworkChanged, EventKind::PerformanceUpdate] {
            let wake = wake.clone();
            events.on(kind, move |_| wake.notify_one());
        }

        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config,
            events,
            network: network.clone(),
            performance,
            controller,
            collaborators,
            session: Arc::new(OnceCell::new_with(options.session_id)),
            state: Mutex::new(QueueState {
                scheduler: PriorityScheduler::new(snapshot.priority_mode),
                workers: HashMap::new(),
            }),
            records: DashMap::new(),
            wake,
            report_tx,
            next_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        info!(
            "上传队列管理器已创建: 文件并发 {}, 分片并发 {}, 重试 {} 次, 优先级 {:?}",
            snapshot.max_concurrent_files,
            snapshot.max_concurrent_chunks_per_file,
            snapshot.retry_attempts,
            snapshot.priority_mode
        );

        let sample_interval = Duration::from_secs(options.network.sample_interval_secs.max(1));
        let tasks = vec![
            tokio::spawn(scheduling_loop(inner.clone(), report_rx)),
            network.start(sample_interval),
        ];

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    /// 从应用配置创建
    pub fn from_app_config(
        config: &AppConfig,
        collaborators: Collaborators,
        probe: Arc<dyn ConnectionProbe>,
    ) -> Result<Self, QueueError> {
        Self::with_options(ManagerOptions::from_app_config(config), collaborators, probe)
    }

    /// 文件入队
    pub fn enqueue(&self, upload: NewUpload) -> Result<FileId, QueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::Shutdown);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let file = QueuedFile::new(upload, seq);
        let event = QueueEvent::Queued {
            file_id: file.id.clone(),
            file_name: file.descriptor.name.clone(),
            file_size: file.size,
        };
        let id = file.id.clone();
        let record = Arc::new(Mutex::new(UploadRecord::new(file)));

        {
            let mut state = self.inner.state.lock();
            self.inner.records.insert(id.clone(), record.clone());
            state.scheduler.enqueue(record);
        }

        info!("文件已入队: {}", id);
        self.inner.events.emit(event);
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// 批量入队
    pub fn enqueue_all(
        &self,
        uploads: impl IntoIterator<Item = NewUpload>,
    ) -> Result<Vec<FileId>, QueueError> {
        uploads.into_iter().map(|u| self.enqueue(u)).collect()
    }

    /// 暂停（幂等）
    ///
    /// 上传中的文件不再派发新分片，在途分片完成后保留进度
    pub fn pause(&self, id: &str) -> Result<(), QueueError> {
        let record = self.record(id)?;
        {
            let mut state = self.inner.state.lock();
            let mut r = record.lock();
            match r.file.status {
                FileStatus::Paused => return Ok(()),
                status if status.is_terminal() => {
                    return Err(QueueError::InvalidState {
                        id: id.to_string(),
                        status: status_label(status),
                    })
                }
                _ => {
                    r.file.status = FileStatus::Paused;
                }
            }
            drop(r);

            state.scheduler.remove(id);
            if let Some(worker) = state.workers.get(id) {
                let _ = worker.control.send(WorkerControl::Pause);
            }
        }

        info!("文件已暂停: {}", id);
        self.inner.events.emit(QueueEvent::Paused {
            file_id: id.to_string(),
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 恢复（幂等），文件按原到达顺序重新排队
    pub fn resume(&self, id: &str) -> Result<(), QueueError> {
        let record = self.record(id)?;
        {
            let mut state = self.inner.state.lock();
            let mut r = record.lock();
            match r.file.status {
                FileStatus::Paused => {}
                FileStatus::Queued | FileStatus::Active | FileStatus::Retrying => return Ok(()),
                FileStatus::Cancelled => return Err(QueueError::NotFound(id.to_string())),
                status => {
                    return Err(QueueError::InvalidState {
                        id: id.to_string(),
                        status: status_label(status),
                    })
                }
            }
            r.file.status = FileStatus::Queued;
            drop(r);

            // 仍在排空的 Worker 结束后会自行回到队列
            if !state.workers.contains_key(id) {
                state.scheduler.enqueue(record.clone());
            }
        }

        info!("文件已恢复: {}", id);
        self.inner.events.emit(QueueEvent::Resumed {
            file_id: id.to_string(),
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 取消：中止在途分片，丢弃上传状态，立即进入 cancelled
    ///
    /// 已处于终态的文件直接返回成功
    pub fn cancel(&self, id: &str) -> Result<(), QueueError> {
        let record = self.record(id)?;
        {
            let mut state = self.inner.state.lock();
            let mut r = record.lock();
            if r.file.status.is_terminal() {
                return Ok(());
            }
            r.file.mark_cancelled();
            r.retained = None;
            drop(r);

            state.scheduler.remove(id);
            if let Some(worker) = state.workers.remove(id) {
                worker.cancel.cancel();
                worker.join.abort();
            }
        }

        info!("文件已取消: {}", id);
        self.inner.events.emit(QueueEvent::Cancelled {
            file_id: id.to_string(),
        });
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 暂停全部未结束的文件，返回本次暂停的数量
    pub fn pause_all(&self) -> usize {
        self.ids_with(|s| !s.is_terminal() && s != FileStatus::Paused)
            .iter()
            .filter(|id| self.pause(id).is_ok())
            .count()
    }

    /// 恢复全部已暂停的文件
    pub fn resume_all(&self) -> usize {
        self.ids_with(|s| s == FileStatus::Paused)
            .iter()
            .filter(|id| self.resume(id).is_ok())
            .count()
    }

    /// 取消全部未结束的文件
    pub fn cancel_all(&self) -> usize {
        self.ids_with(|s| !s.is_terminal())
            .iter()
            .filter(|id| self.cancel(id).is_ok())
            .count()
    }

    /// 手动重试失败的文件（重试计数清零，从头申请上传目标）
    pub fn retry(&self, id: &str) -> Result<(), QueueError> {
        let record = self.record(id)?;
        {
            let mut state = self.inner.state.lock();
            let mut r = record.lock();
            if r.file.status != FileStatus::Failed {
                return Err(QueueError::InvalidState {
                    id: id.to_string(),
                    status: status_label(r.file.status),
                });
            }
            r.file.error = None;
            r.file.completed_at = None;
            r.file.attempts = 0;
            r.retained = None;
            r.progress = Default::default();
            drop(r);
            state.scheduler.enqueue(record.clone());
        }

        let event = {
            let r = record.lock();
            QueueEvent::Queued {
                file_id: id.to_string(),
                file_name: r.file.descriptor.name.clone(),
                file_size: r.file.size,
            }
        };
        info!("文件重新排队: {}", id);
        self.inner.events.emit(event);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// 查询单个文件状态
    pub fn status(&self, id: &str) -> Result<FileSnapshot, QueueError> {
        Ok(self.record(id)?.lock().snapshot())
    }

    /// 全部文件状态（按入队顺序）
    pub fn list(&self) -> Vec<FileSnapshot> {
        let mut records: Vec<(u64, FileSnapshot)> = self
            .inner
            .records
            .iter()
            .map(|entry| {
                let r = entry.value().lock();
                (r.file.seq, r.snapshot())
            })
            .collect();
        records.sort_by_key(|(seq, _)| *seq);
        records.into_iter().map(|(_, s)| s).collect()
    }

    /// 删除已结束的文件记录，返回删除数量
    pub fn clear_finished(&self) -> usize {
        let before = self.inner.records.len();
        self.inner
            .records
            .retain(|_, record| !record.lock().file.status.is_terminal());
        let removed = before - self.inner.records.len();
        if removed > 0 {
            info!("已清除 {} 个已结束的文件记录", removed);
        }
        removed
    }

    /// 更新配置（整体替换快照）
    pub fn update_config(&self, patch: QueueConfigPatch) -> Result<Arc<QueueConfig>, QueueError> {
        let (old, new) = self.inner.config.update(&patch)?;

        if old.priority_mode != new.priority_mode {
            self.inner
                .state
                .lock()
                .scheduler
                .reprioritize(new.priority_mode);
        }
        self.inner
            .performance
            .set_max_concurrency(new.max_concurrent_files);

        self.inner.events.emit(QueueEvent::ConfigUpdated {
            config: (*new).clone(),
        });
        self.inner.wake.notify_one();
        Ok(new)
    }

    /// 当前配置快照
    pub fn config(&self) -> Arc<QueueConfig> {
        self.inner.config.load()
    }

    /// 当前有效并发上限
    pub fn effective_limits(&self) -> EffectiveLimits {
        self.inner.controller.applied()
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.inner.performance.metrics()
    }

    /// 网络监测器（平台连接变化时调用其 notify_change）
    pub fn network(&self) -> Arc<NetworkMonitor> {
        self.inner.network.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// 订阅指定事件
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    /// 异步事件流
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// 当前占用传输槽位的文件数
    pub fn active_count(&self) -> usize {
        self.inner
            .records
            .iter()
            .filter(|e| e.value().lock().file.status.is_running())
            .count()
    }

    /// 所有文件都已结束或已暂停
    pub fn is_idle(&self) -> bool {
        self.inner.records.iter().all(|e| {
            let status = e.value().lock().file.status;
            status.is_terminal() || status == FileStatus::Paused
        })
    }

    /// 等待所有文件结束或暂停
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.events.subscribe();
        loop {
            if self.is_idle() || self.inner.shutdown.is_cancelled() {
                return;
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// 关闭：停止调度循环与网络采样，中止全部 Worker
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("上传队列管理器正在关闭");
        self.inner.shutdown.cancel();
        self.inner.network.stop();

        let workers: Vec<(FileId, WorkerHandle)> = {
            let mut state = self.inner.state.lock();
            state.workers.drain().collect()
        };
        for (id, worker) in workers {
            worker.cancel.cancel();
            worker.join.abort();
            // 被中止的文件回到等待状态，不再报告为运行中
            if let Some(record) = self.inner.records.get(&id) {
                let mut r = record.lock();
                if r.file.status.is_running() {
                    r.file.status = FileStatus::Queued;
                    r.progress = UploadProgress::default();
                    r.retained = None;
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("上传队列管理器已关闭");
    }

    fn record(&self, id: &str) -> Result<SharedRecord, QueueError> {
        self.inner
            .records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    fn ids_with(&self, pred: impl Fn(FileStatus) -> bool) -> Vec<FileId> {
        self.inner
            .records
            .iter()
            .filter(|e| pred(e.value().lock().file.status))
            .map(|e| e.key().clone())
            .collect()
    }
}

impl Drop for UploadQueueManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.network.stop();
    }
}

/// 调度循环
async fn scheduling_loop(
    inner: Arc<ManagerInner>,
    mut reports: mpsc::UnboundedReceiver<WorkerReport>,
) {
    info!("调度循环已启动");
    loop {
        inner.schedule();

        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            Some(report) = reports.recv() => inner.handle_report(report),
            _ = inner.wake.notified() => {}
        }
    }
    info!("调度循环已停止");
}

impl ManagerInner {
    /// 按最新上限挂起超额文件或激活等待中的文件
    ///
    /// 运行中的文件数在任何时刻都不超过 `controller.applied()`：
    /// 先挂起超额文件，再记录新上限，最后激活
    fn schedule(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let limits = self.controller.effective_limits();
        let mut events = Vec::new();

        let active = {
            let mut state = self.state.lock();

            let mut running: Vec<(FileId, QueuedFile)> = state
                .workers
                .keys()
                .filter_map(|id| {
                    let record = self.records.get(id)?;
                    let r = record.lock();
                    r.file
                        .status
                        .is_running()
                        .then(|| (id.clone(), r.file.clone()))
                })
                .collect();

            if running.len() > limits.max_files {
                // 挂起排名最靠后的文件，保留进度重新排队
                let mode = state.scheduler.mode();
                running.sort_by(|a, b| rank_files(mode, &a.1, &b.1));
                for (id, _) in running.split_off(limits.max_files) {
                    if let Some(record) = self.records.get(&id) {
                        record.lock().file.status = FileStatus::Queued;
                    }
                    if let Some(worker) = state.workers.get(&id) {
                        let _ = worker.control.send(WorkerControl::Throttle);
                    }
                    info!(
                        "⏸ 并发上限收缩为 {}，挂起文件 {}",
                        limits.max_files, id
                    );
                    events.push(QueueEvent::Throttled { file_id: id });
                }
            }

            if self.controller.apply(limits) {
                events.insert(0, QueueEvent::LimitsChanged { limits });
            }

            let available = limits.max_files.saturating_sub(running.len());
            if available > 0 && !state.scheduler.is_empty() {
                for record in state.scheduler.next(available) {
                    let file = record.lock().file.clone();
                    let handle = self.spawn_worker(record);
                    state.workers.insert(file.id.clone(), handle);
                    running.push((file.id.clone(), file));
                }
            }
            running.len()
        };

        self.performance.set_active(active);
        for event in events {
            self.events.emit(event);
        }
    }

    fn spawn_worker(&self, record: SharedRecord) -> WorkerHandle {
        let file_id = record.lock().file.id.clone();
        let (control, control_rx) = watch::channel(WorkerControl::Run);
        let cancel = self.shutdown.child_token();

        let session_metadata = SessionMetadata {
            title: "upload-queue".to_string(),
            file_count: self.records.len(),
            total_size: self
                .records
                .iter()
                .map(|e| e.value().lock().file.size)
                .sum(),
        };
        let ctx = WorkerContext {
            record,
            collaborators: self.collaborators.clone(),
            controller: self.controller.clone(),
            performance: self.performance.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            session: self.session.clone(),
            session_metadata,
        };

        let tx = self.report_tx.clone();
        let token = cancel.clone();
        let id = file_id.clone();
        let join = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(run_worker(ctx, control_rx, token))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => WorkerOutcome::Failed {
                    reason: FailureReason::Internal("上传 Worker 异常退出".to_string()),
                },
            };
            let _ = tx.send(WorkerReport {
                file_id: id,
                outcome,
            });
        });

        debug!("已启动 Worker: {}", file_id);
        WorkerHandle {
            control,
            cancel,
            join,
        }
    }

    /// 处理 Worker 结束报告
    fn handle_report(&self, report: WorkerReport) {
        let WorkerReport { file_id, outcome } = report;
        let mut events = Vec::new();
        let mut completed_stats = None;
        let mut failed = false;

        {
            let mut state = self.state.lock();
            // 已被取消的 Worker 不再有句柄，忽略其报告
            if state.workers.remove(&file_id).is_none() {
                debug!("忽略已移除 Worker 的报告: {}", file_id);
                return;
            }
            let Some(record) = self.records.get(&file_id).map(|r| r.value().clone()) else {
                return;
            };
            let mut r = record.lock();
            let status = r.file.status;

            match outcome {
                _ if status.is_terminal() => {
                    r.retained = None;
                }
                WorkerOutcome::Completed {
                    artifact_id,
                    transferred,
                    elapsed,
                } => {
                    r.file.mark_completed(artifact_id.clone());
                    r.retained = None;
                    r.progress.transferred = transferred;
                    r.progress.completed_chunks = r.progress.total_chunks;
                    r.progress.speed = 0;
                    r.progress.eta_secs = Some(0);
                    info!(
                        "✓ 文件上传完成: {} ({} bytes, 耗时 {:.1}s)",
                        file_id,
                        transferred,
                        elapsed.as_secs_f64()
                    );
                    completed_stats = Some((transferred, elapsed));
                    events.push(QueueEvent::Completed {
                        file_id: file_id.clone(),
                        artifact_id,
                        transferred,
                        completed_at: chrono::Utc::now().timestamp_millis(),
                    });
                }
                WorkerOutcome::Failed { reason } => {
                    error!("✗ 文件上传失败: {} ({})", file_id, reason);
                    r.file.mark_failed(reason.clone());
                    r.retained = None;
                    failed = true;
                    events.push(QueueEvent::Failed {
                        file_id: file_id.clone(),
                        reason,
                    });
                }
                WorkerOutcome::Suspended { control, upload } => {
                    r.retained = upload;
                    debug!("Worker 已挂起: {} ({:?}, 当前状态 {:?})", file_id, control, status);
                    if status != FileStatus::Paused {
                        drop(r);
                        state.scheduler.enqueue(record.clone());
                    }
                }
                WorkerOutcome::Cancelled => {
                    warn!("Worker 在未取消的情况下退出: {}", file_id);
                    r.file.mark_cancelled();
                    r.retained = None;
                    events.push(QueueEvent::Cancelled {
                        file_id: file_id.clone(),
                    });
                }
            }
        }

        if let Some((bytes, elapsed)) = completed_stats {
            self.performance.record_file_completed(bytes, elapsed);
        }
        if failed {
            self.performance.record_file_failed();
        }
        for event in events {
            self.events.emit(event);
        }
    }
}
