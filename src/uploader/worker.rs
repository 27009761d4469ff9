// 单文件上传 Worker
//
// 状态机: pending → chunk-uploading → (chunk-retry)* → completed | failed | cancelled
//
// - 激活时准备会话、上传目标与分片计划（被挂起的文件直接沿用保留的状态）
// - 在途分片数不超过控制器实时给出的单文件分片上限
// - 暂停/挂起：不再派发新分片，等在途分片结束后交回保留状态
// - 取消：立即中止所有在途分片
// - 上传目标过期：重新申请后重新派发该分片，不计入重试；
//   连续过期（期间没有分片完成）超过 retry_attempts 次时以 Expired 失败
// - 即将过期的目标提前刷新，提前量不超过目标有效期的四分之一，
//   提前刷新得到的目标不再提前刷新
// - 全部分片完成后调用合并接口，得到产物 ID
//
// Worker 只负责传输，终态转换和终态事件由管理器统一处理

use crate::common::{SpeedMeter, StallDetector};
use crate::config::{ConfigStore, QueueConfig};
use crate::error::{FailureReason, TransferError};
use crate::events::{EventBus, ProgressThrottler, QueueEvent};
use crate::uploader::chunk::ChunkPlan;
use crate::uploader::concurrency::ConcurrencyController;
use crate::uploader::performance::PerformanceTracker;
use crate::uploader::retry::{backoff_delay, RetryPolicy};
use crate::uploader::scheduler::SharedRecord;
use crate::uploader::task::{ActiveUpload, FileId, FileStatus, QueuedFile, UploadProgress};
use crate::uploader::transport::{
    ChunkReceipt, ChunkRequest, ChunkTransport, Collaborators, ProgressSink, SessionMetadata,
    UploadSource, UploadTarget, UploadTargetRequest,
};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker 控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    Run,
    /// 用户暂停
    Pause,
    /// 并发上限收缩，挂起后重新排队
    Throttle,
}

/// Worker 结束结果
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed {
        artifact_id: String,
        transferred: u64,
        elapsed: Duration,
    },
    Failed {
        reason: FailureReason,
    },
    /// 暂停或挂起，upload 为保留的上传状态（准备阶段被打断时为 None）
    Suspended {
        control: WorkerControl,
        upload: Option<ActiveUpload>,
    },
    Cancelled,
}

/// Worker 结束报告（通过 mpsc 发给调度循环）
#[derive(Debug)]
pub struct WorkerReport {
    pub file_id: FileId,
    pub outcome: WorkerOutcome,
}

/// Worker 运行所需的共享组件
#[derive(Clone)]
pub struct WorkerContext {
    pub record: SharedRecord,
    pub collaborators: Collaborators,
    pub controller: Arc<ConcurrencyController>,
    pub performance: Arc<PerformanceTracker>,
    pub config: Arc<ConfigStore>,
    pub events: EventBus,
    /// 整个队列共用一个会话，首个需要的 Worker 负责创建
    pub session: Arc<OnceCell<String>>,
    pub session_metadata: SessionMetadata,
}

/// 单个分片任务的结果
struct ChunkResult {
    index: usize,
    /// 派发时的上传目标版本
    generation: u64,
    retries: u32,
    result: Result<ChunkReceipt, TransferError>,
}

/// 在途分片
struct InFlight {
    size: u64,
    sink: ProgressSink,
}

/// 运行 Worker 直到结束
pub async fn run_worker(
    ctx: WorkerContext,
    mut control: watch::Receiver<WorkerControl>,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let started = Instant::now();
    let (file, retained) = {
        let mut r = ctx.record.lock();
        (r.file.clone(), r.retained.take())
    };
    let config = ctx.config.load();
    let policy = RetryPolicy::from_config(&config);

    let resumed = retained.is_some();
    let upload = match retained {
        Some(upload) => upload,
        None => {
            let prepared = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WorkerOutcome::Cancelled,
                prepared = prepare(&ctx, &file, &config, policy) => prepared,
            };
            match prepared {
                Ok(upload) => upload,
                Err(e) => {
                    error!("文件 {} 准备上传失败: {}", file.id, e);
                    return WorkerOutcome::Failed {
                        reason: FailureReason::from(&e),
                    };
                }
            }
        }
    };

    let signal = *control.borrow_and_update();
    if signal != WorkerControl::Run {
        return WorkerOutcome::Suspended {
            control: signal,
            upload: Some(upload),
        };
    }

    info!(
        "开始上传: {} ({}), 大小 {} bytes, 分片 {}/{} 已完成{}",
        file.descriptor.name,
        file.id,
        file.size,
        upload.plan.completed_count(),
        upload.plan.chunk_count(),
        if resumed { "（继续上传）" } else { "" }
    );
    ctx.events.emit(QueueEvent::Started {
        file_id: file.id.clone(),
        resumed_bytes: upload.plan.done_bytes(),
        total_chunks: upload.plan.chunk_count(),
    });

    let mut worker = FileWorker::new(ctx, file, upload, config, policy);
    worker.run(&mut control, &cancel, started).await
}

/// 会话与上传目标准备
async fn prepare(
    ctx: &WorkerContext,
    file: &QueuedFile,
    config: &QueueConfig,
    policy: RetryPolicy,
) -> Result<ActiveUpload, TransferError> {
    let sessions = ctx.collaborators.sessions.clone();
    let metadata = ctx.session_metadata.clone();
    let session_id = ctx
        .session
        .get_or_try_init(|| async {
            let id = request_with_retry(policy, "创建上传会话", || {
                let sessions = sessions.clone();
                let metadata = metadata.clone();
                async move { sessions.create_session(&metadata).await }
            })
            .await?;
            info!("上传会话已创建: {}", id);
            Ok::<String, TransferError>(id)
        })
        .await?
        .clone();

    let target = request_target(ctx, &session_id, file, policy).await?;
    let chunk_size = target.chunk_size_hint.unwrap_or(config.chunk_size);
    let plan = ChunkPlan::new(file.size, chunk_size);

    Ok(ActiveUpload {
        session_id,
        target,
        target_issued_at: Utc::now(),
        plan,
    })
}

async fn request_target(
    ctx: &WorkerContext,
    session_id: &str,
    file: &QueuedFile,
    policy: RetryPolicy,
) -> Result<UploadTarget, TransferError> {
    let request = UploadTargetRequest {
        file_name: file.descriptor.name.clone(),
        file_size: file.size,
        content_type: file.descriptor.content_type.clone(),
    };
    let target = request_with_retry(policy, "申请上传目标", || {
        let issuer = ctx.collaborators.issuer.clone();
        let request = request.clone();
        async move { issuer.request_upload_target(session_id, &request).await }
    })
    .await?;
    debug!(
        "上传目标已签发: {} upload_id={}, 过期时间 {}",
        file.id, target.upload_id, target.expires_at
    );
    Ok(target)
}

/// 对可重试错误按退避策略重试
async fn request_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() => {
                attempt += 1;
                match policy.delay_for(attempt) {
                    Some(delay) => {
                        warn!(
                            "{}失败，等待 {}ms 后重试 ({}/{}): {}",
                            what,
                            delay.as_millis(),
                            attempt,
                            policy.max_attempts,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// 单文件传输循环的状态
struct FileWorker {
    ctx: WorkerContext,
    file: QueuedFile,
    upload: ActiveUpload,
    config: Arc<QueueConfig>,
    policy: RetryPolicy,
    chunks: JoinSet<ChunkResult>,
    in_flight: HashMap<usize, InFlight>,
    /// 上传目标版本，每次重新申请 +1
    generation: u64,
    /// 连续过期次数，有分片完成时清零
    expired_streak: u32,
    /// 当前目标由提前刷新得到
    proactive_refreshed: bool,
    /// 处于退避等待中的分片数
    retrying: Arc<AtomicUsize>,
    meter: SpeedMeter,
    stall: StallDetector,
    throttler: ProgressThrottler,
}

impl FileWorker {
    fn new(
        ctx: WorkerContext,
        file: QueuedFile,
        upload: ActiveUpload,
        config: Arc<QueueConfig>,
        policy: RetryPolicy,
    ) -> Self {
        let done = upload.plan.done_bytes();
        Self {
            meter: SpeedMeter::with_interval(config.progress_interval()),
            stall: StallDetector::new(config.stall_threshold(), Instant::now(), done),
            throttler: ProgressThrottler::with_millis(config.progress_interval_ms),
            ctx,
            file,
            upload,
            config,
            policy,
            chunks: JoinSet::new(),
            in_flight: HashMap::new(),
            generation: 0,
            expired_streak: 0,
            proactive_refreshed: false,
            retrying: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn run(
        &mut self,
        control: &mut watch::Receiver<WorkerControl>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> WorkerOutcome {
        let mut ticker = tokio::time::interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop: Option<WorkerControl> = None;
        let mut control_open = true;

        loop {
            if stop.is_none() {
                if let Err(e) = self.ensure_target_fresh(cancel).await {
                    self.chunks.abort_all();
                    return self.fail(e);
                }
                if cancel.is_cancelled() {
                    self.chunks.abort_all();
                    return WorkerOutcome::Cancelled;
                }
                self.dispatch();
            }

            if self.in_flight.is_empty() {
                if let Some(signal) = stop {
                    self.publish_progress(true);
                    info!("文件 {} 已停止派发并排空在途分片 ({:?})", self.file.id, signal);
                    return WorkerOutcome::Suspended {
                        control: signal,
                        upload: Some(self.upload.clone()),
                    };
                }
                if self.upload.plan.is_completed() {
                    return self.finalize(started, cancel).await;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.chunks.abort_all();
                    debug!("文件 {} 已取消，中止 {} 个在途分片", self.file.id, self.in_flight.len());
                    return WorkerOutcome::Cancelled;
                }
                Some(joined) = self.chunks.join_next(), if !self.chunks.is_empty() => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            self.chunks.abort_all();
                            return WorkerOutcome::Failed {
                                reason: FailureReason::Internal(format!("分片任务异常退出: {}", e)),
                            };
                        }
                    };
                    if let Err(reason) = self.handle_chunk_result(result, cancel).await {
                        self.chunks.abort_all();
                        return WorkerOutcome::Failed { reason };
                    }
                }
                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                        continue;
                    }
                    let signal = *control.borrow_and_update();
                    stop = match signal {
                        WorkerControl::Run => None,
                        other => {
                            debug!(
                                "文件 {} 收到 {:?}，等待 {} 个在途分片结束",
                                self.file.id, other, self.in_flight.len()
                            );
                            Some(other)
                        }
                    };
                }
                _ = ticker.tick() => {
                    self.publish_progress(false);
                }
            }
        }
    }

    /// 按实时分片上限派发待上传分片
    fn dispatch(&mut self) {
        let max_chunks = self.ctx.controller.max_chunks_per_file();
        while self.in_flight.len() < max_chunks {
            let Some(index) = self.upload.plan.next_pending() else {
                break;
            };
            let Some(chunk) = self.upload.plan.chunk(index) else {
                break;
            };
            let range = chunk.range.clone();
            let prior_retries = chunk.retries;
            self.upload.plan.mark_in_flight(index);

            let sink = ProgressSink::new();
            self.in_flight.insert(
                index,
                InFlight {
                    size: range.end - range.start,
                    sink: sink.clone(),
                },
            );

            let job = ChunkJob {
                file_id: self.file.id.clone(),
                source: self.file.source.clone(),
                target: self.upload.target.clone(),
                index,
                range,
                total_size: self.file.size,
                generation: self.generation,
                prior_retries,
                policy: self.policy,
                sink,
                transport: self.ctx.collaborators.transport.clone(),
                record: self.ctx.record.clone(),
                events: self.ctx.events.clone(),
                performance: self.ctx.performance.clone(),
                retrying: self.retrying.clone(),
            };
            debug!(
                "派发分片 {}#{} (在途 {}/{})",
                self.file.id,
                index,
                self.in_flight.len(),
                max_chunks
            );
            self.chunks.spawn(job.run());
        }
    }

    async fn handle_chunk_result(
        &mut self,
        result: ChunkResult,
        cancel: &CancellationToken,
    ) -> Result<(), FailureReason> {
        let ChunkResult {
            index,
            generation,
            retries,
            result,
        } = result;
        self.in_flight.remove(&index);
        self.upload.plan.set_retries(index, retries);

        match result {
            Ok(receipt) => {
                self.expired_streak = 0;
                self.upload.plan.mark_done(index, receipt);
                debug!(
                    "✓ 分片 {}#{} 完成 ({}/{})",
                    self.file.id,
                    index,
                    self.upload.plan.completed_count(),
                    self.upload.plan.chunk_count()
                );
                self.publish_progress(false);
                Ok(())
            }
            Err(e) if e.is_expired() => {
                // 过期不计入重试：放回待上传，目标只为同一版本刷新一次
                self.upload.plan.mark_pending(index);
                if generation != self.generation {
                    return Ok(());
                }

                self.expired_streak += 1;
                let limit = self.policy.max_attempts.max(1);
                if self.expired_streak > limit {
                    self.upload.plan.mark_failed(index);
                    error!(
                        "文件 {} 上传目标连续 {} 次过期，放弃上传: {}",
                        self.file.id, self.expired_streak, e
                    );
                    return Err(FailureReason::from(&e));
                }

                // 首次过期立即刷新，之后按退避等待
                if self.expired_streak > 1 {
                    let delay = backoff_delay(self.policy.base_delay, self.expired_streak - 1);
                    warn!(
                        "文件 {} 新签发的上传目标仍然过期，等待 {}ms 后重新申请 ({}/{})",
                        self.file.id,
                        delay.as_millis(),
                        self.expired_streak,
                        limit
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                info!("文件 {} 上传目标已过期，重新申请", self.file.id);
                self.refresh_target(cancel)
                    .await
                    .map_err(|e| FailureReason::from(&e))?;
                Ok(())
            }
            Err(e) => {
                self.upload.plan.mark_failed(index);
                error!(
                    "分片 {}#{} 上传失败（{}）: {}",
                    self.file.id,
                    index,
                    if e.is_retriable() { "已达最大重试次数" } else { "不可重试" },
                    e
                );
                Err(FailureReason::from(&e))
            }
        }
    }

    /// 即将过期的目标在派发前刷新
    async fn ensure_target_fresh(&mut self, cancel: &CancellationToken) -> Result<(), TransferError> {
        if self.proactive_refreshed
            || self.upload.plan.next_pending().is_none()
            || !self.upload.target.is_expired(self.refresh_margin())
        {
            return Ok(());
        }
        info!("文件 {} 上传目标即将过期，提前重新申请", self.file.id);
        self.refresh_target(cancel).await?;
        self.proactive_refreshed = true;
        Ok(())
    }

    /// 提前刷新的余量：配置值与目标有效期四分之一取较小者
    fn refresh_margin(&self) -> Duration {
        let lifetime = (self.upload.target.expires_at - self.upload.target_issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.config.target_expiry_margin().min(lifetime / 4)
    }

    async fn refresh_target(&mut self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let refreshed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            refreshed = request_target(&self.ctx, &self.upload.session_id, &self.file, self.policy) => refreshed,
        };
        self.upload.target = refreshed?;
        self.upload.target_issued_at = Utc::now();
        self.proactive_refreshed = false;
        self.generation += 1;
        Ok(())
    }

    /// 全部分片完成后合并
    async fn finalize(&mut self, started: Instant, cancel: &CancellationToken) -> WorkerOutcome {
        self.publish_progress(true);
        let receipts = self.upload.plan.receipts();
        let issuer = self.ctx.collaborators.issuer.clone();
        let target = self.upload.target.clone();

        let completed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerOutcome::Cancelled,
            completed = request_with_retry(self.policy, "合并上传", || {
                let issuer = issuer.clone();
                let target = target.clone();
                let receipts = receipts.clone();
                async move { issuer.complete_upload(&target, &receipts).await }
            }) => completed,
        };

        match completed {
            Ok(artifact_id) => WorkerOutcome::Completed {
                artifact_id,
                transferred: self.upload.plan.done_bytes(),
                elapsed: started.elapsed(),
            },
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, e: TransferError) -> WorkerOutcome {
        error!("文件 {} 上传失败: {}", self.file.id, e);
        WorkerOutcome::Failed {
            reason: FailureReason::from(&e),
        }
    }

    /// 已传输字节 = 已完成分片 + 在途分片已发送部分
    fn transferred(&self) -> u64 {
        let partial: u64 = self
            .in_flight
            .values()
            .map(|f| f.sink.get().min(f.size))
            .sum();
        self.upload.plan.done_bytes() + partial
    }

    /// 更新进度快照并按节流发布 Progress 事件
    fn publish_progress(&mut self, force: bool) {
        let now = Instant::now();
        let transferred = self.transferred();
        let total = self.file.size;
        let speed = self.meter.sample(now, transferred);
        let eta_secs = self.meter.eta(total.saturating_sub(transferred));
        let progress = UploadProgress {
            transferred,
            speed,
            eta_secs,
            completed_chunks: self.upload.plan.completed_count(),
            total_chunks: self.upload.plan.chunk_count(),
        };

        let paused = {
            let mut r = self.ctx.record.lock();
            r.progress = progress;
            !r.file.status.is_running()
        };
        if speed > 0 {
            self.ctx.performance.record_speed_sample(speed);
        }

        if let Some(idle) = self.stall.observe(now, transferred, paused) {
            warn!(
                "⚠️ 文件 {} 已 {} 秒没有进度 (已传输 {} bytes)",
                self.file.id,
                idle.as_secs(),
                transferred
            );
            self.ctx.events.emit(QueueEvent::Stalled {
                file_id: self.file.id.clone(),
                idle_secs: idle.as_secs(),
                transferred,
            });
        }

        let emit = if force {
            self.throttler.force_emit()
        } else {
            self.throttler.should_emit()
        };
        if emit {
            let percent = if total == 0 {
                if self.upload.plan.is_completed() { 100.0 } else { 0.0 }
            } else {
                (transferred as f64 / total as f64) * 100.0
            };
            self.ctx.events.emit(QueueEvent::Progress {
                file_id: self.file.id.clone(),
                transferred,
                total_size: total,
                speed,
                eta_secs,
                progress: percent,
                completed_chunks: progress.completed_chunks,
                total_chunks: progress.total_chunks,
            });
        }
    }
}

/// 单个分片的上传任务（带重试）
struct ChunkJob {
    file_id: FileId,
    source: UploadSource,
    target: UploadTarget,
    index: usize,
    range: Range<u64>,
    total_size: u64,
    generation: u64,
    prior_retries: u32,
    policy: RetryPolicy,
    sink: ProgressSink,
    transport: Arc<dyn ChunkTransport>,
    record: SharedRecord,
    events: EventBus,
    performance: Arc<PerformanceTracker>,
    retrying: Arc<AtomicUsize>,
}

impl ChunkJob {
    async fn run(self) -> ChunkResult {
        let mut retries = self.prior_retries;
        let result = self.upload_with_retry(&mut retries).await;
        ChunkResult {
            index: self.index,
            generation: self.generation,
            retries,
            result,
        }
    }

    async fn upload_with_retry(&self, retries: &mut u32) -> Result<ChunkReceipt, TransferError> {
        let data = self.source.read_range(self.range.clone()).await?;

        loop {
            self.sink.reset();
            let request = ChunkRequest {
                target: self.target.clone(),
                index: self.index,
                range: self.range.clone(),
                total_size: self.total_size,
                data: data.clone(),
            };

            let error = match self.transport.put_chunk(request, self.sink.clone()).await {
                Ok(receipt) => {
                    self.sink.set(self.range.end - self.range.start);
                    return Ok(receipt);
                }
                Err(e) => e,
            };

            if error.is_expired() || !error.is_retriable() {
                return Err(error);
            }

            let attempt = *retries + 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                return Err(error);
            };
            *retries = attempt;

            warn!(
                "分片 {}#{} 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                self.file_id,
                self.index,
                delay.as_millis(),
                attempt,
                self.policy.max_attempts,
                error
            );
            // 重试会回退该分片已发送的字节
            self.sink.reset();
            self.performance.record_chunk_failure();
            self.enter_retrying(attempt);
            self.events.emit(QueueEvent::Retried {
                file_id: self.file_id.clone(),
                chunk_index: self.index,
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });

            tokio::time::sleep(delay).await;
            self.leave_retrying();
        }
    }

    fn enter_retrying(&self, attempt: u32) {
        let mut r = self.record.lock();
        r.file.attempts = r.file.attempts.max(attempt);
        if self.retrying.fetch_add(1, Ordering::SeqCst) == 0 {
            r.set_running_status(FileStatus::Retrying);
        }
    }

    fn leave_retrying(&self) {
        if self.retrying.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.record.lock().set_running_status(FileStatus::Active);
        }
    }
}
