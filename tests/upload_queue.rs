mod common;

use adaptive_upload_queue::error::FailureCategory;
use adaptive_upload_queue::{
    ConnectionClass, EffectiveLimits, EventKind, FileStatus, ManagerOptions, NewUpload,
    PriorityMode, QueueConfig, QueueConfigPatch, QueueError, QueueEvent, StaticProbe,
    TransferError, UploadQueueManager,
};
use common::{broadband, collaborators, collect, eventually, ScriptedClient, MB};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const KB: usize = 1024;

fn file(name: &str, size: usize) -> NewUpload {
    NewUpload::from_bytes(name, "application/octet-stream", vec![1u8; size])
}

fn manager(client: &Arc<ScriptedClient>, config: QueueConfig) -> UploadQueueManager {
    UploadQueueManager::new(config, collaborators(client), broadband()).unwrap()
}

fn started_names(manager: &UploadQueueManager, events: &[QueueEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Started { file_id, .. } => Some(manager.status(file_id).ok()?.file_name),
            _ => None,
        })
        .collect()
}

async fn run_in_order(mode: PriorityMode) -> Vec<String> {
    let client = ScriptedClient::new();
    let manager = manager(
        &client,
        QueueConfig {
            max_concurrent_files: 1,
            priority_mode: mode,
            ..Default::default()
        },
    );
    let started = collect(&manager, &[EventKind::Started]);

    manager.enqueue(file("medium", 3 * KB)).unwrap();
    manager.enqueue(file("small", KB)).unwrap();
    manager.enqueue(file("large", 5 * KB)).unwrap();
    manager.wait_until_idle().await;

    let names = started_names(&manager, &started.lock());
    manager.shutdown().await;
    names
}

#[tokio::test]
async fn smallest_first_activates_in_size_order() {
    assert_eq!(
        run_in_order(PriorityMode::SmallestFirst).await,
        vec!["small", "medium", "large"]
    );
}

#[tokio::test]
async fn fifo_and_largest_first_ordering() {
    assert_eq!(
        run_in_order(PriorityMode::Fifo).await,
        vec!["medium", "small", "large"]
    );
    assert_eq!(
        run_in_order(PriorityMode::LargestFirst).await,
        vec!["large", "medium", "small"]
    );
}

#[tokio::test]
async fn chunked_upload_respects_per_file_chunk_cap() {
    let client = ScriptedClient::new();
    client.set_put_delay(Duration::from_millis(20));
    let manager = manager(
        &client,
        QueueConfig {
            chunk_size: 10 * MB as u64,
            max_concurrent_chunks_per_file: 2,
            ..Default::default()
        },
    );
    let completed = collect(&manager, &[EventKind::Completed]);

    let id = manager.enqueue(file("video.mp4", 30 * MB)).unwrap();
    manager.wait_until_idle().await;

    assert_eq!(client.max_in_flight(), 2);
    assert_eq!(client.puts().len(), 3);

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Completed);
    assert_eq!(snapshot.total_chunks, 3);
    assert_eq!(snapshot.artifact_id.as_deref(), Some("artifact:video.mp4#1:3"));

    let events = completed.lock();
    assert!(matches!(
        events.as_slice(),
        [QueueEvent::Completed { transferred, .. }] if *transferred == 30 * MB as u64
    ));
    drop(events);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_chunk_is_retried_with_exponential_backoff() {
    let client = ScriptedClient::new();
    client.fail_chunk(
        "retry.bin",
        1,
        vec![
            TransferError::from_status(503, "unavailable"),
            TransferError::timeout("read timed out"),
        ],
    );
    let manager = manager(
        &client,
        QueueConfig {
            chunk_size: 256 * KB as u64,
            retry_attempts: 3,
            base_retry_delay_ms: 1000,
            ..Default::default()
        },
    );
    let retried = collect(&manager, &[EventKind::Retried]);

    let id = manager.enqueue(file("retry.bin", 768 * KB)).unwrap();
    manager.wait_until_idle().await;

    let delays: Vec<(usize, u32, u64)> = retried
        .lock()
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Retried {
                chunk_index,
                attempt,
                delay_ms,
                ..
            } => Some((*chunk_index, *attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![(1, 1, 1000), (1, 2, 2000)]);

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Completed);
    assert_eq!(snapshot.attempts, 2);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reported_attempts_never_exceed_retry_limit() {
    let client = ScriptedClient::new();
    for index in 0..3 {
        client.fail_chunk(
            "multi.bin",
            index,
            vec![
                TransferError::network("reset"),
                TransferError::from_status(502, "bad gateway"),
            ],
        );
    }
    let manager = manager(
        &client,
        QueueConfig {
            chunk_size: 256 * KB as u64,
            retry_attempts: 2,
            base_retry_delay_ms: 100,
            ..Default::default()
        },
    );
    let retried = collect(&manager, &[EventKind::Retried]);

    let id = manager.enqueue(file("multi.bin", 768 * KB)).unwrap();
    manager.wait_until_idle().await;

    // 三个分片各重试两次，但快照里的重试次数按单个分片计
    assert_eq!(retried.lock().len(), 6);
    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Completed);
    assert_eq!(snapshot.attempts, 2);
    assert!(snapshot.attempts <= manager.config().retry_attempts);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_and_manual_retry_recovers() {
    let client = ScriptedClient::new();
    client.fail_chunk(
        "flaky.bin",
        0,
        vec![
            TransferError::network("reset"),
            TransferError::network("reset"),
            TransferError::network("reset"),
        ],
    );
    let manager = manager(
        &client,
        QueueConfig {
            retry_attempts: 2,
            base_retry_delay_ms: 100,
            ..Default::default()
        },
    );
    let failed = collect(&manager, &[EventKind::Failed]);

    let id = manager.enqueue(file("flaky.bin", KB)).unwrap();
    manager.wait_until_idle().await;

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Failed);
    assert_eq!(snapshot.attempts, 2);
    assert_eq!(
        snapshot.error.map(|e| e.category()),
        Some(FailureCategory::Network)
    );
    assert_eq!(failed.lock().len(), 1);

    // 脚本里的失败已用完，手动重试成功
    manager.retry(&id).unwrap();
    manager.wait_until_idle().await;
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Completed);
    manager.shutdown().await;
}

#[tokio::test]
async fn validation_failure_is_not_retried() {
    let client = ScriptedClient::new();
    client.fail_chunk(
        "bad.exe",
        0,
        vec![TransferError::from_status(415, "unsupported media type")],
    );
    let manager = manager(&client, QueueConfig::default());
    let retried = collect(&manager, &[EventKind::Retried]);

    let id = manager.enqueue(file("bad.exe", KB)).unwrap();
    manager.wait_until_idle().await;

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Failed);
    let reason = snapshot.error.unwrap();
    assert_eq!(reason.category(), FailureCategory::Validation);
    assert!(!reason.is_retry_suggested());
    assert!(retried.lock().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn network_downgrade_throttles_without_cancelling() {
    let client = ScriptedClient::new();
    client.close_gate();
    let probe = Arc::new(StaticProbe::new(ConnectionClass::Broadband));
    let manager = UploadQueueManager::new(
        QueueConfig {
            max_concurrent_files: 5,
            adaptive_optimization_enabled: false,
            ..Default::default()
        },
        collaborators(&client),
        probe.clone(),
    )
    .unwrap();
    let events = collect(
        &manager,
        &[EventKind::Throttled, EventKind::Cancelled, EventKind::Failed],
    );

    for i in 0..5 {
        manager.enqueue(file(&format!("f{}", i), 64 * KB)).unwrap();
    }
    eventually(|| manager.active_count() == 5).await;

    probe.set_class(ConnectionClass::TwoG);
    assert!(manager.network().notify_change());
    eventually(|| manager.active_count() == 1).await;

    assert_eq!(
        manager.effective_limits(),
        EffectiveLimits {
            max_files: 1,
            max_chunks_per_file: 1
        }
    );
    {
        let events = events.lock();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.kind() == EventKind::Throttled)
                .count(),
            4
        );
        assert!(events.iter().all(|e| e.kind() == EventKind::Throttled));
    }
    let statuses: Vec<FileStatus> = manager.list().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == FileStatus::Queued)
            .count(),
        4
    );

    client.open_gate();
    manager.wait_until_idle().await;
    assert!(manager
        .list()
        .iter()
        .all(|s| s.status == FileStatus::Completed));
    assert!(events
        .lock()
        .iter()
        .all(|e| e.kind() == EventKind::Throttled));
    manager.shutdown().await;
}

#[tokio::test]
async fn offline_holds_queue_until_connection_returns() {
    let client = ScriptedClient::new();
    let probe = Arc::new(StaticProbe::new(ConnectionClass::Offline));
    let manager =
        UploadQueueManager::new(QueueConfig::default(), collaborators(&client), probe.clone())
            .unwrap();

    let id = manager.enqueue(file("later.txt", KB)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Queued);
    assert_eq!(manager.effective_limits().max_files, 0);

    probe.set_class(ConnectionClass::FourG);
    manager.network().notify_change();
    manager.wait_until_idle().await;
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Completed);
    manager.shutdown().await;
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let client = ScriptedClient::new();
    client.close_gate();
    let manager = manager(&client, QueueConfig::default());
    let events = collect(&manager, &[EventKind::Paused, EventKind::Resumed]);

    let id = manager.enqueue(file("doc.pdf", KB)).unwrap();
    eventually(|| manager.active_count() == 1).await;

    manager.pause(&id).unwrap();
    manager.pause(&id).unwrap();
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Paused);

    manager.resume(&id).unwrap();
    manager.resume(&id).unwrap();
    {
        let kinds: Vec<EventKind> = events.lock().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![EventKind::Paused, EventKind::Resumed]);
    }

    client.open_gate();
    manager.wait_until_idle().await;
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Completed);
    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_aborts_in_flight_and_forbids_resume() {
    let client = ScriptedClient::new();
    client.close_gate();
    let manager = manager(&client, QueueConfig::default());
    let cancelled = collect(&manager, &[EventKind::Cancelled]);

    let id = manager.enqueue(file("gone.bin", KB)).unwrap();
    eventually(|| manager.active_count() == 1).await;

    manager.cancel(&id).unwrap();
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Cancelled);
    assert_eq!(manager.resume(&id), Err(QueueError::NotFound(id.clone())));
    manager.cancel(&id).unwrap();

    client.open_gate();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.puts().is_empty());
    assert_eq!(cancelled.lock().len(), 1);
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Cancelled);
    manager.shutdown().await;
}

#[tokio::test]
async fn config_updates_are_atomic_snapshots() {
    let client = ScriptedClient::new();
    let manager = manager(&client, QueueConfig::default());

    std::thread::scope(|scope| {
        for writer in 0..4usize {
            let manager = &manager;
            scope.spawn(move || {
                for n in 1..=50usize {
                    let value = writer * 100 + n;
                    manager
                        .update_config(QueueConfigPatch {
                            max_concurrent_files: Some(value),
                            max_concurrent_chunks_per_file: Some(value),
                            ..Default::default()
                        })
                        .unwrap();
                }
            });
        }
        for _ in 0..4 {
            let manager = &manager;
            scope.spawn(move || {
                for _ in 0..500 {
                    let config = manager.config();
                    assert_eq!(
                        config.max_concurrent_files,
                        config.max_concurrent_chunks_per_file
                    );
                }
            });
        }
    });

    // 非法更新整体拒绝
    let before = manager.config();
    assert!(manager
        .update_config(QueueConfigPatch {
            max_concurrent_files: Some(9),
            chunk_size: Some(1),
            ..Default::default()
        })
        .is_err());
    assert_eq!(manager.config(), before);
    manager.shutdown().await;
}

#[tokio::test]
async fn expired_target_is_refreshed_without_counting_retry() {
    let client = ScriptedClient::new();
    client.expire_target("exp.bin", 1, 0);
    let manager = manager(&client, QueueConfig::default());
    let retried = collect(&manager, &[EventKind::Retried]);

    let id = manager.enqueue(file("exp.bin", KB)).unwrap();
    manager.wait_until_idle().await;

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Completed);
    assert_eq!(snapshot.attempts, 0);
    assert_eq!(client.targets_issued("exp.bin"), 2);
    assert_eq!(client.puts()[0].upload_id, "exp.bin#2");
    assert!(retried.lock().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn session_is_created_once_and_reused() {
    let client = ScriptedClient::new();
    let manager = manager(&client, QueueConfig::default());
    for i in 0..4 {
        manager.enqueue(file(&format!("s{}", i), KB)).unwrap();
    }
    manager.wait_until_idle().await;
    assert_eq!(client.session_count(), 1);
    manager.shutdown().await;

    let client = ScriptedClient::new();
    let manager = UploadQueueManager::with_options(
        ManagerOptions {
            session_id: Some("existing".to_string()),
            ..Default::default()
        },
        collaborators(&client),
        broadband(),
    )
    .unwrap();
    manager.enqueue(file("reuse", KB)).unwrap();
    manager.wait_until_idle().await;
    assert_eq!(client.session_count(), 0);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn target_that_keeps_expiring_fails_as_expired() {
    let client = ScriptedClient::new();
    client.always_expire("stale.bin");
    let manager = manager(
        &client,
        QueueConfig {
            retry_attempts: 2,
            base_retry_delay_ms: 100,
            ..Default::default()
        },
    );
    let events = collect(&manager, &[EventKind::Retried, EventKind::Failed]);

    let id = manager.enqueue(file("stale.bin", KB)).unwrap();
    manager.wait_until_idle().await;

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Failed);
    assert_eq!(
        snapshot.error.map(|e| e.category()),
        Some(FailureCategory::Expired)
    );
    assert_eq!(snapshot.attempts, 0);
    // 首次签发 + 两次重新申请
    assert_eq!(client.targets_issued("stale.bin"), 3);
    assert!(client.puts().is_empty());
    let kinds: Vec<EventKind> = events.lock().iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec![EventKind::Failed]);
    manager.shutdown().await;
}

#[tokio::test]
async fn short_lived_target_is_not_refreshed_per_chunk() {
    let client = ScriptedClient::new();
    client.set_target_lifetime(Duration::from_secs(20));
    client.set_put_delay(Duration::from_millis(300));
    let manager = manager(
        &client,
        QueueConfig {
            chunk_size: 256 * KB as u64,
            target_expiry_margin_secs: 30,
            ..Default::default()
        },
    );

    let id = manager.enqueue(file("short.bin", 2 * MB)).unwrap();
    manager.wait_until_idle().await;

    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Completed);
    assert_eq!(client.targets_issued("short.bin"), 1);
    let puts = client.puts();
    assert_eq!(puts.len(), 8);
    assert!(puts.iter().all(|p| p.upload_id == "short.bin#1"));
    assert_eq!(snapshot.artifact_id.as_deref(), Some("artifact:short.bin#1:8"));
    manager.shutdown().await;
}

#[tokio::test]
async fn stalled_transfer_is_reported_without_failing() {
    let client = ScriptedClient::new();
    client.close_gate();
    let manager = manager(
        &client,
        QueueConfig {
            stall_threshold_secs: 1,
            progress_interval_ms: 100,
            ..Default::default()
        },
    );
    let stalled = collect(&manager, &[EventKind::Stalled]);

    let id = manager.enqueue(file("slow.bin", KB)).unwrap();
    for _ in 0..60 {
        if !stalled.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    {
        let events = stalled.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            QueueEvent::Stalled { file_id, transferred, idle_secs }
                if *file_id == id && *transferred == 0 && *idle_secs >= 1
        ));
    }
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Active);

    client.open_gate();
    manager.wait_until_idle().await;
    assert_eq!(manager.status(&id).unwrap().status, FileStatus::Completed);
    manager.shutdown().await;
}

#[tokio::test]
async fn active_files_never_exceed_reported_limit() {
    let client = ScriptedClient::new();
    client.close_gate();
    let probe = Arc::new(StaticProbe::new(ConnectionClass::Broadband));
    let manager = Arc::new(
        UploadQueueManager::new(
            QueueConfig {
                max_concurrent_files: 4,
                adaptive_optimization_enabled: false,
                ..Default::default()
            },
            collaborators(&client),
            probe.clone(),
        )
        .unwrap(),
    );

    let observed = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    {
        let weak = Arc::downgrade(&manager);
        let observed = observed.clone();
        let violations = violations.clone();
        manager.events().on_any(move |_| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            // 先读上限再数运行中的文件
            let limits = manager.effective_limits();
            let active = manager.active_count();
            observed.fetch_add(1, Ordering::SeqCst);
            if active > limits.max_files {
                violations.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    for i in 0..6 {
        manager.enqueue(file(&format!("c{}", i), 64 * KB)).unwrap();
    }
    eventually(|| manager.active_count() == 4).await;

    probe.set_class(ConnectionClass::ThreeG);
    assert!(manager.network().notify_change());
    eventually(|| manager.active_count() == 2).await;
    probe.set_class(ConnectionClass::TwoG);
    assert!(manager.network().notify_change());
    eventually(|| manager.active_count() == 1).await;

    client.open_gate();
    manager.wait_until_idle().await;
    assert!(manager
        .list()
        .iter()
        .all(|s| s.status == FileStatus::Completed));
    assert!(observed.load(Ordering::SeqCst) > 0);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_requeues_aborted_uploads() {
    let client = ScriptedClient::new();
    client.close_gate();
    let manager = manager(&client, QueueConfig::default());

    let id = manager.enqueue(file("abort.bin", KB)).unwrap();
    eventually(|| manager.active_count() == 1).await;

    manager.shutdown().await;
    let snapshot = manager.status(&id).unwrap();
    assert_eq!(snapshot.status, FileStatus::Queued);
    assert_eq!(snapshot.transferred, 0);
    assert_eq!(manager.active_count(), 0);
}
