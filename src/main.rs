use adaptive_upload_queue::{
    config::{AppConfig, PriorityMode, DEFAULT_CONFIG_PATH},
    logging, Collaborators, EventKind, HttpUploadClient, ManagerOptions, NewUpload, QueueEvent,
    StaticProbe, UploadQueueManager,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 把本地文件加入自适应上传队列并上传
#[derive(Debug, Parser)]
#[command(name = "upload-queue", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 复用已有的上传会话
    #[arg(long)]
    session: Option<String>,

    /// 优先级模式：fifo / smallest-first / largest-first
    #[arg(long)]
    priority: Option<PriorityMode>,

    /// 要上传的文件
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::Queued {
            file_name,
            file_size,
            ..
        } => println!("⏳ 排队 {} ({} bytes)", file_name, file_size),
        QueueEvent::Started {
            file_id,
            resumed_bytes,
            ..
        } => println!("▶ 开始 {} (已上传 {} bytes)", file_id, resumed_bytes),
        QueueEvent::Progress {
            file_id,
            progress,
            speed,
            eta_secs,
            ..
        } => println!(
            "  {} {:.1}% {:.1} KB/s 剩余 {}",
            file_id,
            progress,
            *speed as f64 / 1024.0,
            eta_secs.map_or("--".to_string(), |s| format!("{}s", s))
        ),
        QueueEvent::Retried {
            file_id,
            chunk_index,
            attempt,
            delay_ms,
            ..
        } => println!(
            "↻ {} 分片 {} 第 {} 次重试，{}ms 后",
            file_id, chunk_index, attempt, delay_ms
        ),
        QueueEvent::Completed {
            file_id,
            artifact_id,
            ..
        } => println!("✓ 完成 {} -> {}", file_id, artifact_id),
        QueueEvent::Failed { file_id, reason } => println!("✗ 失败 {}: {}", file_id, reason),
        QueueEvent::Cancelled { file_id } => println!("✗ 取消 {}", file_id),
        QueueEvent::Throttled { file_id } => println!("⏸ 并发收缩，挂起 {}", file_id),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    let _log_guard = logging::init_logging(&config.log)?;
    info!("upload-queue v{} 启动中...", env!("CARGO_PKG_VERSION"));

    if let Some(mode) = cli.priority {
        config.queue.priority_mode = mode;
    }

    let client = Arc::new(HttpUploadClient::new(&config.api)?);
    let probe = Arc::new(StaticProbe::new(config.network.initial_class));
    let options = ManagerOptions {
        session_id: cli.session.clone(),
        ..ManagerOptions::from_app_config(&config)
    };
    let manager = UploadQueueManager::with_options(options, Collaborators::from_client(client), probe)
        .context("创建上传队列失败")?;

    manager.events().on_any(print_event);
    manager.on(EventKind::LimitsChanged, |event| {
        if let QueueEvent::LimitsChanged { limits } = event {
            info!(
                "有效并发上限: 文件 {}, 单文件分片 {}",
                limits.max_files, limits.max_chunks_per_file
            );
        }
    });

    let mut enqueued = 0;
    for path in &cli.files {
        match NewUpload::from_path(path).await {
            Ok(upload) => {
                manager.enqueue(upload)?;
                enqueued += 1;
            }
            Err(e) => error!("无法读取文件 {:?}: {}", path, e),
        }
    }
    if enqueued == 0 {
        anyhow::bail!("没有可上传的文件");
    }

    tokio::select! {
        _ = manager.wait_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            let paused = manager.pause_all();
            warn!("收到中断信号，已暂停 {} 个文件", paused);
        }
    }

    let files = manager.list();
    let failed = files
        .iter()
        .filter(|f| f.status == adaptive_upload_queue::FileStatus::Failed)
        .count();
    info!(
        "上传结束: 共 {} 个文件, 失败 {} 个",
        files.len(),
        failed
    );

    manager.shutdown().await;
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
