//! `docket`: run workers against a task queue and inspect it.

mod processors;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docket_core::DocketConfig;
use docket_core::domain::{OwnerId, Task, TaskId, TaskKind, TaskPayload};
use docket_core::observability::init_logging;
use docket_core::ports::{LoggingNotifier, LoggingStatusStore, TaskQueue};
use docket_core::queue::{QueueBackend, QueueConfig, TaskQueueManager};
use docket_core::resilience::{RetryConfig, RetryPolicy};
use docket_core::runtime::ProcessorRegistry;
use docket_core::worker::{
    CleanupSchedule, WorkerConfig, WorkerDeps, WorkerManager, WorkerStats, spawn_cleanup_loop,
};
use tracing::{info, warn};

use processors::{FlakyProcessor, NormalizeProcessor, OcrProcessor};

#[derive(Parser)]
#[command(name = "docket", version, about = "Document processing task queue")]
struct Cli {
    /// Queue backend; overrides DOCKET_QUEUE_BACKEND.
    #[arg(long, global = true)]
    backend: Option<QueueBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted.
    Work {
        /// Number of workers; overrides DOCKET_WORKER_COUNT.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Queue a document for text extraction and print the task id.
    Enqueue {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Print one task as JSON.
    Status { task_id: String },
    /// Print all tasks of an owner as JSON, oldest first.
    Owner { owner_id: String },
    /// Print the number of tasks per status.
    Counts,
    /// Remove completed and failed tasks older than the given age.
    Cleanup {
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Put in-flight tasks not updated for the given time back to pending.
    Requeue {
        #[arg(long)]
        stale_after_minutes: Option<u64>,
    },
    /// Process a batch of tasks with a flaky processor on an in-memory queue.
    Demo {
        #[arg(long, default_value_t = 5)]
        tasks: usize,
        #[arg(long, default_value_t = 3)]
        workers: usize,
        /// Failed attempts per task before it succeeds.
        #[arg(long, default_value_t = 1)]
        failures: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DocketConfig::from_env().context("reading configuration")?;
    init_logging(config.log_format);

    if let Some(backend) = cli.backend {
        config.queue.backend = backend;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Work { workers } => work(config, workers).await,
            Commands::Enqueue {
                owner,
                file,
                max_retries,
            } => enqueue(&config, owner, file, max_retries).await,
            Commands::Status { task_id } => {
                let queue = open_queue(&config).await?;
                match queue.get(&TaskId::new(task_id.clone())).await? {
                    Some(task) => print_json(&task),
                    None => bail!("task {task_id} not found"),
                }
            }
            Commands::Owner { owner_id } => {
                let queue = open_queue(&config).await?;
                print_json(&queue.get_by_owner(&OwnerId::new(owner_id)).await?)
            }
            Commands::Counts => {
                let queue = open_queue(&config).await?;
                print_json(&queue.counts().await?)
            }
            Commands::Cleanup { max_age_hours } => {
                let queue = open_queue(&config).await?;
                let max_age = max_age_hours
                    .map(|h| Duration::from_secs(h * 3600))
                    .unwrap_or(config.cleanup_max_age);
                let removed = queue.cleanup_old(max_age).await?;
                println!("removed {removed} tasks");
                Ok(())
            }
            Commands::Requeue { stale_after_minutes } => {
                let queue = open_queue(&config).await?;
                let older_than = stale_after_minutes
                    .map(|m| Duration::from_secs(m * 60))
                    .unwrap_or(config.stale_after);
                let requeued = queue.requeue_stale(older_than).await?;
                println!("requeued {requeued} tasks");
                Ok(())
            }
            Commands::Demo {
                tasks,
                workers,
                failures,
            } => demo(tasks, workers, failures).await,
        }
    })
}

async fn open_queue(config: &DocketConfig) -> Result<Arc<dyn TaskQueue>> {
    TaskQueueManager::new(config.queue.clone())
        .queue()
        .await
        .with_context(|| format!("opening {} queue", config.queue.backend))
}

async fn work(config: DocketConfig, workers: Option<usize>) -> Result<()> {
    let workers = workers.unwrap_or(config.worker_count);
    if workers == 0 {
        bail!("at least one worker is required");
    }
    let queue = open_queue(&config).await?;

    // Claims left behind by a previous run that died mid-task.
    let requeued = queue
        .requeue_stale(config.stale_after)
        .await
        .context("requeueing stale tasks")?;
    if requeued > 0 {
        warn!(requeued, "requeued tasks abandoned by a previous run");
    }

    let mut registry = ProcessorRegistry::new();
    registry.register(
        TaskKind::OcrProcessing,
        Arc::new(OcrProcessor::new(config.breaker.clone())),
    )?;
    registry.register(TaskKind::TextNormalization, Arc::new(NormalizeProcessor))?;

    let deps = WorkerDeps::new(queue.clone(), Arc::new(registry))
        .with_status_store(Arc::new(LoggingStatusStore))
        .with_notifier(Arc::new(LoggingNotifier))
        .with_retry_policy(RetryPolicy::new(config.retry.clone()))
        .with_config(config.worker.clone());

    let pool = WorkerManager::start(workers, deps);
    let cleanup = spawn_cleanup_loop(
        queue,
        CleanupSchedule {
            interval: config.cleanup_interval,
            max_age: config.cleanup_max_age,
            stale_after: config.stale_after,
        },
        pool.cancellation_token(),
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested, finishing in-flight tasks");

    let stats = pool.shutdown().await;
    cleanup.await.context("cleanup loop")?;
    print_stats(&stats);
    Ok(())
}

async fn enqueue(
    config: &DocketConfig,
    owner: String,
    file: PathBuf,
    max_retries: Option<u32>,
) -> Result<()> {
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", file.display()))?;

    let mut task = Task::new(OwnerId::new(owner), TaskPayload::ocr(filename, file));
    if let Some(max_retries) = max_retries {
        task = task.with_max_retries(max_retries);
    }
    let id = task.id.clone();

    open_queue(config).await?.enqueue(task).await?;
    println!("{id}");
    Ok(())
}

async fn demo(tasks: usize, workers: usize, failures: u32) -> Result<()> {
    if workers == 0 {
        bail!("at least one worker is required");
    }
    let queue = TaskQueueManager::new(QueueConfig {
        backend: QueueBackend::Memory,
        dequeue_timeout: Duration::from_millis(200),
        ..QueueConfig::default()
    })
    .queue()
    .await?;

    let retry = RetryConfig {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        ..RetryConfig::default()
    };

    for i in 1..=tasks {
        let task = Task::new(
            OwnerId::new(format!("demo-doc-{i}")),
            TaskPayload::ocr(format!("page-{i}.pdf"), format!("/tmp/page-{i}.pdf")),
        )
        .with_max_retries(failures);
        queue.enqueue(task).await?;
    }

    let deps = WorkerDeps::new(queue.clone(), Arc::new(FlakyProcessor::new(failures)))
        .with_retry_policy(RetryPolicy::new(retry))
        .with_config(WorkerConfig {
            idle_interval: Duration::from_millis(100),
            error_backoff: Duration::from_millis(500),
        });
    let pool = WorkerManager::start(workers, deps);

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if queue.counts().await?.in_flight() == 0 {
            break;
        }
    }

    let stats = pool.shutdown().await;
    print_stats(&stats);
    print_json(&queue.counts().await?)
}

fn print_stats(stats: &WorkerStats) {
    println!(
        "claimed={} completed={} failed={} retries={}",
        stats.claimed, stats.completed, stats.failed, stats.retries
    );
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
