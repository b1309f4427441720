//! Backend selection with lazy, one-time initialization.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::info;

use crate::ports::{FileSnapshotSink, QueueError, TaskQueue};

use super::{DEFAULT_DEQUEUE_TIMEOUT, DEFAULT_REDIS_PREFIX, InMemoryTaskQueue, PostgresTaskQueue};

/// Which [`TaskQueue`] implementation to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueBackend {
    #[default]
    Postgres,
    Redis,
    Memory,
}

impl QueueBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueBackend::Postgres => "postgres",
            QueueBackend::Redis => "redis",
            QueueBackend::Memory => "memory",
        }
    }
}

impl fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueBackend {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "database" => Ok(QueueBackend::Postgres),
            "redis" => Ok(QueueBackend::Redis),
            "memory" | "in-memory" => Ok(QueueBackend::Memory),
            other => Err(QueueError::Config(format!("unknown queue backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    /// Snapshot file of the memory backend. `None` keeps it ephemeral.
    pub snapshot_path: Option<PathBuf>,
    pub dequeue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            database_url: None,
            redis_url: None,
            redis_prefix: DEFAULT_REDIS_PREFIX.to_string(),
            snapshot_path: None,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        }
    }
}

/// Owns the one queue a process works against.
///
/// The backend is built on the first call to [`TaskQueueManager::queue`];
/// every later call returns the same handle. Construct one per process and
/// pass it (or the queue it yields) to whoever needs it.
pub struct TaskQueueManager {
    config: QueueConfig,
    queue: OnceCell<Arc<dyn TaskQueue>>,
}

impl TaskQueueManager {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queue: OnceCell::new(),
        }
    }

    /// Manager around an already built queue.
    pub fn with_queue(config: QueueConfig, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            config,
            queue: OnceCell::new_with(Some(queue)),
        }
    }

    pub fn backend(&self) -> QueueBackend {
        self.config.backend
    }

    pub fn is_initialized(&self) -> bool {
        self.queue.initialized()
    }

    pub async fn queue(&self) -> Result<Arc<dyn TaskQueue>, QueueError> {
        self.queue
            .get_or_try_init(|| build(&self.config))
            .await
            .cloned()
    }
}

async fn build(config: &QueueConfig) -> Result<Arc<dyn TaskQueue>, QueueError> {
    info!(backend = %config.backend, "initializing task queue");
    match config.backend {
        QueueBackend::Memory => {
            let queue = match &config.snapshot_path {
                Some(path) => InMemoryTaskQueue::open(Arc::new(FileSnapshotSink::new(path))).await?,
                None => InMemoryTaskQueue::new(),
            };
            Ok(Arc::new(queue.with_dequeue_timeout(config.dequeue_timeout)))
        }
        QueueBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| QueueError::Config("DATABASE_URL is required for the postgres backend".into()))?;
            let queue = PostgresTaskQueue::connect(url)
                .await?
                .with_dequeue_timeout(config.dequeue_timeout);
            queue.ensure_schema().await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Redis => build_redis(config).await,
    }
}

#[cfg(feature = "redis")]
async fn build_redis(config: &QueueConfig) -> Result<Arc<dyn TaskQueue>, QueueError> {
    let url = config
        .redis_url
        .as_deref()
        .ok_or_else(|| QueueError::Config("REDIS_URL is required for the redis backend".into()))?;
    let queue = super::RedisTaskQueue::connect(url, config.redis_prefix.clone())
        .await?
        .with_dequeue_timeout(config.dequeue_timeout);
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn build_redis(_config: &QueueConfig) -> Result<Arc<dyn TaskQueue>, QueueError> {
    Err(QueueError::Config(
        "redis backend requested but docket-core was built without the `redis` feature".into(),
    ))
}
