//! Postgres-backed task queue.
//!
//! One row per task in `task_records`. Claims run in a transaction with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers (in this or any other
//! process) never receive the same row. Status updates lock the row, apply
//! [`Task::apply_update`] and write the result back in the same transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | QueueError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Backend` ("already exists") |
//! | Database (other) | any | `Backend` |
//! | PoolClosed / Io / Tls / other | N/A | `Backend` |
//! | Decode / ColumnDecode | N/A | `Serialization` |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::domain::{OwnerId, Task, TaskId, TaskPayload, TaskStatus, TaskUpdate};
use crate::observability::QueueCounts;
use crate::ports::{Clock, QueueError, SystemClock, TaskQueue};

use super::DEFAULT_DEQUEUE_TIMEOUT;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// DDL for the queue table. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS task_records (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL,
        payload JSONB NOT NULL,
        progress SMALLINT NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_status_created ON task_records(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_task_owner_status ON task_records(owner_id, status)",
];

const SELECT_COLUMNS: &str = "id, owner_id, task_type, status, payload, progress, retry_count, \
     max_retries, error_message, created_at, started_at, completed_at, updated_at";

#[derive(Clone)]
pub struct PostgresTaskQueue {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    dequeue_timeout: Duration,
    poll_interval: Duration,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create `task_records` and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        info!("task_records schema ready");
        Ok(())
    }

    /// One claim attempt. `None` if no pending row is available right now.
    async fn try_claim(&self) -> Result<Option<Task>, QueueError> {
        let mut tx = self.begin("claim").await?;

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM task_records \
             WHERE status = 'pending' \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(None);
        };

        let mut task = decode_row(&row)?;
        if !task.claim(self.clock.now()) {
            tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
            return Ok(None);
        }
        write_back(&mut tx, &task).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        debug!(task_id = %task.id, "claimed task");
        Ok(Some(task))
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    #[instrument(skip(self, task), fields(task_id = %task.id, owner_id = %task.owner_id), err)]
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let task = task.into_pending(self.clock.now());
        let row = TaskRow::from_task(&task)?;

        sqlx::query(&format!(
            "INSERT INTO task_records ({SELECT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(&row.id)
        .bind(&row.owner_id)
        .bind(&row.task_type)
        .bind(&row.status)
        .bind(&row.payload)
        .bind(row.progress)
        .bind(row.retry_count)
        .bind(row.max_retries)
        .bind(&row.error_message)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        info!(task_type = %task.task_type(), "enqueued task");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.dequeue_timeout;
        loop {
            if let Some(task) = self.try_claim().await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self, update), fields(task_id = %id, status = %update.status), err)]
    async fn update_status(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, QueueError> {
        let mut tx = self.begin("update_status").await?;

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM task_records WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        };

        let mut task = decode_row(&row)?;
        if let Err(rejected) = task.apply_update(update, self.clock.now()) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(reason = %rejected, "status update rejected");
            return Ok(false);
        }

        write_back(&mut tx, &task).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(true)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM task_records WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn get_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Task>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM task_records \
             WHERE owner_id = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_owner", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, QueueError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| QueueError::Config(format!("max_age out of range: {e}")))?;
        let cutoff = self.clock.now() - max_age;

        let result = sqlx::query(
            "DELETE FROM task_records \
             WHERE status IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("cleanup_old", e))?;

        let removed = result.rows_affected();
        info!(removed, "cleaned up old tasks");
        Ok(removed)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| QueueError::Config(format!("older_than out of range: {e}")))?;
        let now = self.clock.now();

        let result = sqlx::query(
            "UPDATE task_records SET status = 'pending', progress = 0, updated_at = $2 \
             WHERE status IN ('processing', 'retrying') AND updated_at < $1",
        )
        .bind(now - older_than)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(requeued, "requeued stale in-flight tasks");
        }
        Ok(requeued)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM task_records GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("counts", e))?;
            let status = TaskStatus::from_str(&status)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            counts.record(status, n.max(0) as u64);
        }
        Ok(counts)
    }
}

async fn write_back(tx: &mut Transaction<'static, Postgres>, task: &Task) -> Result<(), QueueError> {
    let row = TaskRow::from_task(task)?;
    sqlx::query(
        "UPDATE task_records SET \
             status = $2, progress = $3, retry_count = $4, error_message = $5, \
             started_at = $6, completed_at = $7, updated_at = $8 \
         WHERE id = $1",
    )
    .bind(&row.id)
    .bind(&row.status)
    .bind(row.progress)
    .bind(row.retry_count)
    .bind(&row.error_message)
    .bind(row.started_at)
    .bind(row.completed_at)
    .bind(row.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_back", e))?;
    Ok(())
}

fn decode_row(row: &PgRow) -> Result<Task, QueueError> {
    TaskRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_row", e))?
        .into_task()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => QueueError::Backend(format!("{operation}: task already exists ({msg})")),
                _ => QueueError::Backend(format!("database error in {operation}: {msg}")),
            }
        }
        sqlx::Error::ColumnDecode { index, source } => {
            QueueError::Serialization(format!("{operation}: column {index}: {source}"))
        }
        sqlx::Error::Decode(e) => QueueError::Serialization(format!("{operation}: {e}")),
        sqlx::Error::PoolClosed => QueueError::Backend(format!("{operation}: connection pool closed")),
        other => QueueError::Backend(format!("{operation}: {other}")),
    }
}

// SQLx row type

/// Column-for-column image of a `task_records` row.
#[derive(Debug, Clone, PartialEq)]
struct TaskRow {
    id: String,
    owner_id: String,
    task_type: String,
    status: String,
    payload: serde_json::Value,
    progress: i16,
    retry_count: i32,
    max_retries: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            progress: row.try_get("progress")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TaskRow {
    fn from_task(task: &Task) -> Result<Self, QueueError> {
        Ok(TaskRow {
            id: task.id.as_str().to_string(),
            owner_id: task.owner_id.as_str().to_string(),
            task_type: task.task_type().as_str().to_string(),
            status: task.status.as_str().to_string(),
            payload: serde_json::to_value(&task.payload)?,
            progress: i16::from(task.progress),
            retry_count: to_i32("retry_count", task.retry_count)?,
            max_retries: to_i32("max_retries", task.max_retries)?,
            error_message: task.error_message.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            updated_at: task.updated_at,
        })
    }

    fn into_task(self) -> Result<Task, QueueError> {
        let payload: TaskPayload = serde_json::from_value(self.payload)?;
        if payload.kind().as_str() != self.task_type {
            return Err(QueueError::Serialization(format!(
                "task {}: task_type column '{}' does not match payload '{}'",
                self.id,
                self.task_type,
                payload.kind()
            )));
        }
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let progress = u8::try_from(self.progress)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| {
                QueueError::Serialization(format!("task {}: progress {} out of range", self.id, self.progress))
            })?;

        Ok(Task {
            id: TaskId::from(self.id),
            owner_id: OwnerId::from(self.owner_id),
            payload,
            status,
            progress,
            retry_count: from_i32("retry_count", self.retry_count)?,
            max_retries: from_i32("max_retries", self.max_retries)?,
            error_message: self.error_message,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_i32(column: &str, value: u32) -> Result<i32, QueueError> {
    i32::try_from(value).map_err(|_| QueueError::Serialization(format!("{column} {value} out of range")))
}

fn from_i32(column: &str, value: i32) -> Result<u32, QueueError> {
    u32::try_from(value).map_err(|_| QueueError::Serialization(format!("{column} {value} out of range")))
}
