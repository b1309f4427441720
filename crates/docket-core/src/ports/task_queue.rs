//! TaskQueue port: durable storage plus claim semantics for tasks.
//!
//! Implementations live in [`crate::queue`]: in-memory (snapshot/restore),
//! shared store (redis) and relational (postgres, the default).

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{OwnerId, Task, TaskId, TaskUpdate};
use crate::observability::QueueCounts;

/// Storage-level failure. Callers treat every variant as retryable; the task
/// is left in its last stored state.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("task serialization error: {0}")]
    Serialization(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("queue configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Store `task` as pending and make it visible to consumers.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Claim the oldest pending task, moving it to processing.
    ///
    /// Waits at most the backend's dequeue timeout and returns `None` when
    /// nothing became available. A task is handed to exactly one caller.
    async fn dequeue(&self) -> Result<Option<Task>, QueueError>;

    /// Partially update a task. `Ok(false)` if the id is unknown or the
    /// transition was rejected (terminal tasks are write-once).
    async fn update_status(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, QueueError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, QueueError>;

    /// All tasks of an owner, oldest first.
    async fn get_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Task>, QueueError>;

    /// Delete terminal tasks that finished more than `max_age` ago.
    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, QueueError>;

    /// Put processing/retrying tasks not updated for `older_than` back to
    /// pending, so work abandoned by a dead worker is claimed again.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Number of tasks per status.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
