//! Task: the unit of work and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{OwnerId, TaskId};
use super::payload::{TaskKind, TaskPayload};
use super::status::TaskStatus;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Error message stored when a task fails without an explicit reason.
const FALLBACK_ERROR: &str = "task failed";

/// A task as stored by every queue backend.
///
/// All status changes go through [`Task::claim`] and [`Task::apply_update`],
/// so the in-memory, shared-store and relational backends enforce the same
/// lifecycle rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: OwnerId,
    pub payload: TaskPayload,
    pub status: TaskStatus,

    /// 0..=100; 100 only once completed.
    pub progress: u8,

    /// Failed attempts so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    pub max_retries: u32,

    /// Only set once the task has failed.
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(owner_id: OwnerId, payload: TaskPayload) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            owner_id,
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn task_type(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Retry budget left after the current attempt fails?
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Terminal and finished before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_terminal() && self.completed_at.is_some_and(|at| at < cutoff)
    }

    /// Reset fields a producer must not control before the task is stored.
    pub fn into_pending(mut self, now: DateTime<Utc>) -> Self {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.retry_count = self.retry_count.min(self.max_retries);
        self.error_message = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
        self
    }

    /// The `pending -> processing` claim. Returns false if not claimable.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.is_claimable() {
            return false;
        }
        self.status = TaskStatus::Processing;
        self.started_at.get_or_insert(now);
        self.updated_at = now;
        true
    }

    /// In flight and untouched since before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && self.updated_at < cutoff
    }

    /// Hand an abandoned in-flight task back to the queue. The retry
    /// count is kept; returns false for pending or terminal tasks.
    pub fn release(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.is_in_flight() {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.updated_at = now;
        true
    }

    /// Apply a partial status update.
    pub fn apply_update(
        &mut self,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), UpdateRejected> {
        if self.status.is_terminal() {
            return Err(UpdateRejected::Terminal(self.status));
        }
        // Only `claim` moves a task out of pending.
        if self.status == TaskStatus::Pending {
            return Err(UpdateRejected::NotClaimed);
        }

        match update.status {
            TaskStatus::Pending => return Err(UpdateRejected::BackToPending(self.status)),
            TaskStatus::Processing => {
                self.started_at.get_or_insert(now);
                if let Some(progress) = update.progress {
                    let progress = progress.min(99);
                    self.progress = if self.status == TaskStatus::Processing {
                        self.progress.max(progress)
                    } else {
                        progress
                    };
                }
            }
            TaskStatus::Retrying => {
                self.progress = 0;
                self.retry_count = (self.retry_count + 1).min(self.max_retries);
            }
            TaskStatus::Completed => {
                self.progress = 100;
                self.error_message = None;
                self.completed_at.get_or_insert(now);
            }
            TaskStatus::Failed => {
                let progress = update.progress.unwrap_or(self.progress);
                self.progress = progress.min(99);
                self.error_message = Some(
                    update
                        .error_message
                        .filter(|msg| !msg.trim().is_empty())
                        .unwrap_or_else(|| FALLBACK_ERROR.to_string()),
                );
                self.completed_at.get_or_insert(now);
            }
        }

        self.status = update.status;
        self.updated_at = now;
        Ok(())
    }
}

/// Partial update applied through `TaskQueue::update_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            error_message: None,
        }
    }

    pub fn processing(progress: u8) -> Self {
        Self::new(TaskStatus::Processing).with_progress(progress)
    }

    pub fn retrying() -> Self {
        Self::new(TaskStatus::Retrying).with_progress(0)
    }

    pub fn completed() -> Self {
        Self::new(TaskStatus::Completed).with_progress(100)
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Failed).with_error(error_message)
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_error(mut self, error_message: impl Into<String>) -> Self {
        self.error_message = Some(error_message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateRejected {
    #[error("task is already {0}")]
    Terminal(TaskStatus),

    #[error("task cannot move from {0} back to pending")]
    BackToPending(TaskStatus),

    #[error("task has not been claimed yet")]
    NotClaimed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task() -> Task {
        Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf"))
    }

    fn claimed() -> Task {
        let mut task = task();
        assert!(task.claim(Utc::now()));
        task
    }

    #[test]
    fn claim_sets_started_at_once() {
        let mut task = task();
        let first = Utc::now();
        assert!(task.claim(first));
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.started_at, Some(first));

        // Not claimable twice.
        assert!(!task.claim(Utc::now()));

        task.apply_update(TaskUpdate::retrying(), Utc::now()).unwrap();
        task.apply_update(TaskUpdate::processing(5), Utc::now()).unwrap();
        assert_eq!(task.started_at, Some(first));
    }

    #[test]
    fn progress_never_decreases_while_processing() {
        let mut task = claimed();
        task.apply_update(TaskUpdate::processing(50), Utc::now()).unwrap();
        task.apply_update(TaskUpdate::processing(20), Utc::now()).unwrap();
        assert_eq!(task.progress, 50);

        // 100 is reserved for completion.
        task.apply_update(TaskUpdate::processing(100), Utc::now()).unwrap();
        assert_eq!(task.progress, 99);
    }

    #[test]
    fn retrying_resets_progress_and_counts() {
        let mut task = claimed().with_max_retries(2);
        task.apply_update(TaskUpdate::processing(70), Utc::now()).unwrap();
        task.apply_update(TaskUpdate::retrying(), Utc::now()).unwrap();

        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 1);

        task.apply_update(TaskUpdate::retrying(), Utc::now()).unwrap();
        task.apply_update(TaskUpdate::retrying(), Utc::now()).unwrap();
        assert_eq!(task.retry_count, 2, "retry_count is capped at max_retries");
    }

    #[test]
    fn completed_forces_full_progress() {
        let mut task = claimed();
        task.apply_update(TaskUpdate::new(TaskStatus::Completed), Utc::now())
            .unwrap();

        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        assert!(task.error_message.is_none());
    }

    #[rstest]
    #[case(Some("ocr backend unavailable"), "ocr backend unavailable")]
    #[case(Some("   "), FALLBACK_ERROR)]
    #[case(None, FALLBACK_ERROR)]
    fn failed_always_has_message(#[case] given: Option<&str>, #[case] expected: &str) {
        let mut task = claimed();
        let mut update = TaskUpdate::new(TaskStatus::Failed).with_progress(100);
        update.error_message = given.map(str::to_string);
        task.apply_update(update, Utc::now()).unwrap();

        assert_eq!(task.error_message.as_deref(), Some(expected));
        assert!(task.progress < 100);
    }

    #[rstest]
    #[case(TaskUpdate::completed())]
    #[case(TaskUpdate::failed("boom"))]
    fn terminal_state_is_write_once(#[case] terminal: TaskUpdate) {
        let mut task = claimed();
        task.apply_update(terminal.clone(), Utc::now()).unwrap();
        let snapshot = task.clone();

        for next in [
            TaskUpdate::processing(10),
            TaskUpdate::retrying(),
            TaskUpdate::completed(),
            TaskUpdate::failed("again"),
        ] {
            let err = task.apply_update(next, Utc::now()).unwrap_err();
            assert_eq!(err, UpdateRejected::Terminal(terminal.status));
        }
        assert_eq!(task, snapshot);
    }

    #[test]
    fn cannot_return_to_pending() {
        let mut task = claimed();
        assert_eq!(
            task.apply_update(TaskUpdate::new(TaskStatus::Pending), Utc::now()),
            Err(UpdateRejected::BackToPending(TaskStatus::Processing))
        );
    }

    #[rstest]
    #[case(TaskUpdate::processing(30))]
    #[case(TaskUpdate::retrying())]
    #[case(TaskUpdate::completed())]
    #[case(TaskUpdate::failed("boom"))]
    #[case(TaskUpdate::new(TaskStatus::Pending))]
    fn unclaimed_task_rejects_updates(#[case] update: TaskUpdate) {
        let mut task = task();
        let before = task.clone();

        assert_eq!(task.apply_update(update, Utc::now()), Err(UpdateRejected::NotClaimed));
        assert_eq!(task, before);
        assert!(task.claim(Utc::now()));
    }

    #[rstest]
    #[case(TaskUpdate::processing(40))]
    #[case(TaskUpdate::retrying())]
    fn stale_in_flight_task_is_released(#[case] update: TaskUpdate) {
        let now = Utc::now();
        let mut task = claimed();
        task.apply_update(update, now).unwrap();
        let retries = task.retry_count;
        assert!(!task.is_stale(now));
        assert!(task.is_stale(now + chrono::Duration::minutes(1)));

        let later = now + chrono::Duration::minutes(5);
        assert!(task.release(later));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, retries);
        assert_eq!(task.updated_at, later);
        assert!(task.claim(later));
    }

    #[test]
    fn pending_and_terminal_tasks_are_never_released() {
        let now = Utc::now();
        let mut pending = task();
        assert!(!pending.is_stale(now + chrono::Duration::days(1)));
        assert!(!pending.release(now));

        let mut done = claimed();
        done.apply_update(TaskUpdate::completed(), now).unwrap();
        assert!(!done.is_stale(now + chrono::Duration::days(1)));
        assert!(!done.release(now));
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[test]
    fn expiry_only_applies_to_terminal_tasks() {
        let now = Utc::now();
        let mut task = claimed();
        assert!(!task.is_expired(now + chrono::Duration::days(1)));

        task.apply_update(TaskUpdate::completed(), now).unwrap();
        assert!(task.is_expired(now + chrono::Duration::seconds(1)));
        assert!(!task.is_expired(now));
    }

    #[test]
    fn task_round_trips_through_json() {
        let task = claimed();
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
