//! In-memory queue with snapshot/restore.
//!
//! Single-process only. Every mutation is followed by a full-state snapshot
//! handed to a [`SnapshotSink`]; `open` restores from the sink at startup.
//! Mutation and snapshot are not one atomic step, so a crash in between can
//! lose or resurrect a pending entry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::domain::{OwnerId, Task, TaskId, TaskStatus, TaskUpdate};
use crate::observability::QueueCounts;
use crate::ports::{Clock, NoopSnapshotSink, QueueError, SnapshotSink, SystemClock, TaskQueue};

use super::DEFAULT_DEQUEUE_TIMEOUT;

/// Queue state. `tasks` is the single source of truth; `pending` holds ids
/// only, in FIFO order.
#[derive(Default)]
struct InMemoryState {
    tasks: HashMap<TaskId, Task>,
    pending: VecDeque<TaskId>,
}

impl InMemoryState {
    /// Pop ids until one refers to a claimable task.
    fn claim_next(&mut self, clock: &dyn Clock) -> Option<Task> {
        while let Some(id) = self.pending.pop_front() {
            if let Some(task) = self.tasks.get_mut(&id) {
                if task.claim(clock.now()) {
                    return Some(task.clone());
                }
            }
        }
        None
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Snapshot {
            tasks,
            pending_ids: self.pending.iter().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let tasks: HashMap<TaskId, Task> = snapshot
            .tasks
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        let mut seen = HashSet::new();
        let mut pending: VecDeque<TaskId> = snapshot
            .pending_ids
            .into_iter()
            .filter(|id| tasks.get(id).is_some_and(|t| t.status == TaskStatus::Pending))
            .filter(|id| seen.insert(id.clone()))
            .collect();

        // Pending tasks whose id never made it into the list.
        let mut orphans: Vec<&Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !seen.contains(&t.id))
            .collect();
        orphans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.extend(orphans.into_iter().map(|t| t.id.clone()));

        Self { tasks, pending }
    }
}

/// Serialized form of the whole queue.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    tasks: Vec<Task>,
    pending_ids: Vec<TaskId>,
}

pub struct InMemoryTaskQueue {
    state: Mutex<InMemoryState>,
    notify: Notify,
    sink: Arc<dyn SnapshotSink>,
    clock: Arc<dyn Clock>,
    dequeue_timeout: Duration,
}

impl InMemoryTaskQueue {
    /// Ephemeral queue: no snapshot sink, system clock.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            notify: Notify::new(),
            sink: Arc::new(NoopSnapshotSink),
            clock: Arc::new(SystemClock),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        }
    }

    /// Queue persisted through `sink`, restored from its last snapshot.
    ///
    /// Tasks that were processing or retrying when the snapshot was taken
    /// are put back to pending so another worker picks them up.
    pub async fn open(sink: Arc<dyn SnapshotSink>) -> Result<Self, QueueError> {
        let queue = Self::new().with_sink(Arc::clone(&sink));
        if let Some(bytes) = sink.load().await? {
            queue.restore(&bytes).await?;
            let requeued = queue.requeue_in_flight().await?;
            let state = queue.state.lock().await;
            info!(
                tasks = state.tasks.len(),
                pending = state.pending.len(),
                requeued,
                "restored in-memory queue from snapshot"
            );
        }
        Ok(queue)
    }

    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Serialize the full queue state.
    pub async fn snapshot(&self) -> Result<Vec<u8>, QueueError> {
        let state = self.state.lock().await;
        Ok(serde_json::to_vec(&state.to_snapshot())?)
    }

    /// Replace the queue state with a snapshot produced by [`Self::snapshot`].
    pub async fn restore(&self, bytes: &[u8]) -> Result<(), QueueError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)
            .map_err(|e| QueueError::Snapshot(format!("decode: {e}")))?;
        let has_pending = {
            let mut state = self.state.lock().await;
            *state = InMemoryState::from_snapshot(snapshot);
            !state.pending.is_empty()
        };
        if has_pending {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Put every processing/retrying task back to pending. Only valid while
    /// no worker holds a task, i.e. at startup.
    async fn requeue_in_flight(&self) -> Result<usize, QueueError> {
        Ok(self.release_in_flight(None).await)
    }

    /// Release in-flight tasks last updated before `cutoff` (all of them
    /// when `None`), oldest first, and wake waiting consumers.
    async fn release_in_flight(&self, cutoff: Option<DateTime<Utc>>) -> usize {
        let released = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let mut abandoned: Vec<&mut Task> = state
                .tasks
                .values_mut()
                .filter(|t| match cutoff {
                    Some(cutoff) => t.is_stale(cutoff),
                    None => t.status.is_in_flight(),
                })
                .collect();
            abandoned.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            let mut ids = Vec::with_capacity(abandoned.len());
            for task in abandoned {
                if task.release(now) {
                    ids.push(task.id.clone());
                }
            }
            let released = ids.len();
            state.pending.extend(ids);

            if released > 0 {
                self.persist(&state).await;
            }
            released
        };
        if released > 0 {
            self.notify.notify_waiters();
        }
        released
    }

    /// Best effort: a failed save is logged, the mutation stands.
    async fn persist(&self, state: &InMemoryState) {
        let bytes = match serde_json::to_vec(&state.to_snapshot()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialize queue snapshot");
                return;
            }
        };
        if let Err(e) = self.sink.save(&bytes).await {
            warn!(error = %e, "failed to save queue snapshot");
        }
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let task = task.into_pending(self.clock.now());
        {
            let mut state = self.state.lock().await;
            if state.tasks.contains_key(&task.id) {
                return Err(QueueError::Backend(format!("task {} already exists", task.id)));
            }
            info!(task_id = %task.id, owner_id = %task.owner_id, task_type = %task.task_type(), "enqueued task");
            state.pending.push_back(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
            self.persist(&state).await;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.dequeue_timeout;
        loop {
            // Register interest before looking, so an enqueue between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(task) = state.claim_next(self.clock.as_ref()) {
                    self.persist(&state).await;
                    debug!(task_id = %task.id, "claimed task");
                    return Ok(Some(task));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn update_status(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(task) = state.tasks.get_mut(id) else {
            return Ok(false);
        };
        let status = update.status;
        match task.apply_update(update, now) {
            Ok(()) => {
                debug!(task_id = %id, %status, progress = task.progress, "updated task status");
                self.persist(&state).await;
                Ok(true)
            }
            Err(rejected) => {
                debug!(task_id = %id, %status, reason = %rejected, "status update rejected");
                Ok(false)
            }
        }
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(id).cloned())
    }

    async fn get_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Task>, QueueError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| &t.owner_id == owner_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, QueueError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| QueueError::Config(format!("max_age out of range: {e}")))?;
        let cutoff = self.clock.now() - max_age;

        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.is_expired(cutoff));
        let removed = (before - state.tasks.len()) as u64;

        if removed > 0 {
            self.persist(&state).await;
        }
        info!(removed, "cleaned up old tasks");
        Ok(removed)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| QueueError::Config(format!("older_than out of range: {e}")))?;
        let cutoff = self.clock.now() - older_than;

        let requeued = self.release_in_flight(Some(cutoff)).await as u64;
        if requeued > 0 {
            warn!(requeued, "requeued stale in-flight tasks");
        }
        Ok(requeued)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            counts.record(task.status, 1);
        }
        Ok(counts)
    }
}
