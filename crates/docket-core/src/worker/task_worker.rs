//! A single worker: claim, process, retry, report.

use std::any::Any;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::domain::{OwnerId, ProcessError, Task, TaskId, TaskStatus, TaskUpdate};
use crate::ports::{
    NoopNotifier, NoopStatusStore, Notifier, NotifyEvent, OwnerStatus, Processor, StatusStore,
    TaskQueue,
};
use crate::resilience::RetryPolicy;

use super::ProgressReporter;

/// Progress recorded as soon as a task is claimed.
pub const CLAIMED_PROGRESS: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Pause after a dequeue that found nothing.
    pub idle_interval: Duration,
    /// Pause after a queue error.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// What a worker (or a pool of them) got through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Attempts that failed and were retried.
    pub retries: u64,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.retries += other.retries;
    }
}

/// Everything a worker needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn TaskQueue>,
    pub processor: Arc<dyn Processor>,
    pub status_store: Arc<dyn StatusStore>,
    pub notifier: Arc<dyn Notifier>,
    pub retry: RetryPolicy,
    pub config: WorkerConfig,
}

impl WorkerDeps {
    pub fn new(queue: Arc<dyn TaskQueue>, processor: Arc<dyn Processor>) -> Self {
        Self {
            queue,
            processor,
            status_store: Arc::new(NoopStatusStore),
            notifier: Arc::new(NoopNotifier),
            retry: RetryPolicy::default(),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_status_store(mut self, status_store: Arc<dyn StatusStore>) -> Self {
        self.status_store = status_store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }
}

pub struct Worker {
    id: String,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(id: impl Into<String>, deps: WorkerDeps) -> Self {
        Self { id: id.into(), deps }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Loop until `token` is cancelled.
    ///
    /// The token is checked between tasks and while idle. A claimed task is
    /// always driven to a stored outcome first, including retry backoff.
    /// Dequeue itself is not interrupted; its timeout bounds how long
    /// shutdown waits on it.
    pub async fn run(self, token: CancellationToken) -> WorkerStats {
        info!(worker_id = %self.id, "worker started");
        let mut stats = WorkerStats::default();

        while !token.is_cancelled() {
            match self.deps.queue.dequeue().await {
                Ok(Some(task)) => {
                    let span = info_span!(
                        "task",
                        worker_id = %self.id,
                        task_id = %task.id,
                        owner_id = %task.owner_id,
                        task_type = %task.task_type(),
                    );
                    self.handle(task, &mut stats).instrument(span).await;
                }
                Ok(None) => {
                    if !pause(self.deps.config.idle_interval, &token).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "dequeue failed");
                    if !pause(self.deps.config.error_backoff, &token).await {
                        break;
                    }
                }
            }
        }

        info!(
            worker_id = %self.id,
            claimed = stats.claimed,
            completed = stats.completed,
            failed = stats.failed,
            retries = stats.retries,
            "worker stopped"
        );
        stats
    }

    /// Drive one claimed task to `completed` or `failed`.
    async fn handle(&self, mut task: Task, stats: &mut WorkerStats) {
        stats.claimed += 1;
        let started = tokio::time::Instant::now();
        info!("processing task");

        self.owner_status(&task.owner_id, OwnerStatus::Processing, Some(CLAIMED_PROGRESS), None)
            .await;
        self.write(&task.id, TaskUpdate::processing(CLAIMED_PROGRESS)).await;
        mirror(&mut task, TaskUpdate::processing(CLAIMED_PROGRESS));

        let reporter = ProgressReporter::new(
            &task,
            Arc::clone(&self.deps.queue),
            Arc::clone(&self.deps.status_store),
        );

        let mut attempt: u32 = 1;
        loop {
            let err = match self.attempt(&task, &reporter).await {
                Ok(()) => {
                    self.complete(&task, attempt, started.elapsed()).await;
                    stats.completed += 1;
                    return;
                }
                Err(err) => err,
            };

            if err.is_retryable() && task.can_retry() {
                warn!(attempt, retry_count = task.retry_count, error = %err, "attempt failed, will retry");
                self.write(&task.id, TaskUpdate::retrying()).await;
                mirror(&mut task, TaskUpdate::retrying());
                self.owner_status(&task.owner_id, OwnerStatus::Retrying, Some(0), Some(err.message()))
                    .await;
                stats.retries += 1;

                let delay = self.deps.retry.calculate_delay(task.retry_count);
                debug!(delay_ms = delay.as_millis() as u64, "backing off");
                tokio::time::sleep(delay).await;

                self.write(&task.id, TaskUpdate::new(TaskStatus::Processing)).await;
                mirror(&mut task, TaskUpdate::new(TaskStatus::Processing));
                self.owner_status(&task.owner_id, OwnerStatus::Processing, Some(0), None)
                    .await;
                attempt += 1;
                continue;
            }

            self.fail(&task, attempt, &err).await;
            stats.failed += 1;
            return;
        }
    }

    /// One processor run on its own task, so a panic fails the attempt
    /// instead of the worker.
    async fn attempt(&self, task: &Task, reporter: &ProgressReporter) -> Result<(), ProcessError> {
        let processor = Arc::clone(&self.deps.processor);
        let task = task.clone();
        let reporter = reporter.clone();
        let run = tokio::spawn(
            async move { processor.process(&task, &reporter).await }.in_current_span(),
        );

        match run.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(panic = %message, "processor panicked");
                Err(ProcessError::permanent(format!("processor panicked: {message}")))
            }
            Err(e) => Err(ProcessError::transient(format!("processor was cancelled: {e}"))),
        }
    }

    async fn complete(&self, task: &Task, attempts: u32, elapsed: Duration) {
        if !self.write(&task.id, TaskUpdate::completed()).await {
            warn!("completion was not recorded");
        }
        self.owner_status(&task.owner_id, OwnerStatus::Completed, Some(100), None)
            .await;
        self.notify(
            &task.owner_id,
            NotifyEvent::Completed,
            json!({
                "status": "completed",
                "task_id": task.id.as_str(),
                "task_type": task.task_type().as_str(),
                "attempts": attempts,
                "processing_time_secs": elapsed.as_secs_f64(),
                "completed_at": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        info!(attempts, elapsed_ms = elapsed.as_millis() as u64, "task completed");
    }

    async fn fail(&self, task: &Task, attempts: u32, err: &ProcessError) {
        let message = format!("failed after {attempts} attempts: {err}");
        error!(attempts, retry_count = task.retry_count, kind = ?err.kind(), error = %err, "task failed");

        if !self.write(&task.id, TaskUpdate::failed(message.clone())).await {
            warn!("failure was not recorded");
        }
        self.owner_status(&task.owner_id, OwnerStatus::Failed, None, Some(&message))
            .await;
        self.notify(
            &task.owner_id,
            NotifyEvent::Failed,
            json!({
                "status": "failed",
                "task_id": task.id.as_str(),
                "task_type": task.task_type().as_str(),
                "attempts": attempts,
                "error_message": message,
                "failed_at": Utc::now().to_rfc3339(),
            }),
        )
        .await;
    }

    /// Queue write. Errors are logged; the task keeps its last stored state.
    async fn write(&self, id: &TaskId, update: TaskUpdate) -> bool {
        let status = update.status;
        match self.deps.queue.update_status(id, update).await {
            Ok(applied) => {
                if !applied {
                    debug!(%status, "status update not applied");
                }
                applied
            }
            Err(e) => {
                error!(%status, error = %e, "failed to write task status");
                false
            }
        }
    }

    async fn owner_status(
        &self,
        owner_id: &OwnerId,
        status: OwnerStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .deps
            .status_store
            .set_owner_progress(owner_id, status, progress, error)
            .await
        {
            warn!(%status, error = %e, "failed to update owner status");
        }
    }

    async fn notify(&self, owner_id: &OwnerId, event: NotifyEvent, payload: serde_json::Value) {
        if let Err(e) = self.deps.notifier.notify(owner_id, event, payload).await {
            warn!(%event, error = %e, "failed to send notification");
        }
    }
}

/// Apply to the worker's own copy what was just written to the queue. The
/// copy advances even if the write failed, so the retry budget still bounds
/// the attempts.
fn mirror(task: &mut Task, update: TaskUpdate) {
    let status = update.status;
    if let Err(rejected) = task.apply_update(update, Utc::now()) {
        debug!(%status, reason = %rejected, "local task copy not updated");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Sleep for `duration` unless cancelled first. False if cancelled.
async fn pause(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::domain::{TaskPayload, TaskStatus};
    use crate::ports::{NotifyError, StatusStoreError};
    use crate::queue::InMemoryTaskQueue;
    use crate::resilience::RetryConfig;

    /// Plays back scripted outcomes, then succeeds.
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<(), ProcessError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: impl IntoIterator<Item = Result<(), ProcessError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Processor for Scripted {
        async fn process(&self, _task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress.report(50, "halfway").await;
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        owner: Mutex<Vec<(OwnerStatus, Option<u8>)>>,
        events: Mutex<Vec<(NotifyEvent, serde_json::Value)>>,
    }

    #[async_trait]
    impl StatusStore for Recorder {
        async fn set_owner_progress(
            &self,
            _owner_id: &OwnerId,
            status: OwnerStatus,
            progress: Option<u8>,
            _error: Option<&str>,
        ) -> Result<(), StatusStoreError> {
            self.owner.lock().unwrap().push((status, progress));
            Ok(())
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(
            &self,
            _owner_id: &OwnerId,
            event: NotifyEvent,
            payload: serde_json::Value,
        ) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push((event, payload));
            Err(NotifyError("webhook endpoint down".into()))
        }
    }

    struct Harness {
        queue: Arc<dyn TaskQueue>,
        recorder: Arc<Recorder>,
        processor: Arc<Scripted>,
    }

    impl Harness {
        fn new(processor: Scripted) -> Self {
            Self {
                queue: Arc::new(InMemoryTaskQueue::new().with_dequeue_timeout(Duration::from_millis(20))),
                recorder: Arc::new(Recorder::default()),
                processor: Arc::new(processor),
            }
        }

        fn deps(&self) -> WorkerDeps {
            WorkerDeps::new(Arc::clone(&self.queue), self.processor.clone())
                .with_status_store(self.recorder.clone())
                .with_notifier(self.recorder.clone())
                .with_retry_policy(RetryPolicy::new(RetryConfig::default().without_jitter()))
                .with_config(WorkerConfig {
                    idle_interval: Duration::from_millis(10),
                    error_backoff: Duration::from_millis(10),
                })
        }

        /// Run one worker until nothing is in flight.
        async fn drain(&self) -> WorkerStats {
            self.drain_with(self.deps()).await
        }

        async fn drain_with(&self, deps: WorkerDeps) -> WorkerStats {
            let token = CancellationToken::new();
            let worker = tokio::spawn(Worker::new("worker-1", deps).run(token.clone()));
            while self.queue.counts().await.unwrap().in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            token.cancel();
            worker.await.unwrap()
        }
    }

    fn task(max_retries: u32) -> Task {
        Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf")).with_max_retries(max_retries)
    }

    #[tokio::test(start_paused = true)]
    async fn success_completes_and_notifies() {
        let h = Harness::new(Scripted::default());
        let t = task(3);
        h.queue.enqueue(t.clone()).await.unwrap();

        let stats = h.drain().await;
        assert_eq!(stats, WorkerStats { claimed: 1, completed: 1, failed: 0, retries: 0 });

        let stored = h.queue.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert!(stored.started_at.is_some() && stored.completed_at.is_some());

        let owner = h.recorder.owner.lock().unwrap().clone();
        assert_eq!(owner.first(), Some(&(OwnerStatus::Processing, Some(CLAIMED_PROGRESS))));
        assert_eq!(owner.last(), Some(&(OwnerStatus::Completed, Some(100))));

        // A failing notifier does not affect the outcome.
        let events = h.recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, NotifyEvent::Completed);
        assert_eq!(events[0].1["attempts"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_complete() {
        let h = Harness::new(Scripted::new([
            Err(ProcessError::transient("ocr timeout")),
            Err(ProcessError::transient("ocr timeout")),
        ]));
        let t = task(3);
        h.queue.enqueue(t.clone()).await.unwrap();

        let stats = h.drain().await;
        assert_eq!((stats.completed, stats.retries), (1, 2));
        assert_eq!(h.processor.calls.load(Ordering::SeqCst), 3);

        let stored = h.queue.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 2);
        assert!(stored.error_message.is_none());

        let owner = h.recorder.owner.lock().unwrap();
        assert_eq!(owner.iter().filter(|(s, _)| *s == OwnerStatus::Retrying).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_fails_with_message() {
        let h = Harness::new(Scripted::new((0..10).map(|_| Err(ProcessError::transient("ocr down")))));
        let t = task(2);
        h.queue.enqueue(t.clone()).await.unwrap();

        let stats = h.drain().await;
        assert_eq!(stats, WorkerStats { claimed: 1, completed: 0, failed: 1, retries: 2 });
        assert_eq!(h.processor.calls.load(Ordering::SeqCst), 3);

        let stored = h.queue.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);
        assert_eq!(stored.error_message.as_deref(), Some("failed after 3 attempts: ocr down"));
        assert!(stored.progress < 100);

        let events = h.recorder.events.lock().unwrap();
        assert_eq!(events.last().map(|(e, _)| *e), Some(NotifyEvent::Failed));
    }

    /// Panics on the task for `poisoned.pdf`, succeeds otherwise.
    struct PanicsOnPoison;

    #[async_trait]
    impl Processor for PanicsOnPoison {
        async fn process(&self, task: &Task, _progress: &ProgressReporter) -> Result<(), ProcessError> {
            if let TaskPayload::OcrProcessing { filename, .. } = &task.payload {
                if filename == "poisoned.pdf" {
                    panic!("corrupt page table in {filename}");
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn processor_panic_fails_the_task_and_the_worker_carries_on() {
        let h = Harness::new(Scripted::default());
        let poisoned = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("poisoned.pdf", "/tmp/poisoned.pdf"))
            .with_max_retries(3);
        let healthy = task(3);
        h.queue.enqueue(poisoned.clone()).await.unwrap();
        h.queue.enqueue(healthy.clone()).await.unwrap();

        let mut deps = h.deps();
        deps.processor = Arc::new(PanicsOnPoison);
        let stats = h.drain_with(deps).await;
        assert_eq!(stats, WorkerStats { claimed: 2, completed: 1, failed: 1, retries: 0 });

        let stored = h.queue.get(&poisoned.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        let message = stored.error_message.unwrap();
        assert!(message.contains("processor panicked"), "{message}");
        assert!(message.contains("corrupt page table in poisoned.pdf"), "{message}");

        assert_eq!(
            h.queue.get(&healthy.id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        let owner = h.recorder.owner.lock().unwrap();
        assert!(owner.contains(&(OwnerStatus::Failed, None)));
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("static str")), "static str");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42_u32)), "non-string panic payload");
    }

    #[test]
    fn mirror_leaves_a_rejected_copy_untouched() {
        let mut finished = task(3);
        assert!(finished.claim(Utc::now()));
        finished.apply_update(TaskUpdate::completed(), Utc::now()).unwrap();
        let before = finished.clone();

        mirror(&mut finished, TaskUpdate::retrying());
        assert_eq!(finished, before);

        let mut claimed = task(3);
        assert!(claimed.claim(Utc::now()));
        mirror(&mut claimed, TaskUpdate::retrying());
        assert_eq!((claimed.status, claimed.retry_count), (TaskStatus::Retrying, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_fails_without_retry() {
        let h = Harness::new(Scripted::new([Err(ProcessError::permanent("file missing"))]));
        let t = task(3);
        h.queue.enqueue(t.clone()).await.unwrap();

        let stats = h.drain().await;
        assert_eq!((stats.failed, stats.retries), (1, 0));

        let stored = h.queue.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_budget_fails_on_first_error() {
        let h = Harness::new(Scripted::new([Err(ProcessError::transient("blip"))]));
        let t = task(0);
        h.queue.enqueue(t.clone()).await.unwrap();

        h.drain().await;
        let stored = h.queue.get(&t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("failed after 1 attempts: blip"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_stops_on_cancel() {
        let h = Harness::new(Scripted::default());
        let token = CancellationToken::new();
        let worker = tokio::spawn(Worker::new("worker-1", h.deps()).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
        assert_eq!(stats, WorkerStats::default());
    }

    #[test]
    fn stats_add_up() {
        let mut total = WorkerStats { claimed: 1, completed: 1, failed: 0, retries: 2 };
        total += WorkerStats { claimed: 2, completed: 1, failed: 1, retries: 0 };
        assert_eq!(total, WorkerStats { claimed: 3, completed: 2, failed: 1, retries: 2 });
    }
}
