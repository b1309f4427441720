//! End-to-end runs of the worker pool against the in-memory queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docket_core::domain::{OwnerId, ProcessError, Task, TaskId, TaskPayload, TaskStatus, TaskUpdate};
use docket_core::ports::{Processor, TaskQueue};
use docket_core::queue::InMemoryTaskQueue;
use docket_core::resilience::{
    BreakerConfig, CircuitBreaker, CircuitState, RetryConfig, RetryPolicy,
};
use docket_core::worker::{ProgressReporter, WorkerConfig, WorkerDeps, WorkerManager, WorkerStats};
use rstest::rstest;

/// Counts attempts per task and fails the first `failures` of each.
struct Counting {
    failures: u32,
    attempts: Mutex<HashMap<TaskId, u32>>,
}

impl Counting {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts(&self) -> HashMap<TaskId, u32> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for Counting {
    async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(task.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        progress.report(50, "halfway").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        if attempt <= self.failures {
            Err(ProcessError::transient(format!("attempt {attempt} failed")))
        } else {
            Ok(())
        }
    }
}

fn queue() -> Arc<dyn TaskQueue> {
    Arc::new(InMemoryTaskQueue::new().with_dequeue_timeout(Duration::from_millis(50)))
}

fn deps(queue: &Arc<dyn TaskQueue>, processor: Arc<Counting>) -> WorkerDeps {
    WorkerDeps::new(Arc::clone(queue), processor)
        .with_retry_policy(RetryPolicy::new(RetryConfig::default().without_jitter()))
        .with_config(WorkerConfig {
            idle_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        })
}

fn document(n: usize, max_retries: u32) -> Task {
    Task::new(
        OwnerId::new(format!("doc-{n}")),
        TaskPayload::ocr(format!("{n}.pdf"), format!("/uploads/{n}.pdf")),
    )
    .with_max_retries(max_retries)
}

async fn run_to_drain(queue: &Arc<dyn TaskQueue>, workers: usize, processor: Arc<Counting>) -> WorkerStats {
    let pool = WorkerManager::start(workers, deps(queue, processor));
    while queue.counts().await.unwrap().in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await
}

#[rstest]
#[case(1, 1)]
#[case(10, 2)]
#[case(25, 4)]
#[case(3, 8)]
#[tokio::test(start_paused = true)]
async fn every_task_is_processed_exactly_once(#[case] tasks: usize, #[case] workers: usize) {
    let queue = queue();
    let processor = Arc::new(Counting::new(0));
    let mut ids = Vec::new();
    for n in 0..tasks {
        let task = document(n, 3);
        ids.push(task.id.clone());
        queue.enqueue(task).await.unwrap();
    }

    let stats = run_to_drain(&queue, workers, processor.clone()).await;
    assert_eq!(stats.claimed, tasks as u64);
    assert_eq!(stats.completed, tasks as u64);

    let attempts = processor.attempts();
    assert_eq!(attempts.len(), tasks);
    assert!(attempts.values().all(|n| *n == 1));

    for id in &ids {
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
    }
    assert_eq!(queue.counts().await.unwrap().completed, tasks as u64);
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_third_attempt() {
    let queue = queue();
    let task = document(1, 3);
    queue.enqueue(task.clone()).await.unwrap();

    let stats = run_to_drain(&queue, 1, Arc::new(Counting::new(2))).await;
    assert_eq!(stats.retries, 2);

    let stored = queue.get(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.retry_count, 2);
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test(start_paused = true)]
async fn never_succeeding_task_fails_at_its_retry_budget(#[case] max_retries: u32) {
    let queue = queue();
    let task = document(1, max_retries);
    queue.enqueue(task.clone()).await.unwrap();

    let processor = Arc::new(Counting::new(u32::MAX));
    run_to_drain(&queue, 2, processor.clone()).await;

    let stored = queue.get(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, max_retries);
    assert!(stored.error_message.as_deref().is_some_and(|m| !m.is_empty()));
    assert_eq!(processor.attempts()[&task.id], max_retries + 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_status_is_write_once() {
    let queue = queue();
    let task = document(1, 3);
    queue.enqueue(task.clone()).await.unwrap();
    queue.dequeue().await.unwrap().unwrap();

    assert!(queue.update_status(&task.id, TaskUpdate::completed()).await.unwrap());
    assert!(!queue.update_status(&task.id, TaskUpdate::failed("late")).await.unwrap());
    assert!(!queue.update_status(&task.id, TaskUpdate::processing(40)).await.unwrap());

    let stored = queue.get(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.progress, 100);
    assert!(stored.error_message.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeuers_share_one_task() {
    let queue = queue();
    let task = document(1, 3);
    queue.enqueue(task.clone()).await.unwrap();

    let claims: Vec<_> = (0..5)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await.unwrap() })
        })
        .collect();

    let mut winners = Vec::new();
    for claim in claims {
        if let Some(claimed) = claim.await.unwrap() {
            winners.push(claimed);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, task.id);
    assert_eq!(winners[0].status, TaskStatus::Processing);
}

#[tokio::test(start_paused = true)]
async fn breaker_guards_a_failing_dependency() {
    let breaker = CircuitBreaker::new(
        "ocr-service",
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        },
    );
    let counter = AtomicU32::new(0);
    let invoked = &counter;
    let failing = move || async move {
        invoked.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(ProcessError::transient("ocr service unavailable"))
    };

    for _ in 0..3 {
        assert!(!breaker.call(failing).await.unwrap_err().is_open());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let err: ProcessError = breaker.call(failing).await.unwrap_err().into();
    assert!(err.is_retryable());
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(61)).await;
    breaker
        .call(move || async move {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ProcessError>(())
        })
        .await
        .unwrap();
    assert_eq!(invoked.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_unclaimed_tasks_pending() {
    let queue = queue();
    let pool = WorkerManager::start(2, deps(&queue, Arc::new(Counting::new(0))));
    let stats = pool.shutdown().await;
    assert_eq!(stats, WorkerStats::default());

    let task = document(1, 3);
    queue.enqueue(task.clone()).await.unwrap();
    let stored = queue.get(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
}
