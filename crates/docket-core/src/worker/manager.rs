//! Worker pool handle.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Worker, WorkerDeps, WorkerStats};

/// N workers sharing one queue.
///
/// - `cancellation_token().cancel()` (or `shutdown()`) stops every worker
///   once its current task has a stored outcome
/// - `wait()` / `shutdown()` join all workers and sum their stats
pub struct WorkerManager {
    token: CancellationToken,
    workers: Vec<(String, JoinHandle<WorkerStats>)>,
}

impl WorkerManager {
    /// Spawn `n` workers named `worker-1` .. `worker-n`.
    pub fn start(n: usize, deps: WorkerDeps) -> Self {
        Self::start_with_token(n, deps, CancellationToken::new())
    }

    /// Like [`Self::start`], stopping when `parent` is cancelled as well.
    pub fn start_with_token(n: usize, deps: WorkerDeps, parent: CancellationToken) -> Self {
        let token = parent.child_token();

        let mut workers = Vec::with_capacity(n);
        for i in 1..=n {
            let id = format!("worker-{i}");
            let worker = Worker::new(id.clone(), deps.clone());
            let join = tokio::spawn(worker.run(token.child_token()));
            workers.push((id, join));
        }

        info!(workers = n, "worker pool started");
        Self { token, workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown without waiting.
    pub fn request_shutdown(&self) {
        self.token.cancel();
    }

    /// Request shutdown and wait for all workers.
    pub async fn shutdown(self) -> WorkerStats {
        self.request_shutdown();
        self.wait().await
    }

    /// Wait for all workers to exit on their own (i.e. after cancellation).
    pub async fn wait(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for (id, join) in self.workers {
            match join.await {
                Ok(stats) => total += stats,
                Err(e) => error!(worker_id = %id, error = %e, "worker task ended abnormally"),
            }
        }
        info!(
            claimed = total.claimed,
            completed = total.completed,
            failed = total.failed,
            retries = total.retries,
            "worker pool stopped"
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::domain::{OwnerId, ProcessError, Task, TaskPayload, TaskStatus};
    use crate::ports::{Processor, TaskQueue};
    use crate::queue::InMemoryTaskQueue;
    use crate::worker::{ProgressReporter, WorkerConfig};

    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        async fn process(&self, _task: &Task, _progress: &ProgressReporter) -> Result<(), ProcessError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    fn deps(queue: Arc<dyn TaskQueue>) -> WorkerDeps {
        WorkerDeps::new(queue, Arc::new(Slow)).with_config(WorkerConfig {
            idle_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_tasks_finish() {
        let queue: Arc<dyn TaskQueue> =
            Arc::new(InMemoryTaskQueue::new().with_dequeue_timeout(Duration::from_millis(20)));
        let task = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf"));
        queue.enqueue(task.clone()).await.unwrap();

        let pool = WorkerManager::start(2, deps(Arc::clone(&queue)));
        assert_eq!(pool.len(), 2);

        // Wait until someone holds the task, then stop the pool mid-task.
        while queue.get(&task.id).await.unwrap().unwrap().status == TaskStatus::Pending {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let stats = pool.shutdown().await;

        assert_eq!((stats.claimed, stats.completed), (1, 1));
        assert_eq!(queue.get(&task.id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_token_stops_the_pool() {
        let queue: Arc<dyn TaskQueue> =
            Arc::new(InMemoryTaskQueue::new().with_dequeue_timeout(Duration::from_millis(20)));
        let parent = CancellationToken::new();
        let pool = WorkerManager::start_with_token(3, deps(queue), parent.clone());

        parent.cancel();
        assert!(pool.cancellation_token().is_cancelled());
        let stats = tokio::time::timeout(Duration::from_secs(1), pool.wait()).await.unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
