//! Redis-backed task queue (feature `redis`).
//!
//! ## Keys
//!
//! - `{prefix}:tasks`: hash, task id -> task JSON
//! - `{prefix}:queue`: list of pending ids; LPUSH on enqueue, BRPOP on
//!   dequeue, so the oldest id leaves first
//! - `{prefix}:owner:{owner_id}`: set of task ids per owner
//!
//! BRPOP hands each id to exactly one consumer. The popped task is then
//! claimed through [`Task::claim`]; ids whose task is gone, undecodable or
//! no longer pending are skipped. If the claim cannot be read or written
//! the id goes back to the tail BRPOP reads from.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{OwnerId, Task, TaskId, TaskUpdate};
use crate::observability::QueueCounts;
use crate::ports::{Clock, QueueError, SystemClock, TaskQueue};

use super::{DEFAULT_DEQUEUE_TIMEOUT, DEFAULT_REDIS_PREFIX};

/// A BRPOP timeout of 0 would block forever.
const MIN_BLOCK_SECS: f64 = 0.01;

/// Key layout under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn tasks(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn owner(&self, owner_id: &OwnerId) -> String {
        format!("{}:owner:{}", self.prefix, owner_id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_PREFIX)
    }
}

/// Connections for BRPOP. A blocked connection serves nobody else, so each
/// concurrent dequeue holds one; idle ones are kept for the next call.
struct BlockingConnections {
    client: redis::Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl BlockingConnections {
    fn new(client: redis::Client) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn take(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| map_redis_error("connect", e)),
        }
    }

    /// Return a connection after a clean round trip. Connections that saw
    /// an error are dropped instead.
    fn put_back(&self, conn: MultiplexedConnection) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(conn);
    }
}

#[derive(Clone)]
pub struct RedisTaskQueue {
    blocking: Arc<BlockingConnections>,
    conn: ConnectionManager,
    keys: RedisKeys,
    clock: Arc<dyn Clock>,
    dequeue_timeout: Duration,
}

impl RedisTaskQueue {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(|e| map_redis_error("open", e))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        Ok(Self {
            blocking: Arc::new(BlockingConnections::new(client)),
            conn,
            keys: RedisKeys::new(prefix),
            clock: Arc::new(SystemClock),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Claim the task behind a popped id. `Ok(None)` means the id is dropped
    /// from the queue; an error means it must be pushed back.
    async fn claim_popped(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .hget(self.keys.tasks(), id)
            .await
            .map_err(|e| map_redis_error("hget", e))?;
        let Some(json) = json else {
            warn!(task_id = %id, "popped id has no stored task; skipping");
            return Ok(None);
        };
        let mut task = match decode(&json) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = %id, error = %e, "stored task does not decode; dropping it from the queue");
                return Ok(None);
            }
        };
        if !task.claim(self.clock.now()) {
            debug!(task_id = %id, status = %task.status, "popped task is not pending; skipping");
            return Ok(None);
        }
        self.store(&task).await?;
        Ok(Some(task))
    }

    /// Return `id` to the end BRPOP pops from, so it is the next one served.
    async fn push_back(&self, id: &str) {
        let mut conn = self.conn.clone();
        let pushed: Result<(), RedisError> = conn.rpush(self.keys.queue(), id).await;
        match pushed {
            Ok(()) => warn!(task_id = %id, "claim failed; id returned to the queue"),
            Err(e) => error!(
                task_id = %id,
                error = %e,
                "claim failed and the id could not be returned to the queue"
            ),
        }
    }

    async fn load(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .hget(self.keys.tasks(), id)
            .await
            .map_err(|e| map_redis_error("hget", e))?;
        json.map(|json| decode(&json)).transpose()
    }

    async fn store(&self, task: &Task) -> Result<(), QueueError> {
        let json = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(self.keys.tasks(), task.id.as_str(), json)
            .await
            .map_err(|e| map_redis_error("hset", e))?;
        Ok(())
    }

    async fn all_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn
            .hvals(self.keys.tasks())
            .await
            .map_err(|e| map_redis_error("hvals", e))?;
        values.iter().map(|json| decode(json)).collect()
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    #[instrument(skip(self, task), fields(task_id = %task.id, owner_id = %task.owner_id), err)]
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let task = task.into_pending(self.clock.now());
        let json = serde_json::to_string(&task)?;
        let mut conn = self.conn.clone();

        let inserted: bool = conn
            .hset_nx(self.keys.tasks(), task.id.as_str(), json)
            .await
            .map_err(|e| map_redis_error("hsetnx", e))?;
        if !inserted {
            return Err(QueueError::Backend(format!("task {} already exists", task.id)));
        }

        let _: () = redis::pipe()
            .atomic()
            .sadd(self.keys.owner(&task.owner_id), task.id.as_str())
            .ignore()
            .lpush(self.keys.queue(), task.id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("enqueue", e))?;

        info!(task_type = %task.task_type(), "enqueued task");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        let mut blocking = self.blocking.take().await?;

        let deadline = tokio::time::Instant::now() + self.dequeue_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.blocking.put_back(blocking);
                return Ok(None);
            }

            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(self.keys.queue())
                .arg(remaining.as_secs_f64().max(MIN_BLOCK_SECS))
                .query_async(&mut blocking)
                .await
                .map_err(|e| map_redis_error("brpop", e))?;

            let Some((_, id)) = popped else {
                self.blocking.put_back(blocking);
                return Ok(None);
            };

            match self.claim_popped(&id).await {
                Ok(Some(task)) => {
                    self.blocking.put_back(blocking);
                    debug!(task_id = %task.id, "claimed task");
                    return Ok(Some(task));
                }
                Ok(None) => continue,
                Err(e) => {
                    self.blocking.put_back(blocking);
                    self.push_back(&id).await;
                    return Err(e);
                }
            }
        }
    }

    #[instrument(skip(self, update), fields(task_id = %id, status = %update.status), err)]
    async fn update_status(&self, id: &TaskId, update: TaskUpdate) -> Result<bool, QueueError> {
        let Some(mut task) = self.load(id.as_str()).await? else {
            return Ok(false);
        };
        if let Err(rejected) = task.apply_update(update, self.clock.now()) {
            debug!(reason = %rejected, "status update rejected");
            return Ok(false);
        }
        self.store(&task).await?;
        Ok(true)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, QueueError> {
        self.load(id.as_str()).await
    }

    async fn get_by_owner(&self, owner_id: &OwnerId) -> Result<Vec<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.keys.owner(owner_id))
            .await
            .map_err(|e| map_redis_error("smembers", e))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.tasks())
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("hmget", e))?;

        let mut tasks = values
            .iter()
            .flatten()
            .map(|json| decode(json))
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    #[instrument(skip(self), err)]
    async fn cleanup_old(&self, max_age: Duration) -> Result<u64, QueueError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| QueueError::Config(format!("max_age out of range: {e}")))?;
        let cutoff = self.clock.now() - max_age;

        let expired: Vec<Task> = self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| t.is_expired(cutoff))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for task in &expired {
            pipe.hdel(self.keys.tasks(), task.id.as_str()).ignore();
            pipe.srem(self.keys.owner(&task.owner_id), task.id.as_str()).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("cleanup_old", e))?;

        let removed = expired.len() as u64;
        info!(removed, "cleaned up old tasks");
        Ok(removed)
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| QueueError::Config(format!("older_than out of range: {e}")))?;
        let now = self.clock.now();
        let cutoff = now - older_than;

        let mut stale: Vec<Task> = self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| t.is_stale(cutoff))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut pipe = redis::pipe();
        pipe.atomic();
        for task in &mut stale {
            task.release(now);
            pipe.hset(self.keys.tasks(), task.id.as_str(), serde_json::to_string(&*task)?)
                .ignore();
            pipe.lpush(self.keys.queue(), task.id.as_str()).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("requeue_stale", e))?;

        let requeued = stale.len() as u64;
        warn!(requeued, "requeued stale in-flight tasks");
        Ok(requeued)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut counts = QueueCounts::default();
        for task in self.all_tasks().await? {
            counts.record(task.status, 1);
        }
        Ok(counts)
    }
}

fn decode(json: &str) -> Result<Task, QueueError> {
    Ok(serde_json::from_str(json)?)
}

fn map_redis_error(operation: &str, err: RedisError) -> QueueError {
    warn!(operation, error = %err, "redis operation failed");
    match err.kind() {
        redis::ErrorKind::TypeError => {
            QueueError::Serialization(format!("redis type error in {operation}: {err}"))
        }
        redis::ErrorKind::InvalidClientConfig => {
            QueueError::Config(format!("invalid redis url: {err}"))
        }
        _ => QueueError::Backend(format!("redis error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskPayload, TaskStatus};

    #[test]
    fn keys_are_namespaced_by_prefix() {
        let keys = RedisKeys::new("docs");
        assert_eq!(keys.tasks(), "docs:tasks");
        assert_eq!(keys.queue(), "docs:queue");
        assert_eq!(keys.owner(&OwnerId::new("doc-42")), "docs:owner:doc-42");
        assert_eq!(RedisKeys::default().queue(), "docket:queue");
    }

    #[test]
    fn stored_json_decodes_to_task() {
        let task = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf"));
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(decode(&json).unwrap(), task);
        assert!(matches!(decode("{}"), Err(QueueError::Serialization(_))));
    }

    async fn live_queue(prefix: &str) -> RedisTaskQueue {
        let url = std::env::var("DOCKET_TEST_REDIS_URL").expect("DOCKET_TEST_REDIS_URL must be set");
        let queue = RedisTaskQueue::connect(&url, prefix)
            .await
            .unwrap()
            .with_dequeue_timeout(Duration::from_millis(200));
        let mut conn = queue.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(queue.keys.tasks())
            .arg(queue.keys.queue())
            .query_async(&mut conn)
            .await
            .unwrap();
        queue
    }

    #[tokio::test]
    #[ignore = "requires DOCKET_TEST_REDIS_URL"]
    async fn live_blocking_connections_are_reused() {
        let queue = live_queue("docket-test-reuse").await;
        for _ in 0..3 {
            assert!(queue.dequeue().await.unwrap().is_none());
        }
        assert_eq!(queue.blocking.idle.lock().unwrap().len(), 1);

        let (a, b) = tokio::join!(queue.dequeue(), queue.dequeue());
        assert!(a.unwrap().is_none() && b.unwrap().is_none());
        assert_eq!(queue.blocking.idle.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    #[ignore = "requires DOCKET_TEST_REDIS_URL"]
    async fn live_failed_claim_keeps_the_id_queued() {
        let queue = live_queue("docket-test-keep").await;
        let mut conn = queue.conn.clone();
        // A tasks key of the wrong type makes every HGET fail.
        let _: () = conn.set(queue.keys.tasks(), "not a hash").await.unwrap();
        let _: () = conn.lpush(queue.keys.queue(), "01J0000000000000000000TASK").await.unwrap();

        assert!(matches!(queue.dequeue().await, Err(QueueError::Backend(_))));
        let queued: Vec<String> = conn.lrange(queue.keys.queue(), 0, -1).await.unwrap();
        assert_eq!(queued, vec!["01J0000000000000000000TASK".to_string()]);
    }

    #[tokio::test]
    #[ignore = "requires DOCKET_TEST_REDIS_URL"]
    async fn live_undecodable_task_is_skipped() {
        let queue = live_queue("docket-test-undecodable").await;
        let mut conn = queue.conn.clone();
        let _: () = conn.hset(queue.keys.tasks(), "broken", "{").await.unwrap();
        let _: () = conn.lpush(queue.keys.queue(), "broken").await.unwrap();
        let good = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf"));
        queue.enqueue(good.clone()).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, good.id);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires DOCKET_TEST_REDIS_URL"]
    async fn live_requeue_stale_releases_abandoned_claims() {
        let clock = Arc::new(crate::ports::FixedClock::new(chrono::Utc::now()));
        let queue = live_queue("docket-test-stale").await.with_clock(clock.clone());
        let abandoned = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf"));
        queue.enqueue(abandoned.clone()).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();
        queue.update_status(&abandoned.id, TaskUpdate::processing(40)).await.unwrap();

        assert_eq!(queue.requeue_stale(Duration::from_secs(600)).await.unwrap(), 0);
        clock.advance(chrono::Duration::minutes(15));
        assert_eq!(queue.requeue_stale(Duration::from_secs(600)).await.unwrap(), 1);

        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!((again.id, again.progress), (abandoned.id, 0));
    }

    #[tokio::test]
    #[ignore = "requires DOCKET_TEST_REDIS_URL"]
    async fn live_fifo_and_exclusive_claim() {
        let queue = live_queue("docket-test-fifo").await;
        let first = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("a.pdf", "/tmp/a.pdf"));
        let second = Task::new(OwnerId::new("doc-1"), TaskPayload::ocr("b.pdf", "/tmp/b.pdf"));
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let a = queue.dequeue().await.unwrap().unwrap();
        let b = queue.dequeue().await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first.id.clone(), second.id));
        assert!(queue.dequeue().await.unwrap().is_none());

        assert!(queue.update_status(&first.id, TaskUpdate::completed()).await.unwrap());
        assert!(!queue.update_status(&first.id, TaskUpdate::failed("late")).await.unwrap());
        assert_eq!(queue.get(&first.id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }
}
