//! Queue backends and the manager that picks one.
//!
//! All backends implement [`TaskQueue`](crate::ports::TaskQueue) and route
//! every status change through [`Task`](crate::domain::Task), so they differ
//! only in storage and claim mechanics:
//!
//! - memory: mutex-guarded claim, snapshot after every mutation
//! - redis: BRPOP hands each id to one consumer (feature `redis`)
//! - postgres: `FOR UPDATE SKIP LOCKED` claim transaction

use std::time::Duration;

mod manager;
mod memory;
mod postgres;
#[cfg(feature = "redis")]
mod redis;

pub use manager::{QueueBackend, QueueConfig, TaskQueueManager};
pub use memory::InMemoryTaskQueue;
pub use postgres::{DEFAULT_POLL_INTERVAL, PostgresTaskQueue};
#[cfg(feature = "redis")]
pub use self::redis::{RedisKeys, RedisTaskQueue};

/// How long `dequeue` waits for work before returning `None`.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Key prefix of the redis backend.
pub const DEFAULT_REDIS_PREFIX: &str = "docket";
