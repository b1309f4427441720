//! docket-core
//!
//! Durable task queue and worker pool for long-running document jobs.
//!
//! # Modules
//! - **domain**: tasks, payloads, the status lifecycle, processing errors
//! - **ports**: seams to the outside (TaskQueue, Processor, StatusStore, Notifier, SnapshotSink, Clock)
//! - **queue**: in-memory, redis and postgres backends plus `TaskQueueManager`
//! - **resilience**: retry policy, circuit breaker, timeouts
//! - **worker**: `Worker`, `WorkerManager`, progress reporting, periodic cleanup
//! - **runtime**: `ProcessorRegistry`, routing tasks to processors by kind
//! - **config** / **observability**: environment configuration, logging, queue counts

pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod resilience;
pub mod runtime;
pub mod worker;

pub use config::{ConfigError, DocketConfig};
pub use error::DocketError;
