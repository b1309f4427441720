//! Workers: the loop that turns queued tasks into outcomes.

pub mod cleanup;
mod manager;
mod progress;
mod task_worker;

pub use cleanup::{CleanupSchedule, spawn_cleanup_loop};
pub use manager::WorkerManager;
pub use progress::ProgressReporter;
pub use task_worker::{CLAIMED_PROGRESS, Worker, WorkerConfig, WorkerDeps, WorkerStats};
