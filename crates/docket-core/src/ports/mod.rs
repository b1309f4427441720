//! Ports: the seams between the queue/worker core and everything else.
//!
//! - `TaskQueue`: storage and claim semantics (implemented in `queue`)
//! - `Processor`: the document pipeline a worker invokes
//! - `StatusStore` / `Notifier`: external record and webhook collaborators
//! - `SnapshotSink`: persistence target of the in-memory backend
//! - `Clock`: wall-clock time, swappable in tests

pub mod clock;
pub mod notifier;
pub mod processor;
pub mod snapshot;
pub mod status_store;
pub mod task_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::notifier::{LoggingNotifier, NoopNotifier, Notifier, NotifyError, NotifyEvent};
pub use self::processor::Processor;
pub use self::snapshot::{FileSnapshotSink, NoopSnapshotSink, SnapshotSink};
pub use self::status_store::{
    LoggingStatusStore, NoopStatusStore, OwnerStatus, StatusStore, StatusStoreError,
};
pub use self::task_queue::{QueueError, TaskQueue};
