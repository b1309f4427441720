//! Domain model: ids, payloads, tasks and their lifecycle.

pub mod errors;
pub mod ids;
pub mod payload;
pub mod status;
pub mod task;

pub use errors::{ErrorKind, ProcessError};
pub use ids::{OwnerId, TaskId};
pub use payload::{TaskKind, TaskPayload};
pub use status::TaskStatus;
pub use task::{DEFAULT_MAX_RETRIES, Task, TaskUpdate, UpdateRejected};
