//! Processor port: the document pipeline invoked by a worker.
//!
//! The worker knows nothing about what a processor does. It only needs one
//! attempt to return `Ok(())` or a classified [`ProcessError`].

use async_trait::async_trait;

use crate::domain::{ProcessError, Task};
use crate::worker::ProgressReporter;

/// # Example
/// ```ignore
/// struct Ocr;
///
/// #[async_trait]
/// impl Processor for Ocr {
///     async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
///         progress.report(20, "starting extraction").await;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run one attempt for `task`.
    async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError>;
}
