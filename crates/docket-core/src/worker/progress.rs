//! Progress reporting from inside a processor.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{OwnerId, Task, TaskId, TaskUpdate};
use crate::ports::{OwnerStatus, StatusStore, TaskQueue};

/// Handed to a [`Processor`](crate::ports::Processor) for the task it is
/// working on. Writes go to the queue and the owner's status record;
/// failures are logged and never surface to the processor.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    owner_id: OwnerId,
    queue: Arc<dyn TaskQueue>,
    status_store: Arc<dyn StatusStore>,
}

impl ProgressReporter {
    pub fn new(task: &Task, queue: Arc<dyn TaskQueue>, status_store: Arc<dyn StatusStore>) -> Self {
        Self {
            task_id: task.id.clone(),
            owner_id: task.owner_id.clone(),
            queue,
            status_store,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Record `progress` (clamped to 99; completion sets 100).
    pub async fn report(&self, progress: u8, message: &str) {
        let progress = progress.min(99);

        match self
            .queue
            .update_status(&self.task_id, TaskUpdate::processing(progress))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %self.task_id, progress, "progress update ignored"),
            Err(e) => warn!(task_id = %self.task_id, error = %e, "failed to record progress"),
        }

        if let Err(e) = self
            .status_store
            .set_owner_progress(&self.owner_id, OwnerStatus::Processing, Some(progress), None)
            .await
        {
            warn!(owner_id = %self.owner_id, error = %e, "failed to update owner progress");
        }

        info!(task_id = %self.task_id, progress, note = message, "progress");
    }
}
