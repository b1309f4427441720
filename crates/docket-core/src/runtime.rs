use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ProcessError, Task, TaskKind};
use crate::error::DocketError;
use crate::ports::Processor;
use crate::worker::ProgressReporter;

/// Registry of processors (task kind -> processor).
///
/// Built during initialization (mutable), then shared immutably by the
/// worker pool. The registry is itself a [`Processor`] that dispatches on
/// the task's kind.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<TaskKind, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        kind: TaskKind,
        processor: Arc<dyn Processor>,
    ) -> Result<(), DocketError> {
        if self.processors.contains_key(&kind) {
            return Err(DocketError::DuplicateProcessor(kind));
        }
        self.processors.insert(kind, processor);
        Ok(())
    }

    pub fn get(&self, kind: TaskKind) -> Option<&Arc<dyn Processor>> {
        self.processors.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[async_trait]
impl Processor for ProcessorRegistry {
    async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
        let kind = task.task_type();
        let processor = self
            .get(kind)
            .ok_or_else(|| ProcessError::permanent(format!("no processor registered for task_type={kind}")))?;

        processor.process(task, progress).await
    }
}
