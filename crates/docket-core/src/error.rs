use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::TaskKind;
use crate::ports::QueueError;

#[derive(Debug, Error)]
pub enum DocketError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("duplicate processor for task_type={0}")]
    DuplicateProcessor(TaskKind),
}
