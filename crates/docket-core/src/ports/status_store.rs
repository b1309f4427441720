//! StatusStore port: the durable per-document record external consumers poll.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::OwnerId;

/// Document-level status mirrored from task transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerStatus {
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl fmt::Display for OwnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OwnerStatus::Processing => "processing",
            OwnerStatus::Retrying => "retrying",
            OwnerStatus::Completed => "completed",
            OwnerStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("status store error: {0}")]
pub struct StatusStoreError(pub String);

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set_owner_progress(
        &self,
        owner_id: &OwnerId,
        status: OwnerStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> Result<(), StatusStoreError>;
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusStore;

#[async_trait]
impl StatusStore for NoopStatusStore {
    async fn set_owner_progress(
        &self,
        _owner_id: &OwnerId,
        _status: OwnerStatus,
        _progress: Option<u8>,
        _error: Option<&str>,
    ) -> Result<(), StatusStoreError> {
        Ok(())
    }
}

/// Emits every update as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusStore;

#[async_trait]
impl StatusStore for LoggingStatusStore {
    async fn set_owner_progress(
        &self,
        owner_id: &OwnerId,
        status: OwnerStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) -> Result<(), StatusStoreError> {
        info!(owner_id = %owner_id, %status, ?progress, ?error, "owner status");
        Ok(())
    }
}
