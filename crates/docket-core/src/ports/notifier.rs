//! Notifier port: terminal-transition webhooks.
//!
//! Delivery, retries and HTTP semantics belong to the implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::OwnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Completed,
    Failed,
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyEvent::Completed => f.write_str("completed"),
            NotifyEvent::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification error: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        owner_id: &OwnerId,
        event: NotifyEvent,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(
        &self,
        _owner_id: &OwnerId,
        _event: NotifyEvent,
        _payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(
        &self,
        owner_id: &OwnerId,
        event: NotifyEvent,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        info!(owner_id = %owner_id, %event, %payload, "webhook event");
        Ok(())
    }
}
