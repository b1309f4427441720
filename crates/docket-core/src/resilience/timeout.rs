//! Bounded wait around an external call.

use std::future::Future;
use std::time::Duration;

use tracing::error;

use crate::domain::ProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {after:?}")]
pub struct TimeoutError {
    pub after: Duration,
}

impl From<TimeoutError> for ProcessError {
    fn from(err: TimeoutError) -> Self {
        ProcessError::transient(err.to_string())
    }
}

/// Await `fut` for at most `duration`. The future is dropped on expiry.
pub async fn with_timeout<F>(duration: Duration, fut: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(output) => Ok(output),
        Err(_) => {
            error!(timeout_ms = duration.as_millis() as u64, "operation timed out");
            Err(TimeoutError { after: duration })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_within_budget() {
        let out = with_timeout(Duration::from_secs(1), async { 5 }).await;
        assert_eq!(out, Ok(5));
    }

    #[tokio::test(start_paused = true)]
    async fn expires() {
        let slow = tokio::time::sleep(Duration::from_secs(10));
        let err = with_timeout(Duration::from_secs(2), slow).await.unwrap_err();
        assert_eq!(err.after, Duration::from_secs(2));
        assert!(ProcessError::from(err).is_retryable());
    }
}
