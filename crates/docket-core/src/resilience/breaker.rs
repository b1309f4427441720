//! Circuit breaker around calls to an external dependency.
//!
//! Closed: calls pass; `failure_threshold` consecutive failures open the
//! circuit. Open: calls fail fast with [`BreakerError::Open`] until
//! `recovery_timeout` has passed since the last failure. Half-open: exactly
//! one trial call is admitted; success closes the circuit, failure re-opens
//! it. Concurrent callers during the trial fail fast.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::ProcessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The call was not attempted.
    #[error("circuit '{name}' is open; retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// An open circuit is always worth retrying later; inner errors keep their
/// own classification.
impl<E: Into<ProcessError>> From<BreakerError<E>> for ProcessError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { name, retry_after } => ProcessError::transient(format!(
                "circuit '{name}' is open; retry after {retry_after:?}"
            )),
            BreakerError::Inner(e) => e.into(),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Run `f` under the breaker. `f` is not invoked while the circuit is open.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = self.acquire::<E>()?;
        let result = f().await;
        permit.settled = true;
        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = s.last_failure.map_or(self.config.recovery_timeout, |at| at.elapsed());
                if elapsed >= self.config.recovery_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.trial_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    Ok(Permit::new(self, true))
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_after: self.config.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen if s.trial_in_flight => Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                s.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self) {
        let mut s = self.lock();
        s.failure_count = 0;
        s.trial_in_flight = false;
        if s.state != CircuitState::Closed {
            s.state = CircuitState::Closed;
            info!(breaker = %self.name, "circuit closed after successful recovery");
        }
    }

    fn on_failure(&self) {
        let mut s = self.lock();
        s.failure_count = s.failure_count.saturating_add(1);
        s.last_failure = Some(Instant::now());
        s.trial_in_flight = false;

        let reopen = match s.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => s.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if reopen {
            s.state = CircuitState::Open;
            warn!(breaker = %self.name, failure_count = s.failure_count, "circuit opened");
        }
    }
}

/// Frees the half-open trial slot if the caller's future is dropped before
/// the call settles.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}
