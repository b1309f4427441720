//! Retry policy: decides backoff delays.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base * exponential_base^(attempt - 1)`
    #[default]
    Exponential,
    /// `base * attempt`
    Linear,
    /// `base`
    Fixed,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
        })
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Retry tuning. Immutable once built; clone freely.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub strategy: BackoffStrategy,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Text extraction: slow, flaky upstream.
    pub fn ocr() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            ..Self::default()
        }
    }

    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn api() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 1.5,
            ..Self::default()
        }
    }

    pub fn file() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (1-indexed; 0 is treated as 1), before jitter.
    ///
    /// With base 1s, exponential base 2.0 and max 60s:
    /// 1s, 2s, 4s, 8s, 16s, 32s, 60s, 60s, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.config.base_delay.as_secs_f64();
        let secs = match self.config.strategy {
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.config.exponential_base.powi(exp)
            }
            BackoffStrategy::Linear => base * f64::from(attempt),
            BackoffStrategy::Fixed => base,
        };
        let max = self.config.max_delay.as_secs_f64();
        // powi overflows to inf/NaN for large attempts; the cap absorbs both.
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.config.max_delay
        }
    }

    /// [`Self::backoff`] with jitter applied if configured.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.config.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds or `max_attempts` attempts have failed.
    ///
    /// `op` receives the 1-indexed attempt number. The last error is returned.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.retry_when(op, |_| true).await
    }

    /// Like [`Self::retry`], but gives up at once on errors for which
    /// `should_retry` returns false.
    pub async fn retry_when<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let started = tokio::time::Instant::now();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < max_attempts && should_retry(&e) => {
                    let delay = self.calculate_delay(attempt);
                    warn!(attempt, max_attempts, error = %e, "attempt failed");
                    debug!(delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}
