//! Process configuration, read from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::observability::LogFormat;
use crate::queue::{QueueBackend, QueueConfig};
use crate::resilience::{BackoffStrategy, BreakerConfig, RetryConfig};
use crate::worker::WorkerConfig;

pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const DEFAULT_SNAPSHOT_PATH: &str = "task_queue.json";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value '{value}' for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocketConfig {
    pub worker_count: usize,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Terminal tasks older than this are removed by cleanup.
    pub cleanup_max_age: Duration,
    pub cleanup_interval: Duration,
    /// In-flight tasks not updated for this long are requeued.
    pub stale_after: Duration,
    pub log_format: LogFormat,
}

impl Default for DocketConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue: QueueConfig {
                snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
                ..QueueConfig::default()
            },
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            cleanup_max_age: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(30 * 60),
            log_format: LogFormat::default(),
        }
    }
}

impl DocketConfig {
    /// Read the process environment.
    ///
    /// # Defaults
    ///
    /// - `DOCKET_WORKER_COUNT`: 2
    /// - `DOCKET_QUEUE_BACKEND`: `postgres` (`redis`, `memory`)
    /// - `DATABASE_URL`, `REDIS_URL`: unset
    /// - `DOCKET_REDIS_PREFIX`: `docket`
    /// - `DOCKET_SNAPSHOT_PATH`: `task_queue.json` (empty disables snapshots)
    /// - `DOCKET_DEQUEUE_TIMEOUT_MS`: 1000
    /// - `DOCKET_IDLE_INTERVAL_MS`: 1000
    /// - `DOCKET_ERROR_BACKOFF_MS`: 5000
    /// - `DOCKET_RETRY_MAX_ATTEMPTS` / `_BASE_DELAY_MS` / `_MAX_DELAY_MS` /
    ///   `_STRATEGY` / `_JITTER`: 3 / 1000 / 60000 / `exponential` / `true`
    /// - `DOCKET_BREAKER_FAILURE_THRESHOLD`: 5
    /// - `DOCKET_BREAKER_RECOVERY_TIMEOUT_MS`: 60000
    /// - `DOCKET_CLEANUP_MAX_AGE_HOURS`: 24
    /// - `DOCKET_STALE_AFTER_MINUTES`: 30; must exceed the retry max delay
    /// - `LOG_FORMAT`: `pretty` (`json`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let worker_count: usize = env.parse_or("DOCKET_WORKER_COUNT", defaults.worker_count)?;
        if worker_count == 0 {
            return Err(invalid("DOCKET_WORKER_COUNT", "0", "at least one worker is required"));
        }

        let snapshot_path = match env.get("DOCKET_SNAPSHOT_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => defaults.queue.snapshot_path.clone(),
        };

        let queue = QueueConfig {
            backend: env.parse_with("DOCKET_QUEUE_BACKEND", defaults.queue.backend, |s| {
                QueueBackend::from_str(s).map_err(|e| e.to_string())
            })?,
            database_url: env.get("DATABASE_URL"),
            redis_url: env.get("REDIS_URL"),
            redis_prefix: env
                .get("DOCKET_REDIS_PREFIX")
                .unwrap_or(defaults.queue.redis_prefix),
            snapshot_path,
            dequeue_timeout: env.millis_or("DOCKET_DEQUEUE_TIMEOUT_MS", defaults.queue.dequeue_timeout)?,
        };

        let worker = WorkerConfig {
            idle_interval: env.millis_or("DOCKET_IDLE_INTERVAL_MS", defaults.worker.idle_interval)?,
            error_backoff: env.millis_or("DOCKET_ERROR_BACKOFF_MS", defaults.worker.error_backoff)?,
        };

        let retry = RetryConfig {
            max_attempts: env.parse_or("DOCKET_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: env.millis_or("DOCKET_RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
            max_delay: env.millis_or("DOCKET_RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
            strategy: env.parse_with("DOCKET_RETRY_STRATEGY", defaults.retry.strategy, BackoffStrategy::from_str)?,
            jitter: env.parse_with("DOCKET_RETRY_JITTER", defaults.retry.jitter, parse_bool)?,
            ..defaults.retry
        };

        let breaker = BreakerConfig {
            failure_threshold: env.parse_or(
                "DOCKET_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?,
            recovery_timeout: env.millis_or(
                "DOCKET_BREAKER_RECOVERY_TIMEOUT_MS",
                defaults.breaker.recovery_timeout,
            )?,
        };

        let max_age_hours: u64 = env.parse_or(
            "DOCKET_CLEANUP_MAX_AGE_HOURS",
            defaults.cleanup_max_age.as_secs() / 3600,
        )?;

        let stale_minutes: u64 = env.parse_or(
            "DOCKET_STALE_AFTER_MINUTES",
            defaults.stale_after.as_secs() / 60,
        )?;
        let stale_after = Duration::from_secs(stale_minutes * 60);
        // A task sleeping out its backoff is not updated meanwhile.
        if stale_after <= retry.max_delay {
            return Err(invalid(
                "DOCKET_STALE_AFTER_MINUTES",
                &stale_minutes.to_string(),
                "must be longer than the retry max delay",
            ));
        }

        Ok(Self {
            worker_count,
            queue,
            worker,
            retry,
            breaker,
            cleanup_max_age: Duration::from_secs(max_age_hours * 3600),
            cleanup_interval: defaults.cleanup_interval,
            stale_after,
            log_format: env.parse_with("LOG_FORMAT", defaults.log_format, LogFormat::from_str)?,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse_with<T, E, P>(&self, key: &str, default: T, parse: P) -> Result<T, ConfigError>
    where
        P: Fn(&str) -> Result<T, E>,
        E: ToString,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse(raw.trim()).map_err(|e| invalid(key, &raw, e.to_string())),
        }
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        self.parse_with(key, default, T::from_str)
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse_with(key, default, |s| s.parse::<u64>().map(Duration::from_millis))
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}
