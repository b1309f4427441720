//! Retry, circuit breaking and timeouts for fallible external calls.

pub mod breaker;
pub mod retry;
pub mod timeout;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitState};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
pub use timeout::{TimeoutError, with_timeout};
