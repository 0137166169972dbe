//! Retry and circuit-breaking around fallible async operations.
//!
//! Both return a normalized [`AppError`](crate::error::AppError) once they
//! stop trying; neither swallows a terminal failure.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use retry::{
  apply_jitter, compute_delay, default_retry_condition, with_retry, BackoffStrategy,
  RetryCondition, RetryHook, RetryOptions, RetryOutcome,
};
