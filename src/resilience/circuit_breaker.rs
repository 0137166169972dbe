//! Circuit breaker guarding one logical operation.
//!
//! After `failure_threshold` failures the circuit opens and calls fail fast
//! without touching the guarded operation. Once `recovery_timeout` has passed
//! since the last failure, a single probe call is let through (half-open); its
//! outcome closes or reopens the circuit.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{self, Clock};
use crate::error::{AppError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  /// Requests flow normally
  Closed,
  /// Requests are rejected without running
  Open,
  /// One probe request is testing whether the operation recovered
  HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
  /// Name for logging
  pub name: String,
  pub failure_threshold: u32,
  pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      name: "default".to_string(),
      failure_threshold: 5,
      recovery_timeout: Duration::from_secs(60),
    }
  }
}

impl CircuitBreakerConfig {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }

  pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
    self.failure_threshold = threshold.max(1);
    self
  }

  pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
    self.recovery_timeout = timeout;
    self
  }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
  pub state: CircuitState,
  pub failure_count: u32,
  pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
  state: CircuitState,
  failure_count: u32,
  last_failure_at: Option<DateTime<Utc>>,
  probe_in_flight: bool,
}

pub struct CircuitBreaker {
  config: CircuitBreakerConfig,
  inner: Mutex<Inner>,
  clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CircuitBreaker")
      .field("config", &self.config)
      .field("snapshot", &self.snapshot())
      .finish()
  }
}

enum Admission {
  Run { probe: bool },
  Reject { retry_after: Duration },
}

/// Releases the half-open probe slot if the probe future is dropped early.
struct ProbeSlot<'a> {
  breaker: &'a CircuitBreaker,
  armed: bool,
}

impl Drop for ProbeSlot<'_> {
  fn drop(&mut self) {
    if self.armed {
      self.breaker.lock().probe_in_flight = false;
    }
  }
}

impl CircuitBreaker {
  pub fn new(config: CircuitBreakerConfig) -> Self {
    Self::with_clock(config, clock::system())
  }

  pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
    Self {
      config,
      inner: Mutex::new(Inner {
        state: CircuitState::Closed,
        failure_count: 0,
        last_failure_at: None,
        probe_in_flight: false,
      }),
      clock,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn state(&self) -> CircuitState {
    self.lock().state
  }

  pub fn snapshot(&self) -> CircuitSnapshot {
    let inner = self.lock();
    CircuitSnapshot {
      state: inner.state,
      failure_count: inner.failure_count,
      last_failure_at: inner.last_failure_at,
    }
  }

  pub fn name(&self) -> &str {
    &self.config.name
  }

  /// Run `operation` unless the circuit is open.
  ///
  /// A rejected call returns a retryable `server` error and never invokes
  /// the operation.
  pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, AppError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<AppError>,
  {
    let probe = match self.admit() {
      Admission::Run { probe } => probe,
      Admission::Reject { retry_after } => return Err(self.open_error(retry_after)),
    };
    let mut slot = ProbeSlot {
      breaker: self,
      armed: probe,
    };

    let result = operation().await;
    slot.armed = false;
    match result {
      Ok(value) => {
        self.record_success();
        Ok(value)
      }
      Err(e) => {
        self.record_failure();
        Err(e.into())
      }
    }
  }

  fn admit(&self) -> Admission {
    let now = self.clock.now();
    let mut inner = self.lock();

    match inner.state {
      CircuitState::Closed => Admission::Run { probe: false },
      CircuitState::Open => {
        let since = inner
          .last_failure_at
          .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
          .unwrap_or(self.config.recovery_timeout + Duration::from_millis(1));

        if since <= self.config.recovery_timeout {
          return Admission::Reject {
            retry_after: self.config.recovery_timeout - since,
          };
        }

        inner.state = CircuitState::HalfOpen;
        inner.probe_in_flight = true;
        tracing::info!(circuit = %self.config.name, "Circuit half-open, probing");
        Admission::Run { probe: true }
      }
      CircuitState::HalfOpen => {
        if inner.probe_in_flight {
          Admission::Reject {
            retry_after: Duration::ZERO,
          }
        } else {
          inner.probe_in_flight = true;
          Admission::Run { probe: true }
        }
      }
    }
  }

  fn record_success(&self) {
    let mut inner = self.lock();
    if inner.state != CircuitState::Closed {
      tracing::info!(circuit = %self.config.name, "Circuit closed after successful probe");
    }
    inner.state = CircuitState::Closed;
    inner.failure_count = 0;
    inner.probe_in_flight = false;
  }

  fn record_failure(&self) {
    let now = self.clock.now();
    let mut inner = self.lock();
    inner.failure_count = inner.failure_count.saturating_add(1);
    inner.last_failure_at = Some(now);
    inner.probe_in_flight = false;

    if inner.failure_count >= self.config.failure_threshold {
      if inner.state != CircuitState::Open {
        tracing::warn!(
          circuit = %self.config.name,
          failures = inner.failure_count,
          "Circuit opened due to failures"
        );
      }
      inner.state = CircuitState::Open;
    }
  }

  /// Force the circuit closed and forget all failures.
  pub fn reset(&self) {
    let mut inner = self.lock();
    inner.state = CircuitState::Closed;
    inner.failure_count = 0;
    inner.probe_in_flight = false;
    tracing::info!(circuit = %self.config.name, "Circuit manually reset");
  }

  fn open_error(&self, retry_after: Duration) -> AppError {
    AppError::new(
      ErrorKind::Server,
      format!(
        "Circuit '{}' is open, retry after {}ms",
        self.config.name,
        retry_after.as_millis()
      ),
    )
    .with_code("CIRCUIT_OPEN")
    .retryable(true)
    .with_context("circuit", self.config.name.clone())
    .with_context("retry_after_ms", retry_after.as_millis().to_string())
  }
}
