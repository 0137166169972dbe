//! Bounded retries with backoff, jitter and network-aware waiting.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{log_error, AppError, ErrorKind};
use crate::network::{NetworkStatus, Notice, Notifier};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
  Linear,
  Exponential,
  Fixed,
}

/// Decides whether a failed attempt should be retried. Receives the
/// normalized error and the 1-based attempt that just failed.
pub type RetryCondition = Arc<dyn Fn(&AppError, u32) -> bool + Send + Sync>;

/// Called right before each retry with the error and the attempt that failed.
pub type RetryHook = Arc<dyn Fn(&AppError, u32) + Send + Sync>;

/// Options for [`with_retry`].
#[derive(Clone)]
pub struct RetryOptions {
  /// Total attempts including the first; values below 1 are treated as 1
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub strategy: BackoffStrategy,
  pub jitter: bool,
  pub retry_condition: RetryCondition,
  pub on_retry: Option<RetryHook>,
  /// Wait for connectivity before retrying network failures
  pub network_aware: bool,
  pub network: Option<NetworkStatus>,
  /// Upper bound on the offline wait
  pub offline_retry_delay: Duration,
  pub notifier: Option<Arc<dyn Notifier>>,
}

impl fmt::Debug for RetryOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryOptions")
      .field("max_attempts", &self.max_attempts)
      .field("base_delay", &self.base_delay)
      .field("max_delay", &self.max_delay)
      .field("strategy", &self.strategy)
      .field("jitter", &self.jitter)
      .field("network_aware", &self.network_aware)
      .field("offline_retry_delay", &self.offline_retry_delay)
      .finish_non_exhaustive()
  }
}

impl Default for RetryOptions {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(30_000),
      strategy: BackoffStrategy::Exponential,
      jitter: true,
      retry_condition: Arc::new(default_retry_condition),
      on_retry: None,
      network_aware: false,
      network: None,
      offline_retry_delay: Duration::from_millis(5000),
      notifier: None,
    }
  }
}

impl RetryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Remote API calls: never retries bad input or auth failures, and waits
  /// on `network` for connectivity before retrying a network failure.
  pub fn api(network: NetworkStatus) -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(10_000),
      strategy: BackoffStrategy::Exponential,
      network_aware: true,
      network: Some(network),
      retry_condition: Arc::new(|error: &AppError, attempt| {
        !matches!(
          error.kind,
          ErrorKind::Validation | ErrorKind::Authentication | ErrorKind::Authorization
        ) && default_retry_condition(error, attempt)
      }),
      ..Self::default()
    }
  }

  /// Remote document-store operations.
  pub fn datastore() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_millis(10_000),
      strategy: BackoffStrategy::Exponential,
      retry_condition: Arc::new(|error: &AppError, _attempt| {
        matches!(error.kind, ErrorKind::Datastore | ErrorKind::Network)
          || error.mentions("unavailable")
          || error.mentions("deadline-exceeded")
      }),
      ..Self::default()
    }
  }

  /// Video and other media source loads, network-aware like [`api`](Self::api).
  pub fn media(network: NetworkStatus) -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(2000),
      max_delay: Duration::from_millis(10_000),
      strategy: BackoffStrategy::Linear,
      network_aware: true,
      network: Some(network),
      ..Self::default()
    }
  }

  pub fn with_max_attempts(mut self, attempts: u32) -> Self {
    self.max_attempts = attempts;
    self
  }

  pub fn with_base_delay(mut self, delay: Duration) -> Self {
    self.base_delay = delay;
    self
  }

  pub fn with_max_delay(mut self, delay: Duration) -> Self {
    self.max_delay = delay;
    self
  }

  pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  pub fn with_retry_condition<F>(mut self, condition: F) -> Self
  where
    F: Fn(&AppError, u32) -> bool + Send + Sync + 'static,
  {
    self.retry_condition = Arc::new(condition);
    self
  }

  pub fn with_on_retry<F>(mut self, hook: F) -> Self
  where
    F: Fn(&AppError, u32) + Send + Sync + 'static,
  {
    self.on_retry = Some(Arc::new(hook));
    self
  }

  /// Enable network-aware waiting against `status`.
  pub fn with_network(mut self, status: NetworkStatus) -> Self {
    self.network_aware = true;
    self.network = Some(status);
    self
  }

  pub fn with_offline_retry_delay(mut self, delay: Duration) -> Self {
    self.offline_retry_delay = delay;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }
}

/// Retry network and timeout failures, server failures on the first attempt
/// only, and anything flagged retryable.
pub fn default_retry_condition(error: &AppError, attempt: u32) -> bool {
  match error.kind {
    ErrorKind::Network | ErrorKind::Timeout => true,
    ErrorKind::Server if attempt < 2 => true,
    _ => error.retryable,
  }
}

/// Delay before the retry that follows `attempt` (1-based), before jitter.
pub fn compute_delay(
  strategy: BackoffStrategy,
  base: Duration,
  max: Duration,
  attempt: u32,
) -> Duration {
  let attempt = attempt.max(1);
  let delay = match strategy {
    BackoffStrategy::Linear => base.saturating_mul(attempt),
    BackoffStrategy::Exponential => {
      let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
      base.saturating_mul(factor)
    }
    BackoffStrategy::Fixed => base,
  };
  delay.min(max)
}

/// Scale `delay` by a uniform factor in `[0.5, 1.0]`.
pub fn apply_jitter<R: Rng + ?Sized>(delay: Duration, rng: &mut R) -> Duration {
  let factor: f64 = rng.gen_range(0.5..=1.0);
  delay.mul_f64(factor)
}

/// What [`with_retry`] produced.
#[derive(Debug)]
pub struct RetryOutcome<T> {
  pub result: Result<T, AppError>,
  /// Number of times the operation ran
  pub attempts: u32,
  pub total_duration: Duration,
}

impl<T> RetryOutcome<T> {
  pub fn is_success(&self) -> bool {
    self.result.is_ok()
  }

  pub fn into_result(self) -> Result<T, AppError> {
    self.result
  }
}

/// Run `operation` until it succeeds, the retry condition declines, or
/// `max_attempts` is reached. The terminal error is always returned.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> RetryOutcome<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Into<AppError>,
{
  let started = Instant::now();
  let max_attempts = options.max_attempts.max(1);
  let mut attempt = 1;

  loop {
    let error = match operation().await {
      Ok(data) => {
        return RetryOutcome {
          result: Ok(data),
          attempts: attempt,
          total_duration: started.elapsed(),
        }
      }
      Err(e) => e.into(),
    };

    if attempt >= max_attempts || !(options.retry_condition)(&error, attempt) {
      tracing::debug!(attempt, "Giving up");
      log_error(&error);
      return RetryOutcome {
        result: Err(error),
        attempts: attempt,
        total_duration: started.elapsed(),
      };
    }

    if options.network_aware && error.kind == ErrorKind::Network {
      if let Some(network) = options.network.as_ref().filter(|n| !n.is_online()) {
        if let Some(notifier) = &options.notifier {
          notifier.notify(&Notice::Offline);
        }
        let online = network.wait_until_online(options.offline_retry_delay).await;
        tracing::debug!(attempt, online, "Finished waiting for connectivity");
        if online {
          if let Some(notifier) = &options.notifier {
            notifier.notify(&Notice::Online);
          }
        }
      }
    }

    if let Some(hook) = &options.on_retry {
      hook(&error, attempt);
    }
    if let Some(notifier) = &options.notifier {
      notifier.notify(&Notice::Retrying {
        attempt,
        kind: error.kind,
        message: error.message.clone(),
      });
    }

    let mut delay = compute_delay(
      options.strategy,
      options.base_delay,
      options.max_delay,
      attempt,
    );
    if options.jitter {
      delay = apply_jitter(delay, &mut rand::thread_rng());
    }

    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying operation");
    tokio::time::sleep(delay).await;
    attempt += 1;
  }
}
