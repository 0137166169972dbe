//! Time source used for expiry and circuit cooldowns.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current instant.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant, so a test can hand one copy to a cache and
/// advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  /// Start at the current wall-clock time.
  pub fn starting_now() -> Self {
    Self::new(Utc::now())
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now = to;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Shared handle to the default wall clock.
pub fn system() -> Arc<dyn Clock> {
  Arc::new(SystemClock)
}

/// `now + ttl`, saturating at the latest representable instant.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
  Duration::from_std(ttl)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances_shared_copies() {
    let clock = ManualClock::starting_now();
    let other = clock.clone();
    let start = clock.now();

    other.advance(Duration::milliseconds(1500));

    assert_eq!(clock.now() - start, Duration::milliseconds(1500));
  }

  #[test]
  fn test_expiry_saturates_instead_of_overflowing() {
    let now = Utc::now();
    assert_eq!(
      expiry_after(now, std::time::Duration::from_secs(2)),
      now + Duration::seconds(2)
    );
    assert_eq!(
      expiry_after(now, std::time::Duration::MAX),
      DateTime::<Utc>::MAX_UTC
    );
  }
}
