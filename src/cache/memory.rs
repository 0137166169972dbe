//! Process-local TTL cache.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::{self, Clock};

#[derive(Debug, Clone)]
struct Slot<V> {
  value: V,
  expires_at: DateTime<Utc>,
}

/// In-memory cache; lost on restart.
///
/// An entry is a hit while `now < expires_at`. Expired entries are dropped
/// lazily on access, by [`size`](Self::size), or by the optional sweeper task.
pub struct MemoryCache<V> {
  entries: Mutex<HashMap<String, Slot<V>>>,
  clock: Arc<dyn Clock>,
  sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone> MemoryCache<V> {
  pub fn new() -> Self {
    Self::with_clock(clock::system())
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      clock,
      sweeper: Mutex::new(None),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
    let expires_at = clock::expiry_after(self.clock.now(), ttl);
    self.lock().insert(key.into(), Slot { value, expires_at });
  }

  pub fn get(&self, key: &str) -> Option<V> {
    let now = self.clock.now();
    let mut entries = self.lock();
    match entries.get(key) {
      Some(slot) if now < slot.expires_at => Some(slot.value.clone()),
      Some(_) => {
        entries.remove(key);
        None
      }
      None => None,
    }
  }

  pub fn has(&self, key: &str) -> bool {
    let now = self.clock.now();
    let mut entries = self.lock();
    match entries.get(key) {
      Some(slot) if now < slot.expires_at => true,
      Some(_) => {
        entries.remove(key);
        false
      }
      None => false,
    }
  }

  /// Returns whether an entry was removed.
  pub fn delete(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  /// Number of live entries. Sweeps expired entries first.
  pub fn size(&self) -> usize {
    self.sweep();
    self.lock().len()
  }

  /// Drop every expired entry, returning how many were removed.
  pub fn sweep(&self) -> usize {
    let now = self.clock.now();
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|_, slot| now < slot.expires_at);
    before - entries.len()
  }

  /// Stop the sweeper and drop all entries.
  pub fn dispose(&self) {
    if let Some(handle) = self
      .sweeper
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take()
    {
      handle.abort();
    }
    self.clear();
  }
}

impl<V: Clone + Send + 'static> MemoryCache<V> {
  /// Sweep expired entries every `interval` on the current tokio runtime.
  ///
  /// Replaces any sweeper already running. The task holds only a weak
  /// reference, so it ends on its own once the cache is dropped.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
    let weak = Arc::downgrade(self);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(cache) = weak.upgrade() else {
          break;
        };
        let removed = cache.sweep();
        if removed > 0 {
          tracing::debug!(removed, "Swept expired memory cache entries");
        }
      }
    });

    let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = slot.replace(handle) {
      old.abort();
    }
  }
}

impl<V: Clone> Default for MemoryCache<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V> Drop for MemoryCache<V> {
  fn drop(&mut self) {
    if let Ok(slot) = self.sweeper.get_mut() {
      if let Some(handle) = slot.take() {
        handle.abort();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn cache() -> (MemoryCache<i32>, ManualClock) {
    let clock = ManualClock::starting_now();
    (MemoryCache::with_clock(Arc::new(clock.clone())), clock)
  }

  #[test]
  fn test_hit_before_expiry_miss_after() {
    let (cache, clock) = cache();
    cache.set("a", 1, Duration::from_millis(1000));

    clock.advance(chrono::Duration::milliseconds(500));
    assert_eq!(cache.get("a"), Some(1));

    clock.advance(chrono::Duration::milliseconds(1000));
    assert_eq!(cache.get("a"), None);
  }

  #[test]
  fn test_miss_exactly_at_expiry() {
    let (cache, clock) = cache();
    cache.set("a", 1, Duration::from_millis(1000));

    clock.advance(chrono::Duration::milliseconds(999));
    assert!(cache.has("a"));
    clock.advance(chrono::Duration::milliseconds(1));
    assert!(!cache.has("a"));
    assert_eq!(cache.get("a"), None);
  }

  #[test]
  fn test_expiry_holds_for_many_ttls() {
    for ttl_ms in [1i64, 10, 250, 60_000, 86_400_000] {
      let (cache, clock) = cache();
      cache.set("k", 42, Duration::from_millis(ttl_ms as u64));

      clock.advance(chrono::Duration::milliseconds(ttl_ms - 1));
      assert_eq!(cache.get("k"), Some(42), "ttl {}", ttl_ms);
      clock.advance(chrono::Duration::milliseconds(1));
      assert_eq!(cache.get("k"), None, "ttl {}", ttl_ms);
    }
  }

  #[test]
  fn test_overwrite_resets_ttl() {
    let (cache, clock) = cache();
    cache.set("a", 1, Duration::from_millis(100));
    clock.advance(chrono::Duration::milliseconds(90));
    cache.set("a", 2, Duration::from_millis(100));
    clock.advance(chrono::Duration::milliseconds(90));
    assert_eq!(cache.get("a"), Some(2));
  }

  #[test]
  fn test_size_sweeps_expired() {
    let (cache, clock) = cache();
    cache.set("short", 1, Duration::from_millis(10));
    cache.set("long", 2, Duration::from_secs(60));
    assert_eq!(cache.size(), 2);

    clock.advance(chrono::Duration::milliseconds(20));
    assert_eq!(cache.size(), 1);
  }

  #[test]
  fn test_delete_and_clear() {
    let (cache, _) = cache();
    cache.set("a", 1, Duration::from_secs(1));
    cache.set("b", 2, Duration::from_secs(1));

    assert!(cache.delete("a"));
    assert!(!cache.delete("a"));
    assert_eq!(cache.get("b"), Some(2));

    cache.clear();
    assert_eq!(cache.size(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sweeper_removes_expired_entries() {
    let clock = ManualClock::starting_now();
    let cache = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
    cache.set("a", 1, Duration::from_millis(50));
    cache.spawn_sweeper(Duration::from_secs(1));

    clock.advance(chrono::Duration::milliseconds(100));
    tokio::time::sleep(Duration::from_millis(1100)).await;
    tokio::task::yield_now().await;

    assert_eq!(cache.lock().len(), 0);
    cache.dispose();
  }
}
