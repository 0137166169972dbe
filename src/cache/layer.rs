//! Two-tier cache that orchestrates the memory and persistent tiers with
//! read-through fetching.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::memory::MemoryCache;
use super::persistent::PersistentCache;
use super::traits::CacheValue;
use crate::error::{create_error_from_unknown, AppError};

/// Per-call tier selection and TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartCacheOptions {
  pub memory_ttl: Duration,
  pub storage_ttl: Duration,
  pub use_memory: bool,
  pub use_storage: bool,
}

impl Default for SmartCacheOptions {
  fn default() -> Self {
    Self {
      memory_ttl: Duration::from_secs(5 * 60),
      storage_ttl: Duration::from_secs(24 * 60 * 60),
      use_memory: true,
      use_storage: true,
    }
  }
}

impl SmartCacheOptions {
  pub fn memory_only() -> Self {
    Self {
      use_storage: false,
      ..Self::default()
    }
  }

  pub fn storage_only() -> Self {
    Self {
      use_memory: false,
      ..Self::default()
    }
  }
}

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmartCacheStats {
  pub memory_hits: u64,
  pub storage_hits: u64,
  pub misses: u64,
  pub fetches: u64,
}

#[derive(Debug, Default)]
struct Counters {
  memory_hits: AtomicU64,
  storage_hits: AtomicU64,
  misses: AtomicU64,
  fetches: AtomicU64,
}

/// Memory tier in front of a persistent tier.
///
/// The persistent tier is the source of truth across restarts; the memory
/// tier only accelerates reads and is refilled from it on a hit.
#[derive(Clone)]
pub struct SmartCache {
  memory: Arc<MemoryCache<Value>>,
  storage: PersistentCache,
  defaults: SmartCacheOptions,
  counters: Arc<Counters>,
}

impl SmartCache {
  pub fn new(memory: Arc<MemoryCache<Value>>, storage: PersistentCache) -> Self {
    Self {
      memory,
      storage,
      defaults: SmartCacheOptions::default(),
      counters: Arc::new(Counters::default()),
    }
  }

  pub fn with_defaults(mut self, defaults: SmartCacheOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn defaults(&self) -> &SmartCacheOptions {
    &self.defaults
  }

  /// Look `key` up in the enabled tiers without fetching.
  pub fn get<T: CacheValue>(&self, key: &str, opts: &SmartCacheOptions) -> Option<T> {
    let found = self.lookup(key, opts);
    if found.is_none() {
      self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }
    found
  }

  fn lookup<T: CacheValue>(&self, key: &str, opts: &SmartCacheOptions) -> Option<T> {
    if opts.use_memory {
      if let Some(value) = self.memory.get(key) {
        match serde_json::from_value(value) {
          Ok(v) => {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(v);
          }
          Err(e) => {
            tracing::debug!(key, error = %e, "Memory entry has unexpected shape");
            self.memory.delete(key);
          }
        }
      }
    }

    if opts.use_storage {
      if let Some(entry) = self.storage.get_entry::<Value>(key) {
        match serde_json::from_value::<T>(entry.value.clone()) {
          Ok(v) => {
            self.counters.storage_hits.fetch_add(1, Ordering::Relaxed);
            if opts.use_memory {
              self.backfill(key, entry.value, entry.expires_at, opts.memory_ttl);
            }
            return Some(v);
          }
          Err(e) => {
            tracing::debug!(key, error = %e, "Stored entry has unexpected shape");
          }
        }
      }
    }

    None
  }

  /// Copy a stored hit into memory for no longer than it has left in storage.
  fn backfill(
    &self,
    key: &str,
    value: Value,
    expires_at: Option<DateTime<Utc>>,
    memory_ttl: Duration,
  ) {
    let ttl = match expires_at {
      Some(at) => (at - self.storage.now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(memory_ttl),
      None => memory_ttl,
    };
    if !ttl.is_zero() {
      self.memory.set(key, value, ttl);
    }
  }

  /// Read-through lookup: on a miss, run `fetcher`, store its result in the
  /// enabled tiers, and return it. Fetch failures are returned normalized.
  pub async fn get_or_fetch<T, E, F, Fut>(
    &self,
    key: &str,
    fetcher: F,
    opts: &SmartCacheOptions,
  ) -> Result<T, AppError>
  where
    T: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<AppError>,
  {
    if let Some(hit) = self.lookup(key, opts) {
      return Ok(hit);
    }
    self.counters.misses.fetch_add(1, Ordering::Relaxed);
    self.counters.fetches.fetch_add(1, Ordering::Relaxed);

    let value = fetcher()
      .await
      .map_err(|e| create_error_from_unknown(e, [("cache_key", key)]))?;
    self.set(key, &value, opts);
    Ok(value)
  }

  pub fn set<T: CacheValue>(&self, key: &str, value: &T, opts: &SmartCacheOptions) {
    if opts.use_memory {
      match serde_json::to_value(value) {
        Ok(json) => self.memory.set(key, json, opts.memory_ttl),
        Err(e) => tracing::warn!(key, error = %e, "Value cannot be cached in memory"),
      }
    }
    if opts.use_storage {
      self.storage.set(key, value, Some(opts.storage_ttl));
    }
  }

  pub fn delete(&self, key: &str, opts: &SmartCacheOptions) {
    if opts.use_memory {
      self.memory.delete(key);
    }
    if opts.use_storage {
      self.storage.delete(key);
    }
  }

  pub fn has(&self, key: &str, opts: &SmartCacheOptions) -> bool {
    (opts.use_memory && self.memory.has(key)) || (opts.use_storage && self.storage.has(key))
  }

  pub fn clear(&self, opts: &SmartCacheOptions) {
    if opts.use_memory {
      self.memory.clear();
    }
    if opts.use_storage {
      self.storage.clear();
    }
  }

  pub fn stats(&self) -> SmartCacheStats {
    SmartCacheStats {
      memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
      storage_hits: self.counters.storage_hits.load(Ordering::Relaxed),
      misses: self.counters.misses.load(Ordering::Relaxed),
      fetches: self.counters.fetches.load(Ordering::Relaxed),
    }
  }

  /// Drop the memory tier and stop its sweeper. Persisted data is kept.
  pub fn dispose(&self) {
    self.memory.dispose();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::kv::MemoryKvStore;
  use crate::clock::ManualClock;
  use crate::error::ErrorKind;
  use std::sync::atomic::AtomicU32;

  struct Fixture {
    cache: SmartCache,
    memory: Arc<MemoryCache<Value>>,
    storage: PersistentCache,
    clock: ManualClock,
  }

  fn fixture() -> Fixture {
    let clock = ManualClock::starting_now();
    let memory = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
    let storage = PersistentCache::new(Arc::new(MemoryKvStore::new()), "smart")
      .with_clock(Arc::new(clock.clone()));
    Fixture {
      cache: SmartCache::new(memory.clone(), storage.clone()),
      memory,
      storage,
      clock,
    }
  }

  #[test]
  fn test_set_writes_both_tiers() {
    let f = fixture();
    let opts = SmartCacheOptions::default();
    f.cache.set("views:v1", &120u64, &opts);

    assert_eq!(f.memory.get("views:v1"), Some(Value::from(120u64)));
    assert_eq!(f.storage.get::<u64>("views:v1"), Some(120));
  }

  #[test]
  fn test_storage_hit_backfills_memory() {
    let f = fixture();
    let opts = SmartCacheOptions::default();
    f.storage.set("k", &"from disk".to_string(), None);

    assert_eq!(f.cache.get::<String>("k", &opts).as_deref(), Some("from disk"));
    assert!(f.memory.has("k"));

    let stats = f.cache.stats();
    assert_eq!(stats.storage_hits, 1);
    assert_eq!(stats.memory_hits, 0);
  }

  #[test]
  fn test_backfill_never_outlives_stored_expiry() {
    let f = fixture();
    let opts = SmartCacheOptions {
      memory_ttl: Duration::from_secs(60),
      storage_ttl: Duration::from_secs(10),
      ..SmartCacheOptions::default()
    };
    f.storage.set("k", &1, Some(opts.storage_ttl));

    f.clock.advance(chrono::Duration::seconds(9));
    assert_eq!(f.cache.get::<i32>("k", &opts), Some(1));
    assert!(f.memory.has("k"));

    f.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(f.storage.get::<i32>("k"), None);
    assert_eq!(f.cache.get::<i32>("k", &opts), None);
  }

  #[test]
  fn test_memory_is_consulted_first() {
    let f = fixture();
    let opts = SmartCacheOptions::default();
    f.storage.set("k", &1, None);
    f.memory.set("k", Value::from(2), Duration::from_secs(60));

    assert_eq!(f.cache.get::<i32>("k", &opts), Some(2));
  }

  #[test]
  fn test_memory_expiry_falls_back_to_storage() {
    let f = fixture();
    let opts = SmartCacheOptions {
      memory_ttl: Duration::from_secs(1),
      storage_ttl: Duration::from_secs(60),
      ..SmartCacheOptions::default()
    };
    f.cache.set("k", &"v".to_string(), &opts);

    f.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(f.cache.get::<String>("k", &opts).as_deref(), Some("v"));
    assert_eq!(f.cache.stats().storage_hits, 1);
  }

  #[test]
  fn test_disabled_tiers_are_skipped() {
    let f = fixture();
    f.cache.set("k", &1, &SmartCacheOptions::memory_only());

    assert_eq!(f.storage.get::<i32>("k"), None);
    assert_eq!(f.cache.get::<i32>("k", &SmartCacheOptions::storage_only()), None);
    assert_eq!(f.cache.get::<i32>("k", &SmartCacheOptions::memory_only()), Some(1));
  }

  #[tokio::test]
  async fn test_fetcher_runs_once_then_cached() {
    let f = fixture();
    let opts = SmartCacheOptions::default();
    let calls = AtomicU32::new(0);
    let counter = &calls;

    for _ in 0..3 {
      let value: Vec<String> = f
        .cache
        .get_or_fetch(
          "catalog",
          || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(vec!["a".to_string(), "b".to_string()])
          },
          &opts,
        )
        .await
        .unwrap();
      assert_eq!(value.len(), 2);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.cache.stats().fetches, 1);
    assert!(f.storage.has("catalog"));
  }

  #[tokio::test]
  async fn test_fetch_failure_is_normalized() {
    let f = fixture();
    let err = f
      .cache
      .get_or_fetch::<String, _, _, _>(
        "k",
        || async { Err(AppError::network("offline")) },
        &SmartCacheOptions::default(),
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(err.context.get("cache_key").map(String::as_str), Some("k"));
    assert!(!f.cache.has("k", &SmartCacheOptions::default()));
  }

  #[test]
  fn test_delete_and_clear_apply_to_both_tiers() {
    let f = fixture();
    let opts = SmartCacheOptions::default();
    f.cache.set("a", &1, &opts);
    f.cache.set("b", &2, &opts);

    f.cache.delete("a", &opts);
    assert!(!f.cache.has("a", &opts));
    assert!(f.cache.has("b", &opts));

    f.cache.clear(&opts);
    assert!(!f.cache.has("b", &opts));
    assert_eq!(f.memory.size(), 0);
    assert_eq!(f.storage.size(), 0);
  }
}
