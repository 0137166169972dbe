//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Schema tag written with every persisted entry. Bump when the stored
/// layout changes; older entries then read as misses.
pub const ENTRY_VERSION: u32 = 1;

/// Values that can live in a persistent tier.
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Send + Sync {}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: T,
  pub created_at: DateTime<Utc>,
  /// Absent means the entry never expires
  pub expires_at: Option<DateTime<Utc>>,
  pub version: u32,
}

impl<T> CacheEntry<T> {
  pub fn new(
    key: impl Into<String>,
    value: T,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      key: key.into(),
      value,
      created_at,
      expires_at,
      version: ENTRY_VERSION,
    }
  }

  /// An entry is live strictly before its expiry instant.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a live cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Fetch failed and a previously cached value is served instead.
  pub fn fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within its TTL
  CacheFresh,
  /// Data from cache served because the fetch failed; may be past its TTL
  CacheStale,
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_entry_expiry_boundary() {
    let now = Utc::now();
    let entry = CacheEntry::new("a", 1, now, Some(now + Duration::milliseconds(1000)));

    assert!(!entry.is_expired(now + Duration::milliseconds(999)));
    assert!(entry.is_expired(now + Duration::milliseconds(1000)));
  }

  #[test]
  fn test_entry_without_expiry_never_expires() {
    let now = Utc::now();
    let entry = CacheEntry::new("a", "v", now, None);
    assert!(!entry.is_expired(now + Duration::days(3650)));
  }
}
