//! Restart-surviving cache over a flat key/value store.
//!
//! Every storage fault (quota, serialization, corrupt data) is logged and
//! treated as a miss. Corrupt keys are removed on sight.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;

use super::kv::KvStore;
use super::traits::{CacheEntry, CacheValue, ENTRY_VERSION};
use crate::clock::{self, Clock};

/// Persistent TTL cache under a namespace.
///
/// Keys are stored as `<namespace>:<key>`. A `:` inside the namespace is
/// replaced by `_`, so one namespace's prefix is never a prefix of another's.
#[derive(Clone)]
pub struct PersistentCache {
  store: Arc<dyn KvStore>,
  namespace: String,
  prefix: String,
  encode: bool,
  clock: Arc<dyn Clock>,
}

impl PersistentCache {
  pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
    let namespace = namespace.into().replace(':', "_");
    Self {
      store,
      prefix: format!("{}:", namespace),
      namespace,
      encode: false,
      clock: clock::system(),
    }
  }

  /// Hex-encode stored payloads. Reversible; not compression.
  pub fn with_encoding(mut self, encode: bool) -> Self {
    self.encode = encode;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
    self.clock.now()
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  fn encode_payload(&self, json: String) -> String {
    if self.encode {
      hex::encode(json.as_bytes())
    } else {
      json
    }
  }

  fn decode_payload(&self, raw: String) -> Result<String> {
    if !self.encode {
      return Ok(raw);
    }
    let bytes = hex::decode(raw.trim()).map_err(|e| eyre!("Invalid encoded payload: {}", e))?;
    String::from_utf8(bytes).map_err(|e| eyre!("Encoded payload is not UTF-8: {}", e))
  }

  /// Store `value`; `ttl` of `None` keeps it until deleted.
  pub fn set<T: CacheValue>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    if let Err(e) = self.try_set(key, value, ttl) {
      tracing::warn!(key, error = %e, "Persistent cache write failed");
    }
  }

  fn try_set<T: CacheValue>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
    let now = self.clock.now();
    let entry = CacheEntry::new(key, value, now, ttl.map(|t| clock::expiry_after(now, t)));
    let json =
      serde_json::to_string(&entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    self
      .store
      .set_item(&self.storage_key(key), &self.encode_payload(json))
  }

  pub fn get<T: CacheValue>(&self, key: &str) -> Option<T> {
    self.get_entry(key).map(|entry| entry.value)
  }

  /// Live entry for `key` with its metadata.
  pub fn get_entry<T: CacheValue>(&self, key: &str) -> Option<CacheEntry<T>> {
    let storage_key = self.storage_key(key);
    let raw = match self.store.get_item(&storage_key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        tracing::warn!(key, error = %e, "Persistent cache read failed");
        return None;
      }
    };

    let entry: CacheEntry<T> = match self.parse(raw) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(key, error = %e, "Dropping corrupt persistent cache entry");
        self.remove_quietly(&storage_key);
        return None;
      }
    };

    if entry.version != ENTRY_VERSION || entry.is_expired(self.clock.now()) {
      self.remove_quietly(&storage_key);
      return None;
    }
    Some(entry)
  }

  fn parse<T: CacheValue>(&self, raw: String) -> Result<CacheEntry<T>> {
    let json = self.decode_payload(raw)?;
    serde_json::from_str(&json).map_err(|e| eyre!("Failed to deserialize entry: {}", e))
  }

  pub fn has(&self, key: &str) -> bool {
    self.get_entry::<serde_json::Value>(key).is_some()
  }

  pub fn delete(&self, key: &str) {
    self.remove_quietly(&self.storage_key(key));
  }

  fn remove_quietly(&self, storage_key: &str) {
    if let Err(e) = self.store.remove_item(storage_key) {
      tracing::warn!(key = storage_key, error = %e, "Persistent cache delete failed");
    }
  }

  fn own_keys(&self) -> Vec<String> {
    match self.store.keys() {
      Ok(keys) => keys
        .into_iter()
        .filter(|k| k.starts_with(&self.prefix))
        .collect(),
      Err(e) => {
        tracing::warn!(error = %e, "Failed to list persistent cache keys");
        Vec::new()
      }
    }
  }

  /// Remove every key under this cache's namespace and nothing else.
  pub fn clear(&self) {
    for key in self.own_keys() {
      self.remove_quietly(&key);
    }
  }

  /// Remove expired, outdated and corrupt entries. Returns how many went.
  pub fn cleanup_expired(&self) -> usize {
    let mut removed = 0;
    for storage_key in self.own_keys() {
      let key = &storage_key[self.prefix.len()..];
      if self.get_entry::<serde_json::Value>(key).is_none() {
        removed += 1;
      }
    }
    if removed > 0 {
      tracing::debug!(removed, namespace = %self.namespace, "Cleaned up persistent cache");
    }
    removed
  }

  /// Number of live entries. Sweeps first.
  pub fn size(&self) -> usize {
    self.cleanup_expired();
    self.own_keys().len()
  }
}
