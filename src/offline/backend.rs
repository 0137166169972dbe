//! Storage backend trait for the offline store, plus the flat fallback.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::sync::SyncOperation;
use crate::cache::{CacheEntry, KvStore};

/// A cached document as the offline store persists it.
pub type StoredEntry = CacheEntry<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
  /// Structured on-device database
  Structured,
  /// Flat key/value fallback
  KeyValue,
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BackendKind::Structured => f.write_str("structured"),
      BackendKind::KeyValue => f.write_str("key-value"),
    }
  }
}

/// Record storage for the two offline collections: `cache` (keyed by entry
/// key) and `sync_operations` (keyed by operation id).
pub trait StorageBackend: Send + Sync {
  fn kind(&self) -> BackendKind;

  /// Entry for `key` regardless of expiry.
  fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>>;

  /// Insert or replace by key.
  fn put_entry(&self, entry: &StoredEntry) -> Result<()>;

  fn delete_entry(&self, key: &str) -> Result<()>;

  fn clear_entries(&self) -> Result<()>;

  /// Keys whose expiry is at or before `now`.
  fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

  /// Entry count and total serialized size in bytes.
  fn entry_stats(&self) -> Result<(usize, u64)>;

  /// Every stored operation in insertion order.
  fn load_operations(&self) -> Result<Vec<SyncOperation>>;

  /// Append a new operation or update an existing one in place, keeping its
  /// position.
  fn put_operation(&self, op: &SyncOperation) -> Result<()>;

  fn delete_operation(&self, id: &str) -> Result<()>;
}

const ENTRY_PREFIX: &str = "offline:cache:";
const OPERATIONS_KEY: &str = "offline:sync_operations";
/// Keys longer than this are stored under their SHA-256 digest.
const MAX_RAW_KEY_LEN: usize = 128;

/// Fallback backend over a flat [`KvStore`].
///
/// Each cache entry is one item; the operation queue is a single JSON array.
pub struct KvBackend {
  store: Arc<dyn KvStore>,
}

impl KvBackend {
  pub fn new(store: Arc<dyn KvStore>) -> Self {
    Self { store }
  }

  fn entry_key(key: &str) -> String {
    if key.len() <= MAX_RAW_KEY_LEN {
      return format!("{}{}", ENTRY_PREFIX, key);
    }
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{}#{}", ENTRY_PREFIX, hex::encode(hasher.finalize()))
  }

  fn entry_keys(&self) -> Result<Vec<String>> {
    Ok(
      self
        .store
        .keys()?
        .into_iter()
        .filter(|k| k.starts_with(ENTRY_PREFIX))
        .collect(),
    )
  }

  fn read_entry(&self, storage_key: &str) -> Result<Option<StoredEntry>> {
    match self.store.get_item(storage_key)? {
      Some(raw) => {
        let entry = serde_json::from_str(&raw)
          .map_err(|e| eyre!("Corrupt offline entry {}: {}", storage_key, e))?;
        Ok(Some(entry))
      }
      None => Ok(None),
    }
  }

  fn save_operations(&self, ops: &[SyncOperation]) -> Result<()> {
    let json =
      serde_json::to_string(ops).map_err(|e| eyre!("Failed to serialize sync queue: {}", e))?;
    self.store.set_item(OPERATIONS_KEY, &json)
  }
}

impl StorageBackend for KvBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::KeyValue
  }

  fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
    let entry = self.read_entry(&Self::entry_key(key))?;
    // Guard against digest collisions
    Ok(entry.filter(|e| e.key == key))
  }

  fn put_entry(&self, entry: &StoredEntry) -> Result<()> {
    let json =
      serde_json::to_string(entry).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;
    self.store.set_item(&Self::entry_key(&entry.key), &json)
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    self.store.remove_item(&Self::entry_key(key))
  }

  fn clear_entries(&self) -> Result<()> {
    for key in self.entry_keys()? {
      self.store.remove_item(&key)?;
    }
    Ok(())
  }

  fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut expired = Vec::new();
    for storage_key in self.entry_keys()? {
      match self.read_entry(&storage_key) {
        Ok(Some(entry)) if entry.is_expired(now) => expired.push(entry.key),
        Ok(_) => {}
        Err(e) => {
          tracing::warn!(key = %storage_key, error = %e, "Removing unreadable offline entry");
          self.store.remove_item(&storage_key)?;
        }
      }
    }
    Ok(expired)
  }

  fn entry_stats(&self) -> Result<(usize, u64)> {
    let mut count = 0;
    let mut bytes = 0u64;
    for key in self.entry_keys()? {
      if let Some(raw) = self.store.get_item(&key)? {
        count += 1;
        bytes += raw.len() as u64;
      }
    }
    Ok((count, bytes))
  }

  fn load_operations(&self) -> Result<Vec<SyncOperation>> {
    match self.store.get_item(OPERATIONS_KEY)? {
      Some(raw) => {
        serde_json::from_str(&raw).map_err(|e| eyre!("Corrupt sync queue: {}", e))
      }
      None => Ok(Vec::new()),
    }
  }

  fn put_operation(&self, op: &SyncOperation) -> Result<()> {
    let mut ops = self.load_operations()?;
    match ops.iter_mut().find(|o| o.id == op.id) {
      Some(existing) => *existing = op.clone(),
      None => ops.push(op.clone()),
    }
    self.save_operations(&ops)
  }

  fn delete_operation(&self, id: &str) -> Result<()> {
    let mut ops = self.load_operations()?;
    let before = ops.len();
    ops.retain(|o| o.id != id);
    if ops.len() != before {
      self.save_operations(&ops)?;
    }
    Ok(())
  }
}
