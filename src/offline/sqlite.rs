//! SQLite implementation of the structured offline backend.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::backend::{BackendKind, StorageBackend, StoredEntry};
use super::sync::SyncOperation;

/// Schema for the offline collections.
const OFFLINE_SCHEMA: &str = r#"
-- Cached documents (stores serialized JSON)
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    expires_at INTEGER,
    version INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_timestamp ON cache(timestamp);
CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);

-- Pending sync operations; rowid preserves insertion order
CREATE TABLE IF NOT EXISTS sync_operations (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    collection TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_operations_timestamp ON sync_operations(timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_operations_type ON sync_operations(type);
"#;

/// SQLite-based offline storage.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create offline directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open offline database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let backend = Self {
      conn: Mutex::new(conn),
    };
    backend.run_migrations()?;
    Ok(backend)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(OFFLINE_SCHEMA)
      .map_err(|e| eyre!("Failed to run offline migrations: {}", e))?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid stored timestamp {}", ms))
}

impl StorageBackend for SqliteBackend {
  fn kind(&self) -> BackendKind {
    BackendKind::Structured
  }

  fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
    let conn = self.conn()?;
    let row: Option<(String, i64, Option<i64>, u32)> = conn
      .query_row(
        "SELECT data, timestamp, expires_at, version FROM cache WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((data, timestamp, expires_at, version)) => {
        let value = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
        Ok(Some(StoredEntry {
          key: key.to_string(),
          value,
          created_at: from_millis(timestamp)?,
          expires_at: expires_at.map(from_millis).transpose()?,
          version,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(&self, entry: &StoredEntry) -> Result<()> {
    let data = serde_json::to_string(&entry.value)
      .map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache (key, data, timestamp, expires_at, version)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.key,
          data,
          millis(entry.created_at),
          entry.expires_at.map(millis),
          entry.version
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
    Ok(())
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(())
  }

  fn clear_entries(&self) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM cache WHERE expires_at IS NOT NULL AND expires_at <= ?")
      .map_err(|e| eyre!("Failed to prepare expiry query: {}", e))?;

    let keys = stmt
      .query_map(params![millis(now)], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query expired entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read expired entries: {}", e))?;
    Ok(keys)
  }

  fn entry_stats(&self) -> Result<(usize, u64)> {
    let conn = self.conn()?;
    let (count, bytes): (i64, i64) = conn
      .query_row(
        "SELECT COUNT(*), COALESCE(SUM(LENGTH(key) + LENGTH(data)), 0) FROM cache",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .map_err(|e| eyre!("Failed to compute cache stats: {}", e))?;
    Ok((count as usize, bytes as u64))
  }

  fn load_operations(&self) -> Result<Vec<SyncOperation>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, type, collection, data, timestamp, retry_count FROM sync_operations
         ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare sync queue query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, i64>(4)?,
          row.get::<_, u32>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?;

    let mut ops = Vec::new();
    for row in rows {
      let (id, op_type, collection, data, timestamp, retry_count) =
        row.map_err(|e| eyre!("Failed to read sync operation: {}", e))?;
      let op_type = match op_type.parse() {
        Ok(t) => t,
        Err(e) => {
          tracing::warn!(id = %id, error = %e, "Skipping sync operation with unknown type");
          continue;
        }
      };
      ops.push(SyncOperation {
        data: serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize sync operation {}: {}", id, e))?,
        id,
        op_type,
        collection,
        created_at: from_millis(timestamp)?,
        retry_count,
      });
    }
    Ok(ops)
  }

  fn put_operation(&self, op: &SyncOperation) -> Result<()> {
    let data = serde_json::to_string(&op.data)
      .map_err(|e| eyre!("Failed to serialize sync operation: {}", e))?;
    self
      .conn()?
      .execute(
        "INSERT INTO sync_operations (id, type, collection, data, timestamp, retry_count)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET retry_count = excluded.retry_count, data = excluded.data",
        params![
          op.id,
          op.op_type.as_str(),
          op.collection,
          data,
          millis(op.created_at),
          op.retry_count
        ],
      )
      .map_err(|e| eyre!("Failed to store sync operation: {}", e))?;
    Ok(())
  }

  fn delete_operation(&self, id: &str) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM sync_operations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete sync operation: {}", e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheEntry;
  use crate::offline::sync::NewSyncOperation;
  use chrono::Duration;
  use serde_json::json;

  #[test]
  fn test_entry_round_trip_keeps_millis() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let now = from_millis(Utc::now().timestamp_millis()).unwrap();
    let entry = CacheEntry::new("video:v1", json!({"title": "Intro"}), now, Some(now + Duration::minutes(5)));

    backend.put_entry(&entry).unwrap();
    assert_eq!(backend.get_entry("video:v1").unwrap(), Some(entry));
    assert_eq!(backend.get_entry("missing").unwrap(), None);
  }

  #[test]
  fn test_expiry_index_query() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let now = Utc::now();
    for (key, offset) in [("a", -10i64), ("b", 0), ("c", 10)] {
      backend
        .put_entry(&CacheEntry::new(key, json!(null), now, Some(now + Duration::seconds(offset))))
        .unwrap();
    }
    backend
      .put_entry(&CacheEntry::new("forever", json!(1), now, None))
      .unwrap();

    let mut expired = backend.expired_keys(now).unwrap();
    expired.sort();
    assert_eq!(expired, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn test_operation_order_survives_retry_update() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let now = from_millis(Utc::now().timestamp_millis()).unwrap();
    let mut ops: Vec<_> = (0..3)
      .map(|i| NewSyncOperation::create("videos", json!({ "n": i })).into_operation(now))
      .collect();
    for op in &ops {
      backend.put_operation(op).unwrap();
    }

    ops[0].retry_count = 2;
    backend.put_operation(&ops[0]).unwrap();
    backend.delete_operation(&ops[1].id).unwrap();

    let loaded = backend.load_operations().unwrap();
    assert_eq!(loaded, vec![ops[0].clone(), ops[2].clone()]);
  }

  #[test]
  fn test_stats_counts_entries() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    assert_eq!(backend.entry_stats().unwrap(), (0, 0));

    backend
      .put_entry(&CacheEntry::new("k", json!("v"), Utc::now(), None))
      .unwrap();
    let (count, bytes) = backend.entry_stats().unwrap();
    assert_eq!(count, 1);
    assert_eq!(bytes, ("k".len() + "\"v\"".len()) as u64);
  }
}
