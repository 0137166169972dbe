//! Flat string key/value stores backing the persistent tiers.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A flat, string-to-string persistent store.
///
/// Shared by every cache and queue instance; writes are last-writer-wins.
pub trait KvStore: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  /// Fails if the write would exceed the store's quota.
  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  fn remove_item(&self, key: &str) -> Result<()>;

  fn keys(&self) -> Result<Vec<String>>;
}

fn used_bytes(map: &BTreeMap<String, String>) -> usize {
  map.iter().map(|(k, v)| k.len() + v.len()).sum()
}

fn check_quota(
  map: &BTreeMap<String, String>,
  quota: Option<usize>,
  key: &str,
  value: &str,
) -> Result<()> {
  let Some(quota) = quota else {
    return Ok(());
  };
  let replaced = map.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
  let needed = used_bytes(map) - replaced + key.len() + value.len();
  if needed > quota {
    return Err(eyre!(
      "Storage quota exceeded: {} bytes needed, {} allowed",
      needed,
      quota
    ));
  }
  Ok(())
}

/// Volatile store, mainly for tests and environments without a disk.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
  items: Mutex<BTreeMap<String, String>>,
  quota_bytes: Option<usize>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      items: Mutex::new(BTreeMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl KvStore for MemoryKvStore {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock().get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    let mut items = self.lock();
    check_quota(&items, self.quota_bytes, key, value)?;
    items.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    self.lock().remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock().keys().cloned().collect())
  }
}

/// Serializes load-modify-write cycles across every file store in the process.
static FILE_LOCK: Mutex<()> = Mutex::new(());

/// Store persisted as one JSON object on disk.
///
/// The file is the only copy: every operation re-reads it, and every
/// mutation writes the whole map back through a temp file and a rename, so a
/// crash leaves either the old or the new file. Any number of handles may
/// point at the same path; a write through one never drops keys written
/// through another.
#[derive(Debug)]
pub struct FileKvStore {
  path: PathBuf,
  quota_bytes: Option<usize>,
}

impl FileKvStore {
  /// Open or create the store at `path`.
  ///
  /// An unreadable or corrupt file is logged and treated as empty; the next
  /// write replaces it.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let store = Self {
      path,
      quota_bytes: None,
    };
    store.load()?;
    Ok(store)
  }

  pub fn with_quota(mut self, quota_bytes: usize) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn file_lock() -> MutexGuard<'static, ()> {
    FILE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn load(&self) -> Result<BTreeMap<String, String>> {
    match std::fs::read_to_string(&self.path) {
      Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_else(|e| {
        tracing::warn!(path = %self.path.display(), error = %e, "Discarding corrupt key/value file");
        BTreeMap::new()
      })),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
      Err(e) => Err(eyre!(
        "Failed to read key/value store at {}: {}",
        self.path.display(),
        e
      )),
    }
  }

  fn flush(&self, items: &BTreeMap<String, String>) -> Result<()> {
    let data =
      serde_json::to_vec(items).map_err(|e| eyre!("Failed to serialize key/value store: {}", e))?;
    let tmp = self.path.with_extension("tmp");
    std::fs::write(&tmp, data)
      .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace {}: {}", self.path.display(), e))?;
    Ok(())
  }
}

impl KvStore for FileKvStore {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    let _guard = Self::file_lock();
    Ok(self.load()?.remove(key))
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    let _guard = Self::file_lock();
    let mut items = self.load()?;
    check_quota(&items, self.quota_bytes, key, value)?;
    items.insert(key.to_string(), value.to_string());
    self.flush(&items)
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    let _guard = Self::file_lock();
    let mut items = self.load()?;
    if items.remove(key).is_some() {
      self.flush(&items)?;
    }
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let _guard = Self::file_lock();
    Ok(self.load()?.into_keys().collect())
  }
}
