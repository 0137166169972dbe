//! Offline document cache and durable sync queue.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::backend::{BackendKind, KvBackend, StorageBackend, StoredEntry};
use super::sqlite::SqliteBackend;
use super::sync::{NewSyncOperation, SyncOperation};
use crate::cache::{CacheEntry, CacheResult, CacheValue, FileKvStore};
use crate::clock::{self, Clock};
use crate::error::{create_error_from_unknown, AppError};
use crate::network::{Notice, Notifier, TracingNotifier};

/// Where the offline store keeps its data.
#[derive(Debug, Clone)]
pub struct OfflineStoreOptions<'a> {
  /// Structured database file
  pub database_path: &'a Path,
  /// Flat key/value file used when the database cannot be opened
  pub fallback_path: &'a Path,
  /// Skip the structured database entirely
  pub force_fallback: bool,
  pub default_ttl: Duration,
}

/// Options for [`OfflineStore::fetch_with_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
  pub ttl: Duration,
  /// Skip the cache lookup and always call the fetcher
  pub force_refresh: bool,
  /// On fetch failure, serve any cached value, even an expired one
  pub fallback_to_cache: bool,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(30 * 60),
      force_refresh: false,
      fallback_to_cache: true,
    }
  }
}

/// Counters reported by [`OfflineStore::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStats {
  pub cache_entries: usize,
  pub pending_operations: usize,
  /// Sum of serialized entry and operation sizes
  pub estimated_bytes: u64,
}

/// On-device store for cached documents and the pending sync queue.
///
/// The backend is fixed at construction. Storage faults on the cache side
/// are logged and read as misses; the queue is kept in memory in FIFO order
/// and written through to the backend.
pub struct OfflineStore {
  backend: Box<dyn StorageBackend>,
  queue: Mutex<Vec<SyncOperation>>,
  clock: Arc<dyn Clock>,
  notifier: Arc<dyn Notifier>,
  default_ttl: Duration,
}

impl OfflineStore {
  /// Pick a backend, then [`init`](Self::init) from it.
  ///
  /// Tries the structured database first and falls back to the flat store
  /// if it cannot be opened.
  pub fn open(options: &OfflineStoreOptions<'_>) -> Result<Self> {
    let backend: Box<dyn StorageBackend> = if options.force_fallback {
      Box::new(KvBackend::new(Arc::new(FileKvStore::open(
        options.fallback_path,
      )?)))
    } else {
      match SqliteBackend::open(options.database_path) {
        Ok(db) => Box::new(db),
        Err(e) => {
          tracing::warn!(error = %e, "Structured storage unavailable, using key/value fallback");
          Box::new(KvBackend::new(Arc::new(FileKvStore::open(
            options.fallback_path,
          )?)))
        }
      }
    };

    let store = Self::new(backend).with_default_ttl(options.default_ttl);
    store.init()?;
    Ok(store)
  }

  /// Wrap `backend` without loading anything; call [`init`](Self::init) next.
  pub fn new(backend: Box<dyn StorageBackend>) -> Self {
    Self {
      backend,
      queue: Mutex::new(Vec::new()),
      clock: clock::system(),
      notifier: Arc::new(TracingNotifier),
      default_ttl: FetchOptions::default().ttl,
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Load the persisted queue into memory.
  pub fn init(&self) -> Result<()> {
    let ops = self.backend.load_operations()?;
    tracing::debug!(
      backend = %self.backend.kind(),
      pending = ops.len(),
      "Offline store initialized"
    );
    *self.queue() = ops;
    Ok(())
  }

  /// Forget the in-memory queue. Persisted data is untouched.
  pub fn dispose(&self) {
    self.queue().clear();
  }

  pub fn backend_kind(&self) -> BackendKind {
    self.backend.kind()
  }

  fn queue(&self) -> MutexGuard<'_, Vec<SyncOperation>> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }

  // ==========================================================================
  // Cached documents
  // ==========================================================================

  /// Cache `value` under `key`. `None` uses the store's default TTL.
  pub fn set<T: CacheValue>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    let value = match serde_json::to_value(value) {
      Ok(v) => v,
      Err(e) => {
        tracing::warn!(key, error = %e, "Value cannot be cached offline");
        return;
      }
    };
    let now = self.clock.now();
    let ttl = ttl.unwrap_or(self.default_ttl);
    let entry = CacheEntry::new(key, value, now, Some(clock::expiry_after(now, ttl)));
    if let Err(e) = self.backend.put_entry(&entry) {
      tracing::warn!(key, error = %e, "Offline cache write failed");
    }
  }

  /// Live value for `key`. Expired entries are deleted and read as misses.
  pub fn get<T: CacheValue>(&self, key: &str) -> Option<T> {
    let entry = self.lookup(key)?;
    if entry.is_expired(self.clock.now()) {
      self.delete(key);
      return None;
    }
    self.decode(entry).map(|(value, _)| value)
  }

  /// Raw entry regardless of expiry. Unreadable entries are deleted.
  fn lookup(&self, key: &str) -> Option<StoredEntry> {
    match self.backend.get_entry(key) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(key, error = %e, "Offline cache read failed");
        self.delete(key);
        None
      }
    }
  }

  fn decode<T: CacheValue>(&self, entry: StoredEntry) -> Option<(T, DateTime<Utc>)> {
    match serde_json::from_value(entry.value) {
      Ok(value) => Some((value, entry.created_at)),
      Err(e) => {
        tracing::debug!(key = %entry.key, error = %e, "Offline entry has unexpected shape");
        None
      }
    }
  }

  pub fn delete(&self, key: &str) {
    if let Err(e) = self.backend.delete_entry(key) {
      tracing::warn!(key, error = %e, "Offline cache delete failed");
    }
  }

  /// Remove every cached document. The sync queue is kept.
  pub fn clear(&self) {
    if let Err(e) = self.backend.clear_entries() {
      tracing::warn!(error = %e, "Offline cache clear failed");
    }
  }

  /// Delete entries past their expiry. Returns how many were removed.
  pub fn cleanup_expired(&self) -> usize {
    let keys = match self.backend.expired_keys(self.clock.now()) {
      Ok(keys) => keys,
      Err(e) => {
        tracing::warn!(error = %e, "Failed to list expired offline entries");
        return 0;
      }
    };
    for key in &keys {
      self.delete(key);
    }
    if !keys.is_empty() {
      tracing::debug!(removed = keys.len(), "Cleaned up expired offline entries");
    }
    keys.len()
  }

  // ==========================================================================
  // Sync queue
  // ==========================================================================

  // Queue mutations hold the queue lock until the backend write returns, so
  // the persisted queue applies them in the same order as the in-memory one.

  /// Stamp and enqueue a mutation, then persist it.
  ///
  /// The operation stays queued in memory even if persisting fails.
  pub fn add_sync_operation(&self, new_op: NewSyncOperation) -> SyncOperation {
    let op = new_op.into_operation(self.clock.now());
    {
      let mut queue = self.queue();
      queue.push(op.clone());
      if let Err(e) = self.backend.put_operation(&op) {
        tracing::warn!(id = %op.id, error = %e, "Failed to persist sync operation");
      }
    }
    tracing::debug!(id = %op.id, collection = %op.collection, "Queued sync operation");
    op
  }

  /// Snapshot of the queue in insertion order.
  pub fn get_pending_operations(&self) -> Vec<SyncOperation> {
    self.queue().clone()
  }

  /// Remove an operation after it was replayed. Unknown ids are ignored.
  pub fn remove_sync_operation(&self, id: &str) {
    let mut queue = self.queue();
    let before = queue.len();
    queue.retain(|op| op.id != id);
    if queue.len() == before {
      return;
    }
    if let Err(e) = self.backend.delete_operation(id) {
      tracing::warn!(id, error = %e, "Failed to delete persisted sync operation");
    }
  }

  /// Bump an operation's retry count. Returns the new count, or `None` if
  /// the id is not queued.
  pub fn increment_retry_count(&self, id: &str) -> Option<u32> {
    let mut queue = self.queue();
    let op = queue.iter_mut().find(|op| op.id == id)?;
    op.retry_count = op.retry_count.saturating_add(1);
    if let Err(e) = self.backend.put_operation(op) {
      tracing::warn!(id, error = %e, "Failed to persist retry count");
    }
    Some(op.retry_count)
  }

  pub fn get_stats(&self) -> OfflineStats {
    let (cache_entries, entry_bytes) = self.backend.entry_stats().unwrap_or_else(|e| {
      tracing::warn!(error = %e, "Failed to compute offline cache stats");
      (0, 0)
    });
    let queue = self.queue();
    let op_bytes: u64 = queue
      .iter()
      .map(|op| serde_json::to_string(op).map(|s| s.len() as u64).unwrap_or(0))
      .sum();

    OfflineStats {
      cache_entries,
      pending_operations: queue.len(),
      estimated_bytes: entry_bytes + op_bytes,
    }
  }

  // ==========================================================================
  // Fetch helper
  // ==========================================================================

  /// Cache-first fetch with stale fallback.
  ///
  /// 1. Unless `force_refresh`, return a live cache hit
  /// 2. Otherwise call `fetch_fn` and cache its result for `ttl`
  /// 3. If that fails and `fallback_to_cache`, return any cached value,
  ///    expired or not
  /// 4. Otherwise fail with a `network` error
  pub async fn fetch_with_cache<T, E, F, Fut>(
    &self,
    key: &str,
    fetch_fn: F,
    options: &FetchOptions,
  ) -> Result<CacheResult<T>, AppError>
  where
    T: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<AppError>,
  {
    let cached = self.lookup(key);

    if !options.force_refresh {
      if let Some(entry) = cached.as_ref().filter(|e| !e.is_expired(self.clock.now())) {
        if let Some((value, cached_at)) = self.decode(entry.clone()) {
          return Ok(CacheResult::from_cache(value, cached_at));
        }
      }
    }

    match fetch_fn().await {
      Ok(data) => {
        self.set(key, &data, Some(options.ttl));
        Ok(CacheResult::from_network(data))
      }
      Err(e) => {
        let error = create_error_from_unknown(e, [("cache_key", key)]);
        if options.fallback_to_cache {
          if let Some((value, cached_at)) = cached.and_then(|entry| self.decode(entry)) {
            tracing::warn!(key, error = %error, "Fetch failed, serving cached data");
            self.notifier.notify(&Notice::Degraded {
              key: key.to_string(),
              reason: error.message.clone(),
            });
            return Ok(CacheResult::fallback(value, cached_at));
          }
        }
        Err(
          AppError::network(format!(
            "Failed to fetch '{}' and no cached version is available",
            key
          ))
          .with_details(error.to_string())
          .with_context("cache_key", key)
          .with_context("cause_kind", error.kind.as_str()),
        )
      }
    }
  }

  /// Convenience wrapper returning only the data.
  pub async fn fetch_data<T, E, F, Fut>(
    &self,
    key: &str,
    fetch_fn: F,
    options: &FetchOptions,
  ) -> Result<T, AppError>
  where
    T: CacheValue,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<AppError>,
  {
    self
      .fetch_with_cache(key, fetch_fn, options)
      .await
      .map(|r| r.data)
  }

  /// Raw JSON for `key` if live, for inspection tools.
  pub fn get_raw(&self, key: &str) -> Option<Value> {
    self.get::<Value>(key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryKvStore};
  use crate::clock::ManualClock;
  use crate::error::ErrorKind;
  use crate::offline::sync::SyncOperationType;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::mpsc;
  use tempfile::tempdir;

  #[derive(Default)]
  struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
  }

  impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &Notice) {
      self.notices.lock().unwrap().push(notice.clone());
    }
  }

  /// Pauses the first `put_operation` after [`Gate::arm`] until released.
  #[derive(Default)]
  struct Gate {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
  }

  impl Gate {
    fn arm(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
      let (entered_tx, entered_rx) = mpsc::channel();
      let (release_tx, release_rx) = mpsc::channel();
      *self.entered.lock().unwrap() = Some(entered_tx);
      *self.release.lock().unwrap() = Some(release_rx);
      (entered_rx, release_tx)
    }

    fn pass(&self) {
      let Some(entered) = self.entered.lock().unwrap().take() else {
        return;
      };
      entered.send(()).unwrap();
      let release = self.release.lock().unwrap().take();
      if let Some(release) = release {
        release.recv().unwrap();
      }
    }
  }

  struct GatedBackend {
    inner: KvBackend,
    gate: Arc<Gate>,
  }

  impl StorageBackend for GatedBackend {
    fn kind(&self) -> BackendKind {
      self.inner.kind()
    }
    fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>> {
      self.inner.get_entry(key)
    }
    fn put_entry(&self, entry: &StoredEntry) -> Result<()> {
      self.inner.put_entry(entry)
    }
    fn delete_entry(&self, key: &str) -> Result<()> {
      self.inner.delete_entry(key)
    }
    fn clear_entries(&self) -> Result<()> {
      self.inner.clear_entries()
    }
    fn expired_keys(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
      self.inner.expired_keys(now)
    }
    fn entry_stats(&self) -> Result<(usize, u64)> {
      self.inner.entry_stats()
    }
    fn load_operations(&self) -> Result<Vec<SyncOperation>> {
      self.inner.load_operations()
    }
    fn put_operation(&self, op: &SyncOperation) -> Result<()> {
      self.gate.pass();
      self.inner.put_operation(op)
    }
    fn delete_operation(&self, id: &str) -> Result<()> {
      self.inner.delete_operation(id)
    }
  }

  fn sqlite_store() -> (OfflineStore, ManualClock) {
    let clock = ManualClock::starting_now();
    let store = OfflineStore::new(Box::new(SqliteBackend::open_in_memory().unwrap()))
      .with_clock(Arc::new(clock.clone()));
    store.init().unwrap();
    (store, clock)
  }

  fn kv_store() -> (OfflineStore, ManualClock) {
    let clock = ManualClock::starting_now();
    let backend = KvBackend::new(Arc::new(MemoryKvStore::new()));
    let store = OfflineStore::new(Box::new(backend)).with_clock(Arc::new(clock.clone()));
    store.init().unwrap();
    (store, clock)
  }

  #[test]
  fn test_document_expiry_on_both_backends() {
    for (store, clock) in [sqlite_store(), kv_store()] {
      store.set("video:v1", &json!({"title": "Intro"}), Some(Duration::from_millis(1000)));

      clock.advance(chrono::Duration::milliseconds(500));
      assert_eq!(store.get::<Value>("video:v1"), Some(json!({"title": "Intro"})));

      clock.advance(chrono::Duration::milliseconds(1000));
      assert_eq!(store.get::<Value>("video:v1"), None);
      assert_eq!(store.get_stats().cache_entries, 0);
    }
  }

  #[test]
  fn test_queue_is_fifo_and_removal_preserves_order() {
    for (store, _) in [sqlite_store(), kv_store()] {
      let o1 = store.add_sync_operation(NewSyncOperation::create("videos", json!({"n": 1})));
      let o2 = store.add_sync_operation(NewSyncOperation::update("videos", json!({"n": 2})));
      let o3 = store.add_sync_operation(NewSyncOperation::delete("videos", json!({"n": 3})));

      let ids: Vec<_> = store.get_pending_operations().into_iter().map(|o| o.id).collect();
      assert_eq!(ids, vec![o1.id.clone(), o2.id.clone(), o3.id.clone()]);

      store.remove_sync_operation(&o2.id);
      let ids: Vec<_> = store.get_pending_operations().into_iter().map(|o| o.id).collect();
      assert_eq!(ids, vec![o1.id, o3.id]);
    }
  }

  #[test]
  fn test_same_collection_ops_get_distinct_ids() {
    let (store, _) = sqlite_store();
    let a = store.add_sync_operation(NewSyncOperation::create("comments", json!({})));
    let b = store.add_sync_operation(NewSyncOperation::create("comments", json!({})));

    assert_ne!(a.id, b.id);
    assert_eq!(a.op_type, SyncOperationType::Create);
    assert_eq!(store.get_pending_operations(), vec![a, b]);
  }

  #[test]
  fn test_removal_is_idempotent() {
    let (store, _) = kv_store();
    let op = store.add_sync_operation(NewSyncOperation::create("videos", json!({})));

    store.remove_sync_operation(&op.id);
    store.remove_sync_operation(&op.id);
    store.remove_sync_operation("never-existed");
    assert!(store.get_pending_operations().is_empty());
  }

  #[test]
  fn test_pending_operations_is_a_copy() {
    let (store, _) = kv_store();
    store.add_sync_operation(NewSyncOperation::create("videos", json!({})));

    let mut snapshot = store.get_pending_operations();
    snapshot.clear();
    assert_eq!(store.get_pending_operations().len(), 1);
  }

  #[test]
  fn test_retry_count_increments_and_persists() {
    let backend = Arc::new(MemoryKvStore::new());
    let store = OfflineStore::new(Box::new(KvBackend::new(backend.clone())));
    store.init().unwrap();
    let op = store.add_sync_operation(NewSyncOperation::update("videos", json!({})));

    assert_eq!(store.increment_retry_count(&op.id), Some(1));
    assert_eq!(store.increment_retry_count(&op.id), Some(2));
    assert_eq!(store.increment_retry_count("unknown"), None);

    let reopened = OfflineStore::new(Box::new(KvBackend::new(backend)));
    reopened.init().unwrap();
    assert_eq!(reopened.get_pending_operations()[0].retry_count, 2);
  }

  #[test]
  fn test_removal_during_retry_write_stays_removed() {
    let kv = Arc::new(MemoryKvStore::new());
    let gate = Arc::new(Gate::default());
    let store = OfflineStore::new(Box::new(GatedBackend {
      inner: KvBackend::new(kv.clone()),
      gate: gate.clone(),
    }));
    store.init().unwrap();
    let op = store.add_sync_operation(NewSyncOperation::update("videos", json!({})));

    let (entered, release) = gate.arm();
    std::thread::scope(|s| {
      let retry = s.spawn(|| store.increment_retry_count(&op.id));
      entered.recv().unwrap();
      let remove = s.spawn(|| store.remove_sync_operation(&op.id));
      std::thread::sleep(std::time::Duration::from_millis(50));
      release.send(()).unwrap();
      assert_eq!(retry.join().unwrap(), Some(1));
      remove.join().unwrap();
    });

    assert!(store.get_pending_operations().is_empty());
    let reopened = OfflineStore::new(Box::new(KvBackend::new(kv)));
    reopened.init().unwrap();
    assert!(reopened.get_pending_operations().is_empty());
  }

  #[test]
  fn test_queue_survives_reopen_on_disk() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("offline.db");
    let fallback_path = dir.path().join("offline-kv.json");
    let options = OfflineStoreOptions {
      database_path: &db_path,
      fallback_path: &fallback_path,
      force_fallback: false,
      default_ttl: Duration::from_secs(60),
    };

    let first = {
      let store = OfflineStore::open(&options).unwrap();
      assert_eq!(store.backend_kind(), BackendKind::Structured);
      store.add_sync_operation(NewSyncOperation::create("videos", json!({"title": "A"})))
    };

    let store = OfflineStore::open(&options).unwrap();
    let pending = store.get_pending_operations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[0].data, first.data);
    assert_eq!(
      pending[0].created_at.timestamp_millis(),
      first.created_at.timestamp_millis()
    );
    store.dispose();
    assert!(store.get_pending_operations().is_empty());
  }

  #[test]
  fn test_forced_fallback_uses_key_value_backend() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("unused.db");
    let fallback_path = dir.path().join("offline-kv.json");
    let options = OfflineStoreOptions {
      database_path: &db_path,
      fallback_path: &fallback_path,
      force_fallback: true,
      default_ttl: Duration::from_secs(60),
    };

    let store = OfflineStore::open(&options).unwrap();
    assert_eq!(store.backend_kind(), BackendKind::KeyValue);
    store.set("k", &"v".to_string(), None);
    assert_eq!(store.get::<String>("k").as_deref(), Some("v"));
    assert!(!db_path.exists());
  }

  #[test]
  fn test_cleanup_expired_only_removes_expired() {
    let (store, clock) = sqlite_store();
    store.set("short", &1, Some(Duration::from_secs(1)));
    store.set("long", &2, Some(Duration::from_secs(100)));

    clock.advance(chrono::Duration::seconds(5));
    assert_eq!(store.cleanup_expired(), 1);
    assert_eq!(store.get::<i32>("long"), Some(2));
  }

  #[test]
  fn test_stats_reports_counts_and_size() {
    let (store, _) = kv_store();
    store.set("a", &json!({"x": 1}), None);
    store.add_sync_operation(NewSyncOperation::create("videos", json!({})));

    let stats = store.get_stats();
    assert_eq!(stats.cache_entries, 1);
    assert_eq!(stats.pending_operations, 1);
    assert!(stats.estimated_bytes > 0);
  }

  #[tokio::test]
  async fn test_fetch_with_cache_prefers_live_entry() {
    let (store, _) = sqlite_store();
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let fetch = move || async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok::<_, AppError>(json!(["v1", "v2"]))
    };

    let first = store
      .fetch_with_cache("feed", fetch, &FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = store
      .fetch_with_cache("feed", fetch, &FetchOptions::default())
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, json!(["v1", "v2"]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_force_refresh_bypasses_cache() {
    let (store, _) = kv_store();
    store.set("feed", &json!("old"), None);

    let options = FetchOptions {
      force_refresh: true,
      ..FetchOptions::default()
    };
    let result = store
      .fetch_with_cache("feed", || async { Ok::<_, AppError>(json!("new")) }, &options)
      .await
      .unwrap();

    assert_eq!(result.data, json!("new"));
    assert_eq!(store.get::<Value>("feed"), Some(json!("new")));
  }

  #[tokio::test]
  async fn test_failed_fetch_falls_back_to_previous_value() {
    let (store, _) = sqlite_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let store = store.with_notifier(notifier.clone());

    store
      .fetch_with_cache("k", || async { Ok::<_, AppError>(7u32) }, &FetchOptions::default())
      .await
      .unwrap();

    let options = FetchOptions {
      force_refresh: true,
      ..FetchOptions::default()
    };
    let result = store
      .fetch_with_cache(
        "k",
        || async { Err::<u32, _>(AppError::network("offline")) },
        &options,
      )
      .await
      .unwrap();

    assert_eq!(result.data, 7);
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(notifier.notices.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_expired_entry_is_last_resort() {
    let (store, clock) = kv_store();
    store.set("k", &"stale".to_string(), Some(Duration::from_secs(1)));
    clock.advance(chrono::Duration::seconds(10));

    let result = store
      .fetch_with_cache(
        "k",
        || async { Err::<String, _>(color_eyre::eyre::eyre!("timeout")) },
        &FetchOptions::default(),
      )
      .await
      .unwrap();

    assert_eq!(result.data, "stale");
    assert_eq!(result.source, CacheSource::CacheStale);
  }

  #[tokio::test]
  async fn test_no_cache_and_failed_fetch_is_network_error() {
    let (store, _) = kv_store();
    let err = store
      .fetch_with_cache(
        "k",
        || async { Err::<String, _>(AppError::server("500")) },
        &FetchOptions::default(),
      )
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Network);
    assert!(err.message.contains("no cached version is available"));
  }

  #[tokio::test]
  async fn test_fallback_disabled_raises_even_with_cache() {
    let (store, _) = kv_store();
    store.set("k", &1, None);

    let options = FetchOptions {
      force_refresh: true,
      fallback_to_cache: false,
      ..FetchOptions::default()
    };
    let result = store
      .fetch_with_cache("k", || async { Err::<i32, _>(AppError::network("down")) }, &options)
      .await;
    assert!(result.is_err());
  }
}
