//! Offline document cache and durable sync queue.
//!
//! Mutations made while offline are appended to the queue and replayed by an
//! external drain routine, which reads [`OfflineStore::get_pending_operations`]
//! and reports back with `remove_sync_operation` or `increment_retry_count`.
//! The store orders the queue but does not serialize replay; a drain routine
//! must not run concurrently with itself.

mod backend;
mod sqlite;
mod store;
mod sync;

pub use backend::{BackendKind, KvBackend, StorageBackend, StoredEntry};
pub use sqlite::SqliteBackend;
pub use store::{FetchOptions, OfflineStats, OfflineStore, OfflineStoreOptions};
pub use sync::{NewSyncOperation, SyncOperation, SyncOperationType};
