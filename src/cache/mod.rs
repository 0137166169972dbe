//! Tiered caching for offline-tolerant reads.
//!
//! - [`MemoryCache`]: process-local TTL map, the fast tier
//! - [`PersistentCache`]: namespaced entries in a flat [`KvStore`], survives restarts
//! - [`SmartCache`]: both tiers behind one read-through/write-through facade
//!
//! Caching is best-effort: storage faults are logged and read as misses.

mod kv;
mod layer;
mod memory;
mod persistent;
mod traits;

pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use layer::{SmartCache, SmartCacheOptions, SmartCacheStats};
pub use memory::MemoryCache;
pub use persistent::PersistentCache;
pub use traits::{CacheEntry, CacheResult, CacheSource, CacheValue, ENTRY_VERSION};
