use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{FileKvStore, MemoryCache, PersistentCache, SmartCache, SmartCacheOptions};
use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryOptions};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub circuit_breaker: BreakerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Directory for the offline database, fallback store and logs
  /// (defaults to $XDG_DATA_HOME/reelcache)
  pub data_dir: Option<PathBuf>,
  /// Use the flat key/value store even if SQLite is available
  pub force_fallback: bool,
  /// Byte quota for the flat key/value store
  pub quota_bytes: Option<usize>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      data_dir: None,
      force_fallback: false,
      quota_bytes: Some(5 * 1024 * 1024),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub memory_ttl_secs: u64,
  pub storage_ttl_secs: u64,
  /// TTL for offline documents when the caller gives none
  pub offline_ttl_secs: u64,
  /// Namespace of the persistent cache; stored keys are `<namespace>:<key>`
  pub namespace: String,
  /// Hex-encode persisted payloads
  pub encode: bool,
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      memory_ttl_secs: 5 * 60,
      storage_ttl_secs: 24 * 60 * 60,
      offline_ttl_secs: 30 * 60,
      namespace: "reelcache".to_string(),
      encode: true,
      sweep_interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub strategy: BackoffStrategy,
  pub jitter: bool,
  pub offline_retry_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
      strategy: BackoffStrategy::Exponential,
      jitter: true,
      offline_retry_delay_ms: 5000,
    }
  }
}

impl RetryConfig {
  /// Retry options with these settings and the default retry condition.
  pub fn to_options(&self) -> RetryOptions {
    RetryOptions::new()
      .with_max_attempts(self.max_attempts)
      .with_base_delay(Duration::from_millis(self.base_delay_ms))
      .with_max_delay(Duration::from_millis(self.max_delay_ms))
      .with_strategy(self.strategy)
      .with_jitter(self.jitter)
      .with_offline_retry_delay(Duration::from_millis(self.offline_retry_delay_ms))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
  pub failure_threshold: u32,
  pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      recovery_timeout_ms: 60_000,
    }
  }
}

impl BreakerConfig {
  pub fn for_operation(&self, name: impl Into<String>) -> CircuitBreakerConfig {
    CircuitBreakerConfig::new(name)
      .with_failure_threshold(self.failure_threshold)
      .with_recovery_timeout(Duration::from_millis(self.recovery_timeout_ms))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./reelcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/reelcache/config.yaml
  ///
  /// With no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("reelcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("reelcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Resolve the data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("reelcache"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("offline.db"))
  }

  pub fn fallback_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("offline-kv.json"))
  }

  pub fn cache_store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache-kv.json"))
  }

  pub fn smart_cache_options(&self) -> SmartCacheOptions {
    SmartCacheOptions {
      memory_ttl: Duration::from_secs(self.cache.memory_ttl_secs),
      storage_ttl: Duration::from_secs(self.cache.storage_ttl_secs),
      ..SmartCacheOptions::default()
    }
  }

  /// Persistent response cache backed by the file store in the data dir.
  pub fn persistent_cache(&self) -> Result<PersistentCache> {
    let mut store = FileKvStore::open(self.cache_store_path()?)?;
    if let Some(quota) = self.storage.quota_bytes {
      store = store.with_quota(quota);
    }
    Ok(
      PersistentCache::new(Arc::new(store), self.cache.namespace.clone())
        .with_encoding(self.cache.encode),
    )
  }

  /// Full two-tier response cache.
  ///
  /// The memory sweeper only runs when called from inside a Tokio runtime.
  pub fn smart_cache(&self) -> Result<SmartCache> {
    let memory = Arc::new(MemoryCache::new());
    if tokio::runtime::Handle::try_current().is_ok() && self.cache.sweep_interval_secs > 0 {
      memory.spawn_sweeper(Duration::from_secs(self.cache.sweep_interval_secs));
    }
    Ok(SmartCache::new(memory, self.persistent_cache()?).with_defaults(self.smart_cache_options()))
  }
}
