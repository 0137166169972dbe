use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reelcache::config::Config;
use reelcache::offline::{NewSyncOperation, OfflineStore, OfflineStoreOptions, SyncOperationType};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "reelcache")]
#[command(about = "Inspect and maintain the on-device offline cache and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/reelcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Entry and queue counts
  Stats,
  /// List pending sync operations in replay order
  Pending,
  /// Drop expired cache entries
  Cleanup,
  /// Print a live cached document
  Get { key: String },
  /// Cache a JSON document
  Put {
    key: String,
    json: String,
    #[arg(long)]
    ttl_secs: Option<u64>,
  },
  /// Queue a mutation for later replay
  Enqueue {
    /// create, update or delete
    op_type: SyncOperationType,
    collection: String,
    json: String,
  },
  /// Remove a sync operation from the queue
  Remove { id: String },
  /// Bump the retry counter of a sync operation
  Retry { id: String },
}

fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;

  let appender = tracing_appender::rolling::never(data_dir, "reelcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON document: {}", e))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _guard = init_tracing(&data_dir)?;

  let database_path = config.database_path()?;
  let fallback_path = config.fallback_path()?;
  let store = OfflineStore::open(&OfflineStoreOptions {
    database_path: &database_path,
    fallback_path: &fallback_path,
    force_fallback: config.storage.force_fallback,
    default_ttl: Duration::from_secs(config.cache.offline_ttl_secs),
  })?;
  tracing::info!(backend = %store.backend_kind(), "Offline store ready");

  let result = run(&config, &store, args.command);
  store.dispose();
  result
}

fn run(config: &Config, store: &OfflineStore, command: Command) -> Result<()> {
  match command {
    Command::Stats => {
      let response_cache = config.persistent_cache()?;
      print_json(&json!({
        "backend": store.backend_kind().to_string(),
        "offline": store.get_stats(),
        "responseCacheEntries": response_cache.size(),
      }))
    }
    Command::Pending => print_json(&store.get_pending_operations()),
    Command::Cleanup => {
      let offline = store.cleanup_expired();
      let response = config.persistent_cache()?.cleanup_expired();
      print_json(&json!({ "offline": offline, "responseCache": response }))
    }
    Command::Get { key } => match store.get_raw(&key) {
      Some(value) => print_json(&value),
      None => Err(eyre!("No live entry for '{}'", key)),
    },
    Command::Put {
      key,
      json,
      ttl_secs,
    } => {
      let value = parse_json(&json)?;
      store.set(&key, &value, ttl_secs.map(Duration::from_secs));
      Ok(())
    }
    Command::Enqueue {
      op_type,
      collection,
      json,
    } => {
      let data = parse_json(&json)?;
      let op = store.add_sync_operation(NewSyncOperation::new(op_type, collection, data));
      print_json(&op)
    }
    Command::Remove { id } => {
      store.remove_sync_operation(&id);
      Ok(())
    }
    Command::Retry { id } => match store.increment_retry_count(&id) {
      Some(count) => print_json(&json!({ "id": id, "retryCount": count })),
      None => Err(eyre!("No pending operation with id '{}'", id)),
    },
  }
}

