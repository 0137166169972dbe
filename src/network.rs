//! Connectivity signals and the notification sink.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::ErrorKind;

/// Snapshot of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
  pub online: bool,
  /// Connected, but on a link the host considers slow
  pub slow: bool,
}

impl Default for NetworkState {
  fn default() -> Self {
    Self {
      online: true,
      slow: false,
    }
  }
}

/// Shared connectivity status.
///
/// The hosting application feeds transitions in with [`set_online`]; any
/// number of tasks can read the current state or await the next change.
///
/// [`set_online`]: NetworkStatus::set_online
#[derive(Debug, Clone)]
pub struct NetworkStatus {
  tx: Arc<watch::Sender<NetworkState>>,
}

impl Default for NetworkStatus {
  fn default() -> Self {
    Self::new(NetworkState::default())
  }
}

impl NetworkStatus {
  pub fn new(initial: NetworkState) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn offline() -> Self {
    Self::new(NetworkState {
      online: false,
      slow: false,
    })
  }

  pub fn state(&self) -> NetworkState {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state().online
  }

  pub fn is_slow(&self) -> bool {
    self.state().slow
  }

  /// Record a connectivity transition. No-op if nothing changed.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|state| {
      if state.online == online {
        return false;
      }
      state.online = online;
      true
    });
    tracing::debug!(online, "Network status changed");
  }

  pub fn set_slow(&self, slow: bool) {
    self.tx.send_if_modified(|state| {
      if state.slow == slow {
        return false;
      }
      state.slow = slow;
      true
    });
  }

  /// Receiver for every subsequent state change.
  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.tx.subscribe()
  }

  /// Wait until the link is up or `timeout` elapses.
  ///
  /// Returns `true` if online when this returns. Dropping the future cancels
  /// the wait.
  pub async fn wait_until_online(&self, timeout: Duration) -> bool {
    let mut rx = self.subscribe();
    if rx.borrow().online {
      return true;
    }
    let woke = matches!(
      tokio::time::timeout(timeout, rx.wait_for(|s| s.online)).await,
      Ok(Ok(_))
    );
    woke || self.is_online()
  }
}

/// Something worth telling the user or the log about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
  Offline,
  Online,
  /// A retry is about to happen
  Retrying {
    attempt: u32,
    kind: ErrorKind,
    message: String,
  },
  /// Serving degraded data, e.g. a stale cache entry
  Degraded { key: String, reason: String },
}

/// Side-effect sink for [`Notice`]s. Must never block or fail.
pub trait Notifier: Send + Sync {
  fn notify(&self, notice: &Notice);
}

/// Notifier that writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn notify(&self, notice: &Notice) {
    match notice {
      Notice::Offline => tracing::warn!("Connection lost, working offline"),
      Notice::Online => tracing::info!("Connection restored"),
      Notice::Retrying {
        attempt,
        kind,
        message,
      } => tracing::info!(attempt, %kind, "Retrying after failure: {}", message),
      Notice::Degraded { key, reason } => {
        tracing::warn!(key = %key, "Serving cached data: {}", reason)
      }
    }
  }
}
