//! Error taxonomy shared by every component.
//!
//! Any failure crossing a resilience boundary is normalized into an
//! [`AppError`]. The [`ErrorKind`] decides the default severity and whether a
//! retry is worthwhile; callers may escalate either afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Network,
  Authentication,
  Authorization,
  Validation,
  NotFound,
  Timeout,
  RateLimit,
  Server,
  Client,
  VideoLoad,
  VideoPlayback,
  Datastore,
  Storage,
  Unknown,
}

impl ErrorKind {
  pub const ALL: [ErrorKind; 14] = [
    ErrorKind::Network,
    ErrorKind::Authentication,
    ErrorKind::Authorization,
    ErrorKind::Validation,
    ErrorKind::NotFound,
    ErrorKind::Timeout,
    ErrorKind::RateLimit,
    ErrorKind::Server,
    ErrorKind::Client,
    ErrorKind::VideoLoad,
    ErrorKind::VideoPlayback,
    ErrorKind::Datastore,
    ErrorKind::Storage,
    ErrorKind::Unknown,
  ];

  /// Whether errors of this kind are worth retrying unless told otherwise.
  pub fn default_retryable(self) -> bool {
    matches!(
      self,
      ErrorKind::Network
        | ErrorKind::Timeout
        | ErrorKind::VideoLoad
        | ErrorKind::VideoPlayback
        | ErrorKind::Datastore
        | ErrorKind::RateLimit
    )
  }

  /// Severity before any caller escalation. Never `Critical`.
  pub fn default_severity(self) -> Severity {
    match self {
      ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Storage => Severity::Low,
      ErrorKind::Network
      | ErrorKind::Timeout
      | ErrorKind::Datastore
      | ErrorKind::RateLimit
      | ErrorKind::Client
      | ErrorKind::VideoLoad
      | ErrorKind::VideoPlayback
      | ErrorKind::Unknown => Severity::Medium,
      ErrorKind::Authentication | ErrorKind::Authorization | ErrorKind::Server => Severity::High,
    }
  }

  /// Classify an HTTP status code. Returns `None` for non-error statuses.
  pub fn from_http_status(status: u16) -> Option<Self> {
    let kind = match status {
      400 | 422 => ErrorKind::Validation,
      401 => ErrorKind::Authentication,
      403 => ErrorKind::Authorization,
      404 => ErrorKind::NotFound,
      408 => ErrorKind::Timeout,
      429 => ErrorKind::RateLimit,
      400..=499 => ErrorKind::Client,
      500..=599 => ErrorKind::Server,
      _ => return None,
    };
    Some(kind)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::Network => "network",
      ErrorKind::Authentication => "authentication",
      ErrorKind::Authorization => "authorization",
      ErrorKind::Validation => "validation",
      ErrorKind::NotFound => "not_found",
      ErrorKind::Timeout => "timeout",
      ErrorKind::RateLimit => "rate_limit",
      ErrorKind::Server => "server",
      ErrorKind::Client => "client",
      ErrorKind::VideoLoad => "video_load",
      ErrorKind::VideoPlayback => "video_playback",
      ErrorKind::Datastore => "datastore",
      ErrorKind::Storage => "storage",
      ErrorKind::Unknown => "unknown",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How loudly the UI should surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

/// A normalized failure.
///
/// Built once and then only copied forward: the `with_*` builders consume
/// the value and return a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct AppError {
  pub kind: ErrorKind,
  pub message: String,
  pub code: Option<String>,
  pub details: Option<String>,
  pub timestamp: DateTime<Utc>,
  pub retryable: bool,
  pub severity: Severity,
  pub context: BTreeMap<String, String>,
}

impl AppError {
  /// Create an error with the kind's default severity and retryability.
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      code: None,
      details: None,
      timestamp: Utc::now(),
      retryable: kind.default_retryable(),
      severity: kind.default_severity(),
      context: BTreeMap::new(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Network, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Timeout, message)
  }

  pub fn validation(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Validation, message)
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NotFound, message)
  }

  pub fn server(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Server, message)
  }

  pub fn datastore(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Datastore, message)
  }

  pub fn storage(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Storage, message)
  }

  /// Wrap an arbitrary failure as `unknown`, keeping its debug rendering.
  pub fn unknown<E: fmt::Debug + fmt::Display>(raw: E) -> Self {
    Self::new(ErrorKind::Unknown, raw.to_string()).with_details(format!("{:?}", raw))
  }

  /// Build from an HTTP status, falling back to `unknown` for non-error codes.
  pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
    let kind = ErrorKind::from_http_status(status).unwrap_or(ErrorKind::Unknown);
    Self::new(kind, message).with_code(status.to_string())
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn with_details(mut self, details: impl Into<String>) -> Self {
    self.details = Some(details.into());
    self
  }

  pub fn with_severity(mut self, severity: Severity) -> Self {
    self.severity = severity;
    self
  }

  pub fn retryable(mut self, retryable: bool) -> Self {
    self.retryable = retryable;
    self
  }

  pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.context.insert(key.into(), value.into());
    self
  }

  /// Merge a batch of context pairs; later pairs win.
  pub fn with_context_map<I, K, V>(mut self, pairs: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    for (k, v) in pairs {
      self.context.insert(k.into(), v.into());
    }
    self
  }

  /// True when the message or code mentions `needle`, case-insensitively.
  pub fn mentions(&self, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    self.message.to_lowercase().contains(&needle)
      || self
        .code
        .as_deref()
        .is_some_and(|c| c.to_lowercase().contains(&needle))
  }
}

impl From<color_eyre::Report> for AppError {
  fn from(e: color_eyre::Report) -> Self {
    AppError::unknown(e)
  }
}

impl From<std::io::Error> for AppError {
  fn from(e: std::io::Error) -> Self {
    if e.kind() == std::io::ErrorKind::TimedOut {
      return AppError::timeout(e.to_string()).with_details(format!("{:?}", e));
    }
    AppError::unknown(e)
  }
}

impl From<serde_json::Error> for AppError {
  fn from(e: serde_json::Error) -> Self {
    AppError::unknown(e)
  }
}

impl From<tokio::time::error::Elapsed> for AppError {
  fn from(e: tokio::time::error::Elapsed) -> Self {
    AppError::timeout(e.to_string())
  }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for AppError {
  fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
    AppError::unknown(e)
  }
}

impl From<String> for AppError {
  fn from(message: String) -> Self {
    AppError::new(ErrorKind::Unknown, message)
  }
}

impl From<&str> for AppError {
  fn from(message: &str) -> Self {
    AppError::new(ErrorKind::Unknown, message)
  }
}

/// Normalize any failure and attach `context`.
///
/// An `AppError` keeps its kind, message and flags; anything else becomes
/// `unknown` through its `From` impl.
pub fn create_error_from_unknown<E, I, K, V>(raw: E, context: I) -> AppError
where
  E: Into<AppError>,
  I: IntoIterator<Item = (K, V)>,
  K: Into<String>,
  V: Into<String>,
{
  raw.into().with_context_map(context)
}

/// Fixed, human-readable text for each kind.
pub fn get_user_friendly_message(error: &AppError) -> &'static str {
  match error.kind {
    ErrorKind::Network => "Unable to connect. Please check your internet connection and try again.",
    ErrorKind::Authentication => "Your session has expired. Please sign in again.",
    ErrorKind::Authorization => "You don't have permission to perform this action.",
    ErrorKind::Validation => "Some of the information provided is invalid. Please review and try again.",
    ErrorKind::NotFound => "The requested content could not be found.",
    ErrorKind::Timeout => "The request took too long. Please try again.",
    ErrorKind::RateLimit => "Too many requests. Please wait a moment and try again.",
    ErrorKind::Server => "Something went wrong on our end. Please try again later.",
    ErrorKind::Client => "The request could not be completed. Please try again.",
    ErrorKind::VideoLoad => "The video could not be loaded. Please try again.",
    ErrorKind::VideoPlayback => "Video playback was interrupted. Please try again.",
    ErrorKind::Datastore => "We're having trouble reaching our servers. Your changes will sync when possible.",
    ErrorKind::Storage => "Local storage is full or unavailable. Some data may not be saved offline.",
    ErrorKind::Unknown => "An unexpected error occurred. Please try again.",
  }
}

pub fn is_retryable_error(error: &AppError) -> bool {
  error.retryable
}

pub fn get_error_severity(error: &AppError) -> Severity {
  error.severity
}

/// Emit a log event at a level matching the error's severity.
pub fn log_error(error: &AppError) {
  match error.severity {
    Severity::Low => tracing::debug!(
      kind = %error.kind,
      code = ?error.code,
      context = ?error.context,
      "{}",
      error.message
    ),
    Severity::Medium => tracing::warn!(
      kind = %error.kind,
      code = ?error.code,
      context = ?error.context,
      "{}",
      error.message
    ),
    Severity::High | Severity::Critical => tracing::error!(
      kind = %error.kind,
      severity = ?error.severity,
      code = ?error.code,
      details = ?error.details,
      context = ?error.context,
      "{}",
      error.message
    ),
  }
}
