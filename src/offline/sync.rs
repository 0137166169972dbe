//! Pending mutations awaiting replay against the remote store.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperationType {
  Create,
  Update,
  Delete,
}

impl SyncOperationType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for SyncOperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncOperationType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(format!("unknown operation type '{}'", other)),
    }
  }
}

/// A queued mutation. Only `retry_count` ever changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
  pub id: String,
  #[serde(rename = "type")]
  pub op_type: SyncOperationType,
  pub collection: String,
  pub data: Value,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// The caller-supplied part of a [`SyncOperation`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncOperation {
  pub op_type: SyncOperationType,
  pub collection: String,
  pub data: Value,
}

impl NewSyncOperation {
  pub fn new(op_type: SyncOperationType, collection: impl Into<String>, data: Value) -> Self {
    Self {
      op_type,
      collection: collection.into(),
      data,
    }
  }

  pub fn create(collection: impl Into<String>, data: Value) -> Self {
    Self::new(SyncOperationType::Create, collection, data)
  }

  pub fn update(collection: impl Into<String>, data: Value) -> Self {
    Self::new(SyncOperationType::Update, collection, data)
  }

  pub fn delete(collection: impl Into<String>, data: Value) -> Self {
    Self::new(SyncOperationType::Delete, collection, data)
  }

  /// Stamp id, creation time and a zero retry count.
  pub(crate) fn into_operation(self, now: DateTime<Utc>) -> SyncOperation {
    SyncOperation {
      id: operation_id(self.op_type, &self.collection, now),
      op_type: self.op_type,
      collection: self.collection,
      data: self.data,
      created_at: now,
      retry_count: 0,
    }
  }
}

/// `{type}_{collection}_{millis}_{9 random chars}`
pub(crate) fn operation_id(op_type: SyncOperationType, collection: &str, now: DateTime<Utc>) -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(9)
    .map(|c| char::from(c).to_ascii_lowercase())
    .collect();
  format!(
    "{}_{}_{}_{}",
    op_type,
    collection,
    now.timestamp_millis(),
    suffix
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_ids_differ_within_same_millisecond() {
    let now = Utc::now();
    let a = operation_id(SyncOperationType::Create, "videos", now);
    let b = operation_id(SyncOperationType::Create, "videos", now);

    assert_ne!(a, b);
    assert!(a.starts_with(&format!("create_videos_{}_", now.timestamp_millis())));
  }

  #[test]
  fn test_new_operation_starts_at_zero_retries() {
    let now = Utc::now();
    let op = NewSyncOperation::update("comments", json!({"id": "c1"})).into_operation(now);
    assert_eq!(op.retry_count, 0);
    assert_eq!(op.created_at, now);
    assert_eq!(op.op_type, SyncOperationType::Update);
  }

  #[test]
  fn test_serialized_shape_uses_type_field() {
    let op = NewSyncOperation::delete("videos", json!({"id": "v9"})).into_operation(Utc::now());
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json["type"], "delete");
    assert_eq!(json["retryCount"], 0);
  }

  #[test]
  fn test_parse_operation_type() {
    assert_eq!("Create".parse::<SyncOperationType>(), Ok(SyncOperationType::Create));
    assert!("upsert".parse::<SyncOperationType>().is_err());
  }
}
