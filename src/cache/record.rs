//! Cache record types shared by the store and the manager.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Refresh state of a cluster record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
  Ok,
  /// A refresh holds the cooperative lock
  Refreshing,
  /// Failures crossed the threshold; retried only after backoff
  Error,
}

impl RecordStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Ok => "ok",
      Self::Refreshing => "refreshing",
      Self::Error => "error",
    }
  }
}

impl fmt::Display for RecordStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RecordStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ok" => Ok(Self::Ok),
      "refreshing" => Ok(Self::Refreshing),
      "error" => Ok(Self::Error),
      other => Err(format!("unknown record status '{}'", other)),
    }
  }
}

/// One persisted record per cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheRecord {
  pub cluster_key: String,
  /// Members the payload was fetched for, in order
  pub member_names: Vec<String>,
  /// Last successfully fetched items, serialized
  pub payload: Option<serde_json::Value>,
  /// SHA-256 of the payload JSON
  pub payload_digest: Option<String>,
  pub fetched_at: Option<DateTime<Utc>>,
  /// Informational only; staleness is recomputed from `fetched_at`
  pub expires_at: Option<DateTime<Utc>>,
  pub status: RecordStatus,
  pub last_error: Option<String>,
  pub error_count: u32,
  /// No automatic refresh before this instant
  pub retry_after: Option<DateTime<Utc>>,
  /// Start of the current `refreshing` lease
  pub refreshing_since: Option<DateTime<Utc>>,
  pub updated_at: DateTime<Utc>,
}

impl CacheRecord {
  /// Whether the payload is older than `ttl`, ignoring status.
  pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
    match self.fetched_at {
      Some(fetched_at) => now - fetched_at > ttl,
      None => true,
    }
  }
}

/// Partial update applied through `CacheStore::upsert`.
///
/// `None` leaves a column untouched. Nullable columns take `Some(None)` to clear.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
  pub member_names: Option<Vec<String>>,
  pub payload: Option<serde_json::Value>,
  pub payload_digest: Option<String>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
  pub status: Option<RecordStatus>,
  pub last_error: Option<Option<String>>,
  pub error_count: Option<u32>,
  pub retry_after: Option<Option<DateTime<Utc>>>,
  pub refreshing_since: Option<Option<DateTime<Utc>>>,
}

/// Failure bookkeeping applied atomically through `CacheStore::record_failure`.
#[derive(Debug, Clone)]
pub struct FailureUpdate {
  pub message: String,
  /// `error_count` at or above this marks the record `error`
  pub threshold: u32,
  /// Mark `error` regardless of the count
  pub force_error: bool,
  /// Applied once the record enters `error`
  pub backoff_until: DateTime<Utc>,
  /// Upstream-provided earliest retry, applied regardless of status
  pub not_before: Option<DateTime<Utc>>,
  pub now: DateTime<Utc>,
}
