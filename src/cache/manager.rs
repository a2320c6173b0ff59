//! Freshness policy and all record mutation sequencing.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::record::{CacheRecord, FailureUpdate, RecordStatus, RecordUpdate};
use super::storage::CacheStore;
use crate::config::CacheSettings;
use crate::github::{FetchError, RepoItem};

/// Outcome of a freshness check on an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  Fresh,
  /// Old enough to refresh, and nothing prevents it
  Stale,
  /// A refresh holds an unexpired lease
  Refreshing,
  /// Automatic refresh suppressed until the given instant
  BackingOff(DateTime<Utc>),
}

/// Owns the staleness rules and every write to the cache store.
pub struct CacheManager<S: CacheStore> {
  store: Arc<S>,
  error_threshold: u32,
  error_backoff: Duration,
  refreshing_lease: Option<Duration>,
}

impl<S: CacheStore> CacheManager<S> {
  pub fn new(store: Arc<S>, settings: &CacheSettings) -> Self {
    Self {
      store,
      error_threshold: settings.error_threshold,
      error_backoff: settings.error_backoff(),
      refreshing_lease: settings.refreshing_lease(),
    }
  }

  pub fn get(&self, cluster_key: &str) -> Result<Option<CacheRecord>> {
    self.store.get(cluster_key)
  }

  pub fn list(&self) -> Result<Vec<CacheRecord>> {
    self.store.list()
  }

  /// Classify a record at `now`.
  ///
  /// Staleness is computed from `fetched_at`, never from the stored
  /// `expires_at`, so TTL changes apply to existing records immediately.
  pub fn freshness(&self, record: &CacheRecord, ttl: Duration, now: DateTime<Utc>) -> Freshness {
    if record.status == RecordStatus::Refreshing && !self.lease_expired(record, now) {
      return Freshness::Refreshing;
    }
    if let Some(retry_after) = record.retry_after {
      if retry_after > now {
        return Freshness::BackingOff(retry_after);
      }
    }
    if record.is_expired(ttl, now) {
      Freshness::Stale
    } else {
      Freshness::Fresh
    }
  }

  fn lease_expired(&self, record: &CacheRecord, now: DateTime<Utc>) -> bool {
    match (self.refreshing_lease, record.refreshing_since) {
      (Some(lease), Some(since)) => now - since > lease,
      (Some(_), None) => true,
      (None, _) => false,
    }
  }

  pub fn is_stale(&self, cluster_key: &str, ttl: Duration) -> Result<bool> {
    self.is_stale_at(cluster_key, ttl, Utc::now())
  }

  /// `true` when no record exists or the record is actionably stale.
  pub fn is_stale_at(&self, cluster_key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
    Ok(match self.store.get(cluster_key)? {
      None => true,
      Some(record) => self.freshness(&record, ttl, now) == Freshness::Stale,
    })
  }

  /// Take the cooperative refresh lock. Must succeed before any fetch starts.
  pub fn mark_refreshing(&self, cluster_key: &str, members: &[String]) -> Result<bool> {
    let now = Utc::now();
    let cutoff = self.refreshing_lease.map(|lease| now - lease);
    let acquired = self
      .store
      .try_mark_refreshing(cluster_key, members, now, cutoff)?;
    debug!(cluster = cluster_key, acquired, "Mark refreshing");
    Ok(acquired)
  }

  /// Store a successful fetch. Returns whether the payload changed.
  pub fn commit_success(
    &self,
    cluster_key: &str,
    members: &[String],
    items: &[RepoItem],
    ttl: Duration,
  ) -> Result<bool> {
    let payload =
      serde_json::to_value(items).map_err(|e| eyre!("Failed to serialize items: {}", e))?;
    let digest = payload_digest(&payload)?;
    let previous = self
      .store
      .get(cluster_key)?
      .and_then(|r| r.payload_digest);

    let now = Utc::now();
    self.store.upsert(
      cluster_key,
      &RecordUpdate {
        member_names: Some(members.to_vec()),
        payload: Some(payload),
        payload_digest: Some(digest.clone()),
        fetched_at: Some(now),
        expires_at: Some(now + ttl),
        status: Some(RecordStatus::Ok),
        last_error: Some(None),
        error_count: Some(0),
        retry_after: Some(None),
        refreshing_since: Some(None),
      },
      now,
    )?;

    Ok(previous.as_deref() != Some(digest.as_str()))
  }

  /// Count a failed fetch. The cached payload is left as it was.
  pub fn commit_failure(&self, cluster_key: &str, err: &FetchError) -> Result<CacheRecord> {
    let now = Utc::now();
    let not_before = match err {
      FetchError::RateLimited { reset_at } => *reset_at,
      _ => None,
    };

    let record = self.store.record_failure(
      cluster_key,
      &FailureUpdate {
        message: err.to_string(),
        threshold: self.error_threshold,
        force_error: matches!(err, FetchError::Auth(_)),
        backoff_until: now + self.error_backoff,
        not_before,
        now,
      },
    )?;

    match err {
      FetchError::Malformed(detail) => error!(
        cluster = cluster_key,
        detail = %detail,
        error_count = record.error_count,
        status = %record.status,
        "Upstream returned a malformed response"
      ),
      _ => warn!(
        cluster = cluster_key,
        error = %err,
        error_count = record.error_count,
        status = %record.status,
        "Upstream fetch failed"
      ),
    }

    Ok(record)
  }

  /// Last known items regardless of freshness.
  pub fn stale_fallback(&self, cluster_key: &str) -> Result<Option<Vec<RepoItem>>> {
    Ok(self.store.get(cluster_key)?.as_ref().and_then(decode_payload))
  }

  /// Make one cluster (or every cluster) stale without dropping its payload.
  pub fn invalidate(&self, cluster_key: Option<&str>) -> Result<usize> {
    let count = self.store.bulk_invalidate(cluster_key, Utc::now())?;
    debug!(cluster = ?cluster_key, count, "Invalidated");
    Ok(count)
  }
}

/// Items stored in a record, if it has ever been fetched successfully.
/// A payload that no longer decodes counts as absent so the cluster gets refetched.
pub fn decode_payload(record: &CacheRecord) -> Option<Vec<RepoItem>> {
  let payload = record.payload.as_ref()?;
  match serde_json::from_value::<Vec<RepoItem>>(payload.clone()) {
    Ok(items) => Some(items),
    Err(e) => {
      warn!(
        cluster = %record.cluster_key,
        error = %e,
        "Discarding cached payload that no longer decodes"
      );
      None
    }
  }
}

fn payload_digest(payload: &serde_json::Value) -> Result<String> {
  let bytes =
    serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
  let mut hasher = Sha256::new();
  hasher.update(&bytes);
  Ok(hex::encode(hasher.finalize()))
}
