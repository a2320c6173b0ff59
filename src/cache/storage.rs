//! Cache store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::record::{CacheRecord, FailureUpdate, RecordStatus, RecordUpdate};

/// Persistence boundary for cluster records.
///
/// Every mutation is a single statement; nothing here reads a row and then
/// writes it back.
pub trait CacheStore: Send + Sync {
  /// Get the record for a cluster.
  fn get(&self, cluster_key: &str) -> Result<Option<CacheRecord>>;

  /// All records, ordered by key.
  fn list(&self) -> Result<Vec<CacheRecord>>;

  /// Insert or update the supplied columns.
  fn upsert(&self, cluster_key: &str, update: &RecordUpdate, now: DateTime<Utc>) -> Result<()>;

  /// Set `status = refreshing` unless another refresh holds an unexpired lease.
  ///
  /// Creates the record when absent. Returns whether the caller now holds the lease.
  /// A lease that started before `lease_cutoff` counts as expired; `None` never expires.
  fn try_mark_refreshing(
    &self,
    cluster_key: &str,
    members: &[String],
    now: DateTime<Utc>,
    lease_cutoff: Option<DateTime<Utc>>,
  ) -> Result<bool>;

  /// Count a failed fetch and return the updated record.
  fn record_failure(&self, cluster_key: &str, failure: &FailureUpdate) -> Result<CacheRecord>;

  /// Push `fetched_at` into the past for one cluster, or all when `None`.
  fn bulk_invalidate(&self, cluster_key: Option<&str>, now: DateTime<Utc>) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    // Other processes may hold the write lock briefly while refreshing
    conn
      .busy_timeout(std::time::Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_records (
    cluster_key TEXT PRIMARY KEY,
    member_names TEXT NOT NULL DEFAULT '[]',
    payload TEXT,
    payload_digest TEXT,
    fetched_at TEXT,
    expires_at TEXT,
    status TEXT NOT NULL DEFAULT 'ok',
    last_error TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    retry_after TEXT,
    refreshing_since TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_records_status ON cache_records(status);
"#;

const COLUMNS: &str = "cluster_key, member_names, payload, payload_digest, fetched_at, \
  expires_at, status, last_error, error_count, retry_after, refreshing_since, updated_at";

/// Timestamp written by invalidation; older than any real fetch.
const INVALIDATED_AT: &str = "1970-01-01T00:00:00.000000Z";

impl CacheStore for SqliteStore {
  fn get(&self, cluster_key: &str) -> Result<Option<CacheRecord>> {
    let conn = self.conn()?;
    conn
      .query_row(
        &format!("SELECT {} FROM cache_records WHERE cluster_key = ?1", COLUMNS),
        params![cluster_key],
        read_record,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache record {}: {}", cluster_key, e))
  }

  fn list(&self) -> Result<Vec<CacheRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM cache_records ORDER BY cluster_key",
        COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let records = stmt
      .query_map([], read_record)
      .map_err(|e| eyre!("Failed to query cache records: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache record: {}", e))?;

    Ok(records)
  }

  fn upsert(&self, cluster_key: &str, update: &RecordUpdate, now: DateTime<Utc>) -> Result<()> {
    let mut columns: Vec<&'static str> = vec!["cluster_key", "updated_at"];
    let mut values: Vec<Value> = vec![Value::Text(cluster_key.to_string()), ts_value(Some(now))];

    if let Some(members) = &update.member_names {
      let json =
        serde_json::to_string(members).map_err(|e| eyre!("Failed to serialize members: {}", e))?;
      columns.push("member_names");
      values.push(Value::Text(json));
    }
    if let Some(payload) = &update.payload {
      let json =
        serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
      columns.push("payload");
      values.push(Value::Text(json));
    }
    if let Some(digest) = &update.payload_digest {
      columns.push("payload_digest");
      values.push(Value::Text(digest.clone()));
    }
    if let Some(fetched_at) = update.fetched_at {
      columns.push("fetched_at");
      values.push(ts_value(Some(fetched_at)));
    }
    if let Some(expires_at) = update.expires_at {
      columns.push("expires_at");
      values.push(ts_value(Some(expires_at)));
    }
    if let Some(status) = update.status {
      columns.push("status");
      values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(last_error) = &update.last_error {
      columns.push("last_error");
      values.push(last_error.clone().map_or(Value::Null, Value::Text));
    }
    if let Some(count) = update.error_count {
      columns.push("error_count");
      values.push(Value::Integer(i64::from(count)));
    }
    if let Some(retry_after) = update.retry_after {
      columns.push("retry_after");
      values.push(ts_value(retry_after));
    }
    if let Some(since) = update.refreshing_since {
      columns.push("refreshing_since");
      values.push(ts_value(since));
    }

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let assignments: Vec<String> = columns[1..]
      .iter()
      .map(|c| format!("{c} = excluded.{c}"))
      .collect();
    let sql = format!(
      "INSERT INTO cache_records ({}) VALUES ({})
       ON CONFLICT(cluster_key) DO UPDATE SET {}",
      columns.join(", "),
      placeholders.join(", "),
      assignments.join(", ")
    );

    self
      .conn()?
      .execute(&sql, params_from_iter(values.iter()))
      .map_err(|e| eyre!("Failed to upsert cache record {}: {}", cluster_key, e))?;

    Ok(())
  }

  fn try_mark_refreshing(
    &self,
    cluster_key: &str,
    members: &[String],
    now: DateTime<Utc>,
    lease_cutoff: Option<DateTime<Utc>>,
  ) -> Result<bool> {
    let members =
      serde_json::to_string(members).map_err(|e| eyre!("Failed to serialize members: {}", e))?;

    // member_names is only set on insert; the payload still belongs to the old list
    let changed = self
      .conn()?
      .execute(
        "INSERT INTO cache_records (cluster_key, member_names, status, refreshing_since, updated_at)
         VALUES (?1, ?2, 'refreshing', ?3, ?3)
         ON CONFLICT(cluster_key) DO UPDATE SET
           status = 'refreshing',
           refreshing_since = excluded.refreshing_since,
           updated_at = excluded.updated_at
         WHERE cache_records.status != 'refreshing'
            OR (?4 IS NOT NULL AND (cache_records.refreshing_since IS NULL
                                    OR cache_records.refreshing_since < ?4))",
        params![cluster_key, members, ts_value(Some(now)), ts_value(lease_cutoff)],
      )
      .map_err(|e| eyre!("Failed to mark {} as refreshing: {}", cluster_key, e))?;

    Ok(changed > 0)
  }

  fn record_failure(&self, cluster_key: &str, failure: &FailureUpdate) -> Result<CacheRecord> {
    let sql = format!(
      "INSERT INTO cache_records (cluster_key, status, last_error, error_count, retry_after, updated_at)
       VALUES (
         ?1,
         CASE WHEN ?3 OR 1 >= ?2 THEN 'error' ELSE 'ok' END,
         ?4,
         1,
         CASE WHEN ?3 OR 1 >= ?2 THEN max(?5, coalesce(?6, '')) ELSE ?6 END,
         ?7
       )
       ON CONFLICT(cluster_key) DO UPDATE SET
         error_count = cache_records.error_count + 1,
         status = CASE WHEN ?3 OR cache_records.error_count + 1 >= ?2 THEN 'error' ELSE 'ok' END,
         last_error = ?4,
         retry_after = CASE WHEN ?3 OR cache_records.error_count + 1 >= ?2
                            THEN max(?5, coalesce(?6, '')) ELSE ?6 END,
         refreshing_since = NULL,
         updated_at = ?7
       RETURNING {}",
      COLUMNS
    );

    self
      .conn()?
      .query_row(
        &sql,
        params![
          cluster_key,
          failure.threshold,
          failure.force_error,
          failure.message,
          ts_value(Some(failure.backoff_until)),
          ts_value(failure.not_before),
          ts_value(Some(failure.now)),
        ],
        read_record,
      )
      .map_err(|e| eyre!("Failed to record failure for {}: {}", cluster_key, e))
  }

  fn bulk_invalidate(&self, cluster_key: Option<&str>, now: DateTime<Utc>) -> Result<usize> {
    self
      .conn()?
      .execute(
        "UPDATE cache_records
         SET fetched_at = ?1, expires_at = ?1, retry_after = NULL, updated_at = ?2
         WHERE ?3 IS NULL OR cluster_key = ?3",
        params![INVALIDATED_AT, ts_value(Some(now)), cluster_key],
      )
      .map_err(|e| eyre!("Failed to invalidate cache: {}", e))
  }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn format_ts(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_value(ts: Option<DateTime<Utc>>) -> Value {
  ts.map_or(Value::Null, |t| Value::Text(format_ts(t)))
}

/// Parse a stored timestamp.
fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
  DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

fn conversion_error(
  idx: usize,
  e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn opt_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
  let raw: Option<String> = row.get(idx)?;
  raw
    .map(|s| parse_datetime(&s).map_err(|e| conversion_error(idx, e)))
    .transpose()
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
  let members: String = row.get(1)?;
  let payload: Option<String> = row.get(2)?;
  let status: String = row.get(6)?;
  let updated_at: String = row.get(11)?;

  Ok(CacheRecord {
    cluster_key: row.get(0)?,
    member_names: serde_json::from_str(&members).map_err(|e| conversion_error(1, e))?,
    payload: payload
      .map(|p| serde_json::from_str(&p).map_err(|e| conversion_error(2, e)))
      .transpose()?,
    payload_digest: row.get(3)?,
    fetched_at: opt_datetime(row, 4)?,
    expires_at: opt_datetime(row, 5)?,
    status: status.parse().map_err(|e: String| conversion_error(6, e))?,
    last_error: row.get(7)?,
    error_count: row.get(8)?,
    retry_after: opt_datetime(row, 9)?,
    refreshing_since: opt_datetime(row, 10)?,
    updated_at: parse_datetime(&updated_at).map_err(|e| conversion_error(11, e))?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration, TimeZone};
  use serde_json::json;

  fn t(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, hour, 0, 0).unwrap()
  }

  fn members() -> Vec<String> {
    vec!["acme/one".to_string(), "acme/two".to_string()]
  }

  fn failure(threshold: u32, now: DateTime<Utc>) -> FailureUpdate {
    FailureUpdate {
      message: "boom".to_string(),
      threshold,
      force_error: false,
      backoff_until: now + Duration::hours(1),
      not_before: None,
      now,
    }
  }

  #[test]
  fn test_get_missing_returns_none() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.get("nope").unwrap().is_none());
  }

  #[test]
  fn test_upsert_inserts_then_updates_only_given_columns() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(
        "cinder",
        &RecordUpdate {
          member_names: Some(members()),
          payload: Some(json!([{ "id": "acme/one" }])),
          fetched_at: Some(t(1)),
          last_error: Some(Some("old".to_string())),
          ..Default::default()
        },
        t(1),
      )
      .unwrap();

    store
      .upsert(
        "cinder",
        &RecordUpdate {
          status: Some(RecordStatus::Error),
          last_error: Some(None),
          ..Default::default()
        },
        t(2),
      )
      .unwrap();

    let record = store.get("cinder").unwrap().unwrap();
    assert_eq!(record.member_names, members());
    assert_eq!(record.payload, Some(json!([{ "id": "acme/one" }])));
    assert_eq!(record.fetched_at, Some(t(1)));
    assert_eq!(record.status, RecordStatus::Error);
    assert_eq!(record.last_error, None);
    assert_eq!(record.error_count, 0);
    assert_eq!(record.updated_at, t(2));
  }

  #[test]
  fn test_mark_refreshing_is_single_winner() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.try_mark_refreshing("cinder", &members(), t(1), None).unwrap());
    assert!(!store.try_mark_refreshing("cinder", &members(), t(1), None).unwrap());

    let record = store.get("cinder").unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Refreshing);
    assert_eq!(record.refreshing_since, Some(t(1)));
    assert_eq!(record.member_names, members());
    assert!(record.payload.is_none());
  }

  #[test]
  fn test_mark_refreshing_takes_over_expired_lease() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.try_mark_refreshing("cinder", &members(), t(1), None).unwrap());
    // Lease cut-off before the lease started: still held
    assert!(!store
      .try_mark_refreshing("cinder", &members(), t(2), Some(t(0)))
      .unwrap());
    // Cut-off after the lease started: expired
    assert!(store
      .try_mark_refreshing("cinder", &members(), t(3), Some(t(2)))
      .unwrap());
    assert_eq!(
      store.get("cinder").unwrap().unwrap().refreshing_since,
      Some(t(3))
    );
  }

  #[test]
  fn test_mark_refreshing_keeps_existing_members() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(
        "cinder",
        &RecordUpdate {
          member_names: Some(vec!["acme/old".to_string()]),
          ..Default::default()
        },
        t(1),
      )
      .unwrap();
    assert!(store.try_mark_refreshing("cinder", &members(), t(2), None).unwrap());
    assert_eq!(
      store.get("cinder").unwrap().unwrap().member_names,
      vec!["acme/old".to_string()]
    );
  }

  #[test]
  fn test_record_failure_counts_up_to_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.try_mark_refreshing("cinder", &members(), t(1), None).unwrap();

    let first = store.record_failure("cinder", &failure(3, t(1))).unwrap();
    assert_eq!(first.error_count, 1);
    assert_eq!(first.status, RecordStatus::Ok);
    assert_eq!(first.retry_after, None);
    assert_eq!(first.refreshing_since, None);
    assert_eq!(first.last_error.as_deref(), Some("boom"));

    store.record_failure("cinder", &failure(3, t(2))).unwrap();
    let third = store.record_failure("cinder", &failure(3, t(3))).unwrap();
    assert_eq!(third.error_count, 3);
    assert_eq!(third.status, RecordStatus::Error);
    assert_eq!(third.retry_after, Some(t(4)));
  }

  #[test]
  fn test_record_failure_forced_error_and_rate_limit_reset() {
    let store = SqliteStore::open_in_memory().unwrap();

    let mut forced = failure(3, t(1));
    forced.force_error = true;
    let record = store.record_failure("auth", &forced).unwrap();
    assert_eq!(record.status, RecordStatus::Error);
    assert_eq!(record.error_count, 1);

    // Below threshold, but the upstream asked us to wait
    let mut limited = failure(3, t(1));
    limited.not_before = Some(t(5));
    let record = store.record_failure("limited", &limited).unwrap();
    assert_eq!(record.status, RecordStatus::Ok);
    assert_eq!(record.retry_after, Some(t(5)));

    // In error, the later of backoff and reset wins
    let mut limited = failure(1, t(1));
    limited.not_before = Some(t(5));
    let record = store.record_failure("limited", &limited).unwrap();
    assert_eq!(record.status, RecordStatus::Error);
    assert_eq!(record.retry_after, Some(t(5)));
  }

  #[test]
  fn test_record_failure_never_touches_payload() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .upsert(
        "cinder",
        &RecordUpdate {
          payload: Some(json!(["kept"])),
          ..Default::default()
        },
        t(1),
      )
      .unwrap();
    let record = store.record_failure("cinder", &failure(1, t(2))).unwrap();
    assert_eq!(record.payload, Some(json!(["kept"])));
  }

  #[test]
  fn test_bulk_invalidate_single_and_all() {
    let store = SqliteStore::open_in_memory().unwrap();
    for key in ["a", "b"] {
      store
        .upsert(
          key,
          &RecordUpdate {
            fetched_at: Some(t(5)),
            retry_after: Some(Some(t(9))),
            ..Default::default()
          },
          t(5),
        )
        .unwrap();
    }

    assert_eq!(store.bulk_invalidate(Some("a"), t(6)).unwrap(), 1);
    let a = store.get("a").unwrap().unwrap();
    assert!(a.fetched_at.unwrap() < t(0));
    assert_eq!(a.retry_after, None);
    assert_eq!(store.get("b").unwrap().unwrap().fetched_at, Some(t(5)));

    assert_eq!(store.bulk_invalidate(None, t(7)).unwrap(), 2);
    assert!(store.get("b").unwrap().unwrap().fetched_at.unwrap() < t(0));
    assert_eq!(store.bulk_invalidate(Some("missing"), t(7)).unwrap(), 0);
  }

  #[test]
  fn test_records_persist_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let store = SqliteStore::open(&path).unwrap();
      store.try_mark_refreshing("cinder", &members(), t(1), None).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let records = store.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cluster_key, "cinder");
    assert_eq!(records[0].status, RecordStatus::Refreshing);
  }
}
