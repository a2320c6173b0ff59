//! Repository metadata cache.
//!
//! This module keeps one record per cluster of repositories and:
//! - Persists records in SQLite so every process shares one source of truth
//! - Serves fresh data directly and stale data while refreshing in the background
//! - Lets only one refresh per cluster reach the upstream API at a time
//! - Falls back to the last good payload when the upstream fails
//! - Collapses concurrent requests for the same clusters into one batch

mod batch;
mod manager;
mod record;
mod refresh;
mod storage;

pub use batch::{BatchResolver, BatchResponse, ClusterLoader};
pub use manager::{decode_payload, CacheManager, Freshness};
pub use record::{CacheRecord, FailureUpdate, RecordStatus, RecordUpdate};
pub use refresh::{ClusterResponse, RefreshError, RefreshOrchestrator, RefreshStats, ResolveError};
pub use storage::{CacheStore, SqliteStore};
