//! Per-request refresh decisions: serve fresh, serve stale and refresh in the
//! background, or fetch while the caller waits.
//!
//! Refreshes for one cluster are single-flight. Inside a process the
//! in-flight map hands every concurrent caller the same shared future;
//! across processes the `refreshing` status in the store decides who fetches.

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::manager::{decode_payload, CacheManager, Freshness};
use super::storage::CacheStore;
use crate::config::{ClusterConfig, Config};
use crate::github::{FetchError, RateLimit, RepoFetcher, RepoItem};

/// What a caller gets back for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterResponse {
  pub items: Vec<RepoItem>,
  /// Served from the store rather than a fetch made for this request
  pub cached: bool,
  pub is_stale: bool,
  /// Only set when there was nothing at all to serve
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ClusterResponse {
  pub fn empty() -> Self {
    Self {
      items: Vec::new(),
      cached: false,
      is_stale: false,
      error: None,
    }
  }

  fn failed(message: String) -> Self {
    Self {
      error: Some(message),
      ..Self::empty()
    }
  }
}

/// Caller-facing failures. Upstream failures never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error("unknown cluster '{0}'")]
  UnknownCluster(String),

  #[error("cache store failure: {0}")]
  Store(String),

  #[error("batch dispatcher stopped")]
  DispatcherClosed,
}

fn store_err(e: color_eyre::Report) -> ResolveError {
  ResolveError::Store(e.to_string())
}

/// Why a single refresh produced no items.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
  #[error(transparent)]
  Upstream(#[from] FetchError),

  #[error("cache store failure: {0}")]
  Store(String),
}

type RefreshOutcome = Result<Vec<RepoItem>, RefreshError>;
type Flight = Shared<BoxFuture<'static, RefreshOutcome>>;

enum FlightStart {
  /// This call took the lock and spawned the refresh
  Started(Flight),
  /// A refresh in this process was already running
  Joined(Flight),
  /// Another process holds the lock
  Busy,
}

#[derive(Debug, Default)]
struct Counters {
  fetches: AtomicU64,
  background_refreshes: AtomicU64,
  background_failures: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
  pub fetches: u64,
  pub background_refreshes: u64,
  pub background_failures: u64,
}

pub struct RefreshOrchestrator<S: CacheStore, F: RepoFetcher> {
  manager: Arc<CacheManager<S>>,
  fetcher: Arc<F>,
  config: Arc<Config>,
  inflight: Arc<Mutex<HashMap<String, Flight>>>,
  background: Arc<Mutex<Vec<JoinHandle<()>>>>,
  counters: Arc<Counters>,
  rate_limit: Arc<Mutex<Option<RateLimit>>>,
}

impl<S, F> RefreshOrchestrator<S, F>
where
  S: CacheStore + 'static,
  F: RepoFetcher + 'static,
{
  pub fn new(store: Arc<S>, fetcher: Arc<F>, config: Arc<Config>) -> Self {
    Self {
      manager: Arc::new(CacheManager::new(store, &config.cache)),
      fetcher,
      config,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      background: Arc::new(Mutex::new(Vec::new())),
      counters: Arc::new(Counters::default()),
      rate_limit: Arc::new(Mutex::new(None)),
    }
  }

  pub fn manager(&self) -> &CacheManager<S> {
    &self.manager
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Items for a cluster, from cache where possible.
  pub async fn get_cluster(&self, cluster_key: &str) -> Result<ClusterResponse, ResolveError> {
    self.resolve(cluster_key, false).await
  }

  /// Fetch now regardless of freshness. Still goes through the refresh lock.
  pub async fn force_refresh(&self, cluster_key: &str) -> Result<ClusterResponse, ResolveError> {
    self.resolve(cluster_key, true).await
  }

  /// Mark one cluster (or all) stale. Cached payloads stay available.
  pub fn invalidate(&self, cluster_key: Option<&str>) -> Result<usize, ResolveError> {
    if let Some(key) = cluster_key {
      if self.config.cluster(key).is_none() {
        return Err(ResolveError::UnknownCluster(key.to_string()));
      }
    }
    self.manager.invalidate(cluster_key).map_err(store_err)
  }

  pub fn stats(&self) -> RefreshStats {
    RefreshStats {
      fetches: self.counters.fetches.load(Ordering::Relaxed),
      background_refreshes: self.counters.background_refreshes.load(Ordering::Relaxed),
      background_failures: self.counters.background_failures.load(Ordering::Relaxed),
    }
  }

  /// Most recent rate-limit snapshot reported upstream.
  pub fn rate_limit(&self) -> Option<RateLimit> {
    self.rate_limit.lock().ok().and_then(|r| *r)
  }

  /// Wait for every spawned refresh to finish.
  pub async fn drain_background(&self) {
    loop {
      let handles = match self.background.lock() {
        Ok(mut handles) => std::mem::take(&mut *handles),
        Err(_) => return,
      };
      if handles.is_empty() {
        return;
      }
      for handle in handles {
        if let Err(e) = handle.await {
          warn!(error = %e, "Refresh task did not complete");
        }
      }
    }
  }

  async fn resolve(&self, cluster_key: &str, force: bool) -> Result<ClusterResponse, ResolveError> {
    let cluster = self
      .config
      .cluster(cluster_key)
      .ok_or_else(|| ResolveError::UnknownCluster(cluster_key.to_string()))?;

    if cluster.members.is_empty() {
      return Ok(ClusterResponse::empty());
    }

    let ttl = self.config.cache.ttl_for(cluster);
    let now = Utc::now();

    let Some(record) = self.manager.get(cluster_key).map_err(store_err)? else {
      debug!(cluster = cluster_key, "Cache miss");
      return self.refresh_blocking(cluster_key, cluster, ttl, None).await;
    };
    let cached = decode_payload(&record);

    if force {
      debug!(cluster = cluster_key, "Forced refresh");
      return self.refresh_blocking(cluster_key, cluster, ttl, cached).await;
    }

    let expired = record.is_expired(ttl, now);
    let freshness = match self.manager.freshness(&record, ttl, now) {
      Freshness::Fresh if record.member_names != cluster.members => {
        debug!(cluster = cluster_key, "Configured members changed");
        Freshness::Stale
      }
      other => other,
    };

    let Some(items) = cached else {
      // Known cluster that has never produced a usable payload
      if let Freshness::BackingOff(until) = freshness {
        debug!(cluster = cluster_key, %until, "Nothing cached, refresh backing off");
        let message = record
          .last_error
          .unwrap_or_else(|| format!("refresh suppressed until {}", until.to_rfc3339()));
        return Ok(ClusterResponse::failed(message));
      }
      debug!(cluster = cluster_key, "Cache miss");
      return self.refresh_blocking(cluster_key, cluster, ttl, None).await;
    };

    match freshness {
      Freshness::Stale if self.config.cache.background_refresh => {
        debug!(cluster = cluster_key, "Serving stale, refreshing in background");
        self.refresh_background(cluster_key, cluster, ttl)?;
        Ok(self.respond(items, true, true))
      }
      Freshness::Stale => {
        self
          .refresh_blocking(cluster_key, cluster, ttl, Some(items))
          .await
      }
      other => {
        debug!(cluster = cluster_key, freshness = ?other, "Cache hit");
        Ok(self.respond(items, true, expired))
      }
    }
  }

  fn refresh_background(
    &self,
    cluster_key: &str,
    cluster: &ClusterConfig,
    ttl: Duration,
  ) -> Result<(), ResolveError> {
    match self.begin_flight(cluster_key, cluster, ttl, true)? {
      FlightStart::Started(_) => {
        self
          .counters
          .background_refreshes
          .fetch_add(1, Ordering::Relaxed);
      }
      FlightStart::Joined(_) | FlightStart::Busy => {
        debug!(cluster = cluster_key, "Refresh already in flight");
      }
    }
    Ok(())
  }

  async fn refresh_blocking(
    &self,
    cluster_key: &str,
    cluster: &ClusterConfig,
    ttl: Duration,
    fallback: Option<Vec<RepoItem>>,
  ) -> Result<ClusterResponse, ResolveError> {
    let flight = match self.begin_flight(cluster_key, cluster, ttl, false)? {
      FlightStart::Started(flight) | FlightStart::Joined(flight) => flight,
      FlightStart::Busy => {
        debug!(cluster = cluster_key, "Refresh held elsewhere, serving what is cached");
        return Ok(match self.fallback(cluster_key, fallback)? {
          Some(items) => self.respond(items, true, true),
          None => ClusterResponse {
            is_stale: true,
            ..ClusterResponse::empty()
          },
        });
      }
    };

    match flight.await {
      Ok(items) => Ok(self.respond(items, false, false)),
      Err(err) => match self.fallback(cluster_key, fallback)? {
        Some(items) => Ok(self.respond(items, true, true)),
        None => Ok(ClusterResponse::failed(err.to_string())),
      },
    }
  }

  fn fallback(
    &self,
    cluster_key: &str,
    known: Option<Vec<RepoItem>>,
  ) -> Result<Option<Vec<RepoItem>>, ResolveError> {
    match known {
      Some(items) => Ok(Some(items)),
      None => self.manager.stale_fallback(cluster_key).map_err(store_err),
    }
  }

  fn inflight(&self) -> Result<MutexGuard<'_, HashMap<String, Flight>>, ResolveError> {
    self
      .inflight
      .lock()
      .map_err(|e| ResolveError::Store(format!("Lock poisoned: {}", e)))
  }

  /// Join the running refresh for a cluster, or take the lock and spawn one.
  ///
  /// The store write that takes the lock runs without the in-flight map held.
  fn begin_flight(
    &self,
    cluster_key: &str,
    cluster: &ClusterConfig,
    ttl: Duration,
    background: bool,
  ) -> Result<FlightStart, ResolveError> {
    if let Some(flight) = self.inflight()?.get(cluster_key) {
      return Ok(FlightStart::Joined(flight.clone()));
    }

    // The status flip must land before any fetch begins
    if !self
      .manager
      .mark_refreshing(cluster_key, &cluster.members)
      .map_err(store_err)?
    {
      // Lost to a flight in this process that started in between
      return Ok(match self.inflight()?.get(cluster_key) {
        Some(flight) => FlightStart::Joined(flight.clone()),
        None => FlightStart::Busy,
      });
    }

    let flight = self
      .clone()
      .run_flight(cluster_key.to_string(), cluster.members.clone(), ttl)
      .boxed()
      .shared();
    self
      .inflight()?
      .insert(cluster_key.to_string(), flight.clone());

    // Spawned so the refresh completes even if the caller goes away
    let task = flight.clone();
    let counters = Arc::clone(&self.counters);
    let key = cluster_key.to_string();
    let handle = tokio::spawn(async move {
      if let Err(err) = task.await {
        if background {
          counters.background_failures.fetch_add(1, Ordering::Relaxed);
          debug!(cluster = %key, error = %err, "Background refresh failed");
        }
      }
    });
    self.track(handle);

    Ok(FlightStart::Started(flight))
  }

  fn track(&self, handle: JoinHandle<()>) {
    if let Ok(mut handles) = self.background.lock() {
      handles.retain(|h| !h.is_finished());
      handles.push(handle);
    }
  }

  async fn run_flight(self, cluster_key: String, members: Vec<String>, ttl: Duration) -> RefreshOutcome {
    self.counters.fetches.fetch_add(1, Ordering::Relaxed);
    let timeout = self.config.cache.fetch_timeout();

    let fetched = match tokio::time::timeout(timeout, self.fetcher.fetch(&members)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Unavailable(format!(
        "timed out after {}s",
        timeout.as_secs()
      ))),
    };

    let outcome = match fetched {
      Ok(fetch) => {
        if let Some(limit) = fetch.rate_limit {
          debug!(remaining = limit.remaining, reset_at = ?limit.reset_at, "Upstream rate limit");
          if let Ok(mut current) = self.rate_limit.lock() {
            *current = Some(limit);
          }
        }
        match self
          .manager
          .commit_success(&cluster_key, &members, &fetch.items, ttl)
        {
          Ok(changed) => {
            info!(
              cluster = %cluster_key,
              items = fetch.items.len(),
              changed,
              "Refreshed cluster"
            );
            Ok(fetch.items)
          }
          Err(e) => {
            error!(cluster = %cluster_key, error = %e, "Failed to store refreshed cluster");
            Err(RefreshError::Store(e.to_string()))
          }
        }
      }
      Err(err) => {
        if let Err(e) = self.manager.commit_failure(&cluster_key, &err) {
          error!(cluster = %cluster_key, error = %e, "Failed to record fetch failure");
        }
        Err(RefreshError::Upstream(err))
      }
    };

    if let Ok(mut inflight) = self.inflight.lock() {
      inflight.remove(&cluster_key);
    }

    outcome
  }

  fn respond(&self, mut items: Vec<RepoItem>, cached: bool, is_stale: bool) -> ClusterResponse {
    self.config.apply_overrides(&mut items);
    ClusterResponse {
      items,
      cached,
      is_stale,
      error: None,
    }
  }
}

impl<S: CacheStore, F: RepoFetcher> Clone for RefreshOrchestrator<S, F> {
  fn clone(&self) -> Self {
    Self {
      manager: Arc::clone(&self.manager),
      fetcher: Arc::clone(&self.fetcher),
      config: Arc::clone(&self.config),
      inflight: Arc::clone(&self.inflight),
      background: Arc::clone(&self.background),
      counters: Arc::clone(&self.counters),
      rate_limit: Arc::clone(&self.rate_limit),
    }
  }
}
