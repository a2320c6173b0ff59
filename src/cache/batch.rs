//! Collapses concurrent cluster requests into one unit of work per window.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::refresh::{ClusterResponse, RefreshOrchestrator, ResolveError};
use super::storage::CacheStore;
use crate::github::RepoFetcher;

/// Result of resolving several clusters together.
#[derive(Debug, Clone)]
pub struct BatchResponse {
  /// One entry per distinct requested key; unknown keys carry their own error
  pub per_cluster: BTreeMap<String, Result<ClusterResponse, ResolveError>>,
  pub total_items: usize,
  pub timestamp: DateTime<Utc>,
}

impl BatchResponse {
  pub fn get(&self, cluster_key: &str) -> Option<&Result<ClusterResponse, ResolveError>> {
    self.per_cluster.get(cluster_key)
  }
}

pub struct BatchResolver<S: CacheStore, F: RepoFetcher> {
  orchestrator: RefreshOrchestrator<S, F>,
}

impl<S, F> BatchResolver<S, F>
where
  S: CacheStore + 'static,
  F: RepoFetcher + 'static,
{
  pub fn new(orchestrator: RefreshOrchestrator<S, F>) -> Self {
    Self { orchestrator }
  }

  pub fn orchestrator(&self) -> &RefreshOrchestrator<S, F> {
    &self.orchestrator
  }

  /// Resolve every distinct key once, concurrently.
  pub async fn resolve(&self, cluster_keys: &[String]) -> BatchResponse {
    self.resolve_with(cluster_keys, false).await
  }

  /// Fetch every configured cluster now.
  pub async fn force_refresh_all(&self) -> BatchResponse {
    let keys: Vec<String> = self
      .orchestrator
      .config()
      .clusters
      .keys()
      .cloned()
      .collect();
    self.resolve_with(&keys, true).await
  }

  async fn resolve_with(&self, cluster_keys: &[String], force: bool) -> BatchResponse {
    let mut seen = HashSet::new();
    let distinct: Vec<&str> = cluster_keys
      .iter()
      .map(String::as_str)
      .filter(|key| seen.insert(*key))
      .collect();
    debug!(
      requested = cluster_keys.len(),
      distinct = distinct.len(),
      force,
      "Resolving batch"
    );

    let results = join_all(distinct.into_iter().map(|key| async move {
      let result = if force {
        self.orchestrator.force_refresh(key).await
      } else {
        self.orchestrator.get_cluster(key).await
      };
      (key.to_string(), result)
    }))
    .await;

    let total_items = results
      .iter()
      .filter_map(|(_, result)| result.as_ref().ok())
      .map(|response| response.items.len())
      .sum();

    BatchResponse {
      per_cluster: results.into_iter().collect(),
      total_items,
      timestamp: Utc::now(),
    }
  }

  /// Start a dispatcher that batches `ClusterLoader::load` calls issued in
  /// the same scheduling tick.
  pub fn spawn_loader(&self) -> ClusterLoader {
    let (tx, mut rx) = mpsc::unbounded_channel::<LoadRequest>();
    let resolver = self.clone();

    tokio::spawn(async move {
      while let Some(first) = rx.recv().await {
        let mut window = vec![first];
        // Give every caller scheduled alongside the first one a chance to enqueue
        tokio::task::yield_now().await;
        while let Ok(request) = rx.try_recv() {
          window.push(request);
        }

        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.dispatch(window).await });
      }
    });

    ClusterLoader { tx }
  }

  async fn dispatch(&self, window: Vec<LoadRequest>) {
    let keys: Vec<String> = window.iter().map(|r| r.cluster_key.clone()).collect();
    let batch = self.resolve(&keys).await;

    for request in window {
      let result = batch
        .get(&request.cluster_key)
        .cloned()
        .unwrap_or_else(|| Err(ResolveError::UnknownCluster(request.cluster_key.clone())));
      // Caller may have given up
      let _ = request.reply.send(result);
    }
  }
}

impl<S: CacheStore, F: RepoFetcher> Clone for BatchResolver<S, F> {
  fn clone(&self) -> Self {
    Self {
      orchestrator: self.orchestrator.clone(),
    }
  }
}

struct LoadRequest {
  cluster_key: String,
  reply: oneshot::Sender<Result<ClusterResponse, ResolveError>>,
}

/// Handle for single-cluster requests that get batched automatically.
#[derive(Clone)]
pub struct ClusterLoader {
  tx: mpsc::UnboundedSender<LoadRequest>,
}

impl ClusterLoader {
  pub async fn load(&self, cluster_key: &str) -> Result<ClusterResponse, ResolveError> {
    let (reply, response) = oneshot::channel();
    self
      .tx
      .send(LoadRequest {
        cluster_key: cluster_key.to_string(),
        reply,
      })
      .map_err(|_| ResolveError::DispatcherClosed)?;

    response.await.map_err(|_| ResolveError::DispatcherClosed)?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStore;
  use crate::config::Config;
  use crate::github::fetcher::testing::StubFetcher;
  use crate::github::FetchError;
  use std::sync::Arc;
  use std::time::Duration;

  const CONFIG: &str = r#"
clusters:
  a:
    members: [acme/a1, acme/a2]
  b:
    members: [acme/b1]
  empty:
    members: []
"#;

  fn resolver(fetcher: StubFetcher) -> (BatchResolver<SqliteStore, StubFetcher>, Arc<StubFetcher>) {
    let config = Arc::new(Config::from_yaml(CONFIG).unwrap());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let fetcher = Arc::new(fetcher);
    let orchestrator = RefreshOrchestrator::new(store, Arc::clone(&fetcher), config);
    (BatchResolver::new(orchestrator), fetcher)
  }

  fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
  }

  #[tokio::test]
  async fn test_duplicate_keys_resolve_once() {
    let (resolver, fetcher) = resolver(StubFetcher::new());

    let batch = resolver.resolve(&keys(&["a", "a", "b"])).await;
    assert_eq!(batch.per_cluster.len(), 2);
    assert_eq!(fetcher.calls_for("acme/a1"), 1);
    assert_eq!(fetcher.calls_for("acme/b1"), 1);
    assert_eq!(batch.total_items, 3);
    assert_eq!(batch.get("a").unwrap().as_ref().unwrap().items.len(), 2);
  }

  #[tokio::test]
  async fn test_unknown_key_does_not_fail_batch() {
    let (resolver, _fetcher) = resolver(StubFetcher::new());

    let batch = resolver.resolve(&keys(&["a", "ghost", "empty"])).await;
    assert_eq!(
      batch.get("ghost").unwrap(),
      &Err(ResolveError::UnknownCluster("ghost".to_string()))
    );
    assert_eq!(batch.get("a").unwrap().as_ref().unwrap().items.len(), 2);
    assert!(batch.get("empty").unwrap().as_ref().unwrap().items.is_empty());
    assert_eq!(batch.total_items, 2);
  }

  #[tokio::test]
  async fn test_loader_batches_same_tick_calls() {
    let (resolver, fetcher) =
      resolver(StubFetcher::new().with_delay(Duration::from_millis(20)));
    let loader = resolver.spawn_loader();

    let (a1, a2, b) = tokio::join!(loader.load("a"), loader.load("a"), loader.load("b"));
    let a1 = a1.unwrap();
    assert_eq!(a1, a2.unwrap());
    assert_eq!(a1.items.len(), 2);
    assert_eq!(b.unwrap().items.len(), 1);
    assert_eq!(fetcher.calls_for("acme/a1"), 1);
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_loader_reports_unknown_cluster_per_caller() {
    let (resolver, _fetcher) = resolver(StubFetcher::new());
    let loader = resolver.spawn_loader();

    let (good, bad) = tokio::join!(loader.load("b"), loader.load("ghost"));
    assert!(good.is_ok());
    assert_eq!(
      bad.unwrap_err(),
      ResolveError::UnknownCluster("ghost".to_string())
    );
  }

  #[tokio::test]
  async fn test_force_refresh_all_refetches_everything() {
    let (resolver, fetcher) = resolver(StubFetcher::new());
    resolver.resolve(&keys(&["a", "b"])).await;
    assert_eq!(fetcher.calls(), 2);

    let batch = resolver.force_refresh_all().await;
    assert_eq!(fetcher.calls(), 4);
    assert_eq!(batch.per_cluster.len(), 3);
    assert!(batch
      .per_cluster
      .values()
      .all(|r| !r.as_ref().unwrap().cached));
  }

  #[tokio::test]
  async fn test_batch_failure_is_per_cluster() {
    let (resolver, fetcher) = resolver(StubFetcher::new());
    fetcher.push_err(FetchError::Unavailable("down".to_string()));

    let batch = resolver.resolve(&keys(&["a"])).await;
    let a = batch.get("a").unwrap().as_ref().unwrap();
    assert!(a.items.is_empty());
    assert!(a.error.is_some());
    assert_eq!(batch.total_items, 0);
  }
}
