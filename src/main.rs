use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use repocache::cache::{
  BatchResolver, BatchResponse, CacheStore, Freshness, RefreshOrchestrator, SqliteStore,
};
use repocache::config::Config;
use repocache::github::{GithubFetcher, RepoFetcher};

#[derive(Parser, Debug)]
#[command(name = "repocache")]
#[command(about = "Cached repository metadata for project showcases")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/repocache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the repositories of one cluster
  Get {
    cluster: String,
    /// Fetch upstream even if the cache is fresh
    #[arg(long)]
    force: bool,
  },
  /// Print several clusters resolved as one batch
  Batch {
    #[arg(required = true)]
    clusters: Vec<String>,
  },
  /// Mark a cluster, or every cluster, as stale
  Invalidate { cluster: Option<String> },
  /// Refetch every configured cluster
  RefreshAll,
  /// Show the state of every cached cluster
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_file.as_deref())?;

  let config = Arc::new(Config::load(args.config.as_deref())?);
  let store = Arc::new(SqliteStore::open(&config.database_path()?)?);
  let fetcher = Arc::new(GithubFetcher::new(&config)?);
  let resolver = BatchResolver::new(RefreshOrchestrator::new(
    store,
    fetcher,
    Arc::clone(&config),
  ));

  let result = run(args.command, &resolver).await;

  // Let background refreshes started by this invocation land before exit
  resolver.orchestrator().drain_background().await;
  let stats = resolver.orchestrator().stats();
  info!(
    fetches = stats.fetches,
    background_refreshes = stats.background_refreshes,
    background_failures = stats.background_failures,
    "Refresh summary"
  );
  if let Some(limit) = resolver.orchestrator().rate_limit() {
    info!(remaining = limit.remaining, reset_at = ?limit.reset_at, "GitHub rate limit");
  }

  result
}

async fn run<S, F>(command: Command, resolver: &BatchResolver<S, F>) -> Result<()>
where
  S: CacheStore + 'static,
  F: RepoFetcher + 'static,
{
  let cache = resolver.orchestrator();

  match command {
    Command::Get { cluster, force } => {
      let response = if force {
        cache.force_refresh(&cluster).await?
      } else {
        cache.get_cluster(&cluster).await?
      };
      print_json(&serde_json::to_value(&response)?)
    }
    Command::Batch { clusters } => {
      let batch = resolver.resolve(&clusters).await;
      print_json(&batch_json(&batch)?)
    }
    Command::Invalidate { cluster } => {
      let count = cache.invalidate(cluster.as_deref())?;
      println!("Invalidated {} cluster(s)", count);
      Ok(())
    }
    Command::RefreshAll => {
      let batch = resolver.force_refresh_all().await;
      print_json(&batch_json(&batch)?)
    }
    Command::Status => {
      let records = cache.manager().list()?;
      let now = Utc::now();
      println!(
        "{:<24} {:<11} {:<12} {:>6}  {:<34} LAST ERROR",
        "CLUSTER", "STATUS", "FRESHNESS", "ERRORS", "FETCHED AT"
      );
      for record in &records {
        let freshness = match cache.config().cluster(&record.cluster_key) {
          Some(cluster) => {
            let ttl = cache.config().cache.ttl_for(cluster);
            match cache.manager().freshness(record, ttl, now) {
              Freshness::Fresh => "fresh".to_string(),
              Freshness::Stale => "stale".to_string(),
              Freshness::Refreshing => "refreshing".to_string(),
              Freshness::BackingOff(until) => format!("until {}", until.format("%H:%M:%S")),
            }
          }
          None => "unconfigured".to_string(),
        };
        println!(
          "{:<24} {:<11} {:<12} {:>6}  {:<34} {}",
          record.cluster_key,
          record.status,
          freshness,
          record.error_count,
          record
            .fetched_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
          record.last_error.as_deref().unwrap_or("")
        );
      }
      for key in cache.config().clusters.keys() {
        if !records.iter().any(|r| &r.cluster_key == key) {
          println!("{:<24} {:<11}", key, "uncached");
        }
      }
      Ok(())
    }
  }
}

fn batch_json(batch: &BatchResponse) -> Result<Value> {
  let mut per_cluster = Map::new();
  for (key, result) in &batch.per_cluster {
    let value = match result {
      Ok(response) => serde_json::to_value(response)?,
      Err(e) => json!({ "error": e.to_string() }),
    };
    per_cluster.insert(key.clone(), value);
  }

  Ok(json!({
    "per_cluster": per_cluster,
    "total_items": batch.total_items,
    "timestamp": batch.timestamp,
  }))
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Log to stderr, or to `log_file` through a non-blocking writer.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repocache=info"));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}
