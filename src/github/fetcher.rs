//! Contract between the cache and the upstream source-control API.

use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

use super::types::{RateLimit, RepoItem};

/// Errors reported by an upstream fetch.
///
/// Cloneable so a single fetch result can be handed to every caller
/// waiting on the same refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  /// Credentials missing or rejected. Not retried until the backoff elapses.
  #[error("upstream authentication failed: {0}")]
  Auth(String),

  /// Quota exhausted
  #[error("upstream rate limit exceeded{}", reset_suffix(.reset_at))]
  RateLimited { reset_at: Option<DateTime<Utc>> },

  /// Network failure, timeout or 5xx
  #[error("upstream unavailable: {0}")]
  Unavailable(String),

  /// Response could not be interpreted
  #[error("malformed upstream response: {0}")]
  Malformed(String),
}

fn reset_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
  match reset_at {
    Some(at) => format!(" (resets at {})", at.to_rfc3339()),
    None => String::new(),
  }
}

/// Successful fetch result.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
  /// One item per member that still exists upstream, in member order
  pub items: Vec<RepoItem>,
  pub rate_limit: Option<RateLimit>,
}

/// Something that can retrieve current metadata for a list of members.
///
/// Implementations never touch the cache store. An empty member list must
/// resolve to an empty outcome without any network call.
pub trait RepoFetcher: Send + Sync {
  fn fetch(
    &self,
    members: &[String],
  ) -> impl Future<Output = Result<FetchOutcome, FetchError>> + Send;
}
