use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde_json::json;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::Config;
use crate::github::api_types::{alias, build_query, ApiRateLimit, ApiRepository, ApiResponse};
use crate::github::fetcher::{FetchError, FetchOutcome, RepoFetcher};
use crate::github::types::RepoItem;

/// Repositories requested per GraphQL document
const CHUNK_SIZE: usize = 25;

/// GitHub GraphQL implementation of `RepoFetcher`
#[derive(Clone)]
pub struct GithubFetcher {
  client: Client,
  endpoint: Url,
  token: Option<String>,
}

impl GithubFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    // A missing token is reported per fetch so cached data keeps being served
    let token = Config::get_api_token().ok();
    if token.is_none() {
      warn!("No GitHub token configured; upstream fetches will fail with an auth error");
    }

    let client = Client::builder()
      .user_agent(concat!("repocache/", env!("CARGO_PKG_VERSION")))
      .timeout(config.cache.fetch_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      endpoint: config.github.endpoint()?,
      token,
    })
  }

  /// Fetch one chunk of members with a single GraphQL request
  async fn fetch_chunk(&self, members: &[String]) -> Result<FetchOutcome, FetchError> {
    let token = self
      .token
      .as_deref()
      .ok_or_else(|| FetchError::Auth("no GitHub token configured".to_string()))?;

    // Positions in `repos` line up with the aliases in the query
    let requested: Vec<(&String, (&str, &str))> = members
      .iter()
      .filter_map(|m| match split_member(m) {
        Some(pair) => Some((m, pair)),
        None => {
          warn!(member = %m, "Skipping member that is not an owner/name pair");
          None
        }
      })
      .collect();
    if requested.is_empty() {
      return Ok(FetchOutcome::default());
    }

    let repos: Vec<(&str, &str)> = requested.iter().map(|(_, pair)| *pair).collect();
    let body = json!({ "query": build_query(&repos) });

    let response = self
      .client
      .post(self.endpoint.clone())
      .bearer_auth(token)
      .json(&body)
      .send()
      .await
      .map_err(|e| FetchError::Unavailable(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(classify_status(status, response.headers()));
    }

    let text = response
      .text()
      .await
      .map_err(|e| FetchError::Unavailable(e.to_string()))?;

    let parsed: ApiResponse = serde_json::from_str(&text).map_err(|e| {
      error!(error = %e, body = %text, "Failed to parse GitHub response");
      FetchError::Malformed(e.to_string())
    })?;

    if let Some(err) = parsed.errors.iter().find(|e| e.is_rate_limited()) {
      warn!(message = %err.message, "GitHub reported rate limiting");
      return Err(FetchError::RateLimited { reset_at: None });
    }

    let Some(mut data) = parsed.data else {
      let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
      error!(errors = ?messages, body = %text, "GitHub response carried no data");
      return Err(FetchError::Malformed(messages.join("; ")));
    };

    for err in parsed.errors.iter().filter(|e| !e.is_not_found()) {
      warn!(kind = ?err.kind, message = %err.message, "GitHub returned a partial error");
    }

    let rate_limit = match data.remove("rateLimit") {
      Some(value) if !value.is_null() => {
        let limit: ApiRateLimit = serde_json::from_value(value)
          .map_err(|e| FetchError::Malformed(format!("rateLimit: {}", e)))?;
        Some(limit.into())
      }
      _ => None,
    };

    let mut items = Vec::with_capacity(requested.len());
    for (index, (member, _)) in requested.iter().enumerate() {
      match data.remove(&alias(index)) {
        Some(value) if !value.is_null() => {
          let repo: ApiRepository = serde_json::from_value(value.clone()).map_err(|e| {
            error!(member = %member, error = %e, value = %value, "Failed to parse repository");
            FetchError::Malformed(format!("{}: {}", member, e))
          })?;
          items.push(RepoItem::from(repo));
        }
        _ => debug!(member = %member, "Repository no longer exists upstream, dropping"),
      }
    }

    Ok(FetchOutcome { items, rate_limit })
  }
}

impl RepoFetcher for GithubFetcher {
  async fn fetch(&self, members: &[String]) -> Result<FetchOutcome, FetchError> {
    let mut outcome = FetchOutcome::default();

    for chunk in members.chunks(CHUNK_SIZE) {
      let part = self.fetch_chunk(chunk).await?;
      outcome.items.extend(part.items);
      if part.rate_limit.is_some() {
        outcome.rate_limit = part.rate_limit;
      }
    }

    Ok(outcome)
  }
}

/// Split an `owner/name` member identifier
pub fn split_member(member: &str) -> Option<(&str, &str)> {
  let (owner, name) = member.split_once('/')?;
  if owner.is_empty() || name.is_empty() || name.contains('/') {
    return None;
  }
  Some((owner, name))
}

/// Map a non-success HTTP status onto the fetch error taxonomy
fn classify_status(status: StatusCode, headers: &HeaderMap) -> FetchError {
  let remaining = header_u64(headers, "x-ratelimit-remaining");
  let reset_at = header_u64(headers, "x-ratelimit-reset")
    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));

  match status {
    StatusCode::UNAUTHORIZED => FetchError::Auth(format!("HTTP {}", status)),
    StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { reset_at },
    StatusCode::FORBIDDEN if remaining == Some(0) || headers.contains_key("retry-after") => {
      FetchError::RateLimited { reset_at }
    }
    StatusCode::FORBIDDEN => FetchError::Auth(format!("HTTP {}", status)),
    _ => FetchError::Unavailable(format!("HTTP {}", status)),
  }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
  headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  #[test]
  fn test_split_member() {
    assert_eq!(split_member("rust-lang/rust"), Some(("rust-lang", "rust")));
    assert_eq!(split_member("rust"), None);
    assert_eq!(split_member("/rust"), None);
    assert_eq!(split_member("a/b/c"), None);
  }

  #[test]
  fn test_classify_unauthorized() {
    let err = classify_status(StatusCode::UNAUTHORIZED, &HeaderMap::new());
    assert!(matches!(err, FetchError::Auth(_)));
  }

  #[test]
  fn test_classify_forbidden_with_exhausted_quota() {
    let mut headers = HeaderMap::new();
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
    headers.insert("x-ratelimit-reset", HeaderValue::from_static("1800000000"));

    match classify_status(StatusCode::FORBIDDEN, &headers) {
      FetchError::RateLimited { reset_at } => {
        assert_eq!(reset_at.map(|t| t.timestamp()), Some(1_800_000_000));
      }
      other => panic!("expected rate limit, got {:?}", other),
    }
  }

  #[test]
  fn test_classify_plain_forbidden_is_auth() {
    let err = classify_status(StatusCode::FORBIDDEN, &HeaderMap::new());
    assert!(matches!(err, FetchError::Auth(_)));
  }

  #[test]
  fn test_classify_server_error() {
    let err = classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new());
    assert!(matches!(err, FetchError::Unavailable(_)));
  }
}
