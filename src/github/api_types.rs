//! Serde-deserializable types matching GitHub GraphQL responses.
//!
//! These types are separate from the cached `RepoItem` so the wire format can
//! change without touching what is stored.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{LanguageShare, RateLimit, RepoItem};

/// Languages kept per repository
pub const MAX_LANGUAGES: usize = 3;

/// Topics requested per repository
pub const MAX_TOPICS: usize = 5;

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiResponse {
  /// Aliased repository selections plus `rateLimit`
  pub data: Option<Map<String, Value>>,
  #[serde(default)]
  pub errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
  #[serde(rename = "type")]
  pub kind: Option<String>,
  #[serde(default)]
  pub message: String,
}

impl ApiError {
  pub fn is_not_found(&self) -> bool {
    self.kind.as_deref() == Some("NOT_FOUND")
  }

  pub fn is_rate_limited(&self) -> bool {
    self.kind.as_deref() == Some("RATE_LIMITED")
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRateLimit {
  pub remaining: u64,
  pub reset_at: Option<DateTime<Utc>>,
}

impl From<ApiRateLimit> for RateLimit {
  fn from(r: ApiRateLimit) -> Self {
    RateLimit {
      remaining: r.remaining,
      reset_at: r.reset_at,
    }
  }
}

// ============================================================================
// Repository selection
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRepository {
  pub name_with_owner: String,
  pub name: String,
  pub url: String,
  pub description: Option<String>,
  #[serde(default)]
  pub stargazer_count: u64,
  pub updated_at: DateTime<Utc>,
  pub repository_topics: Option<ApiTopicConnection>,
  pub languages: Option<ApiLanguageConnection>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTopicConnection {
  #[serde(default)]
  pub nodes: Vec<ApiTopicNode>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTopicNode {
  pub topic: ApiTopic,
}

#[derive(Debug, Deserialize)]
pub struct ApiTopic {
  pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiLanguageConnection {
  #[serde(default)]
  pub edges: Vec<ApiLanguageEdge>,
}

#[derive(Debug, Deserialize)]
pub struct ApiLanguageEdge {
  pub size: u64,
  pub node: ApiLanguage,
}

#[derive(Debug, Deserialize)]
pub struct ApiLanguage {
  pub name: String,
}

// ============================================================================
// Conversions
// ============================================================================

impl From<ApiRepository> for RepoItem {
  fn from(repo: ApiRepository) -> Self {
    let mut languages: Vec<LanguageShare> = repo
      .languages
      .map(|l| {
        l.edges
          .into_iter()
          .map(|e| LanguageShare {
            name: e.node.name,
            size: e.size,
          })
          .collect()
      })
      .unwrap_or_default();
    // Requested ordered by size already; keep the guarantee locally too
    languages.sort_by(|a, b| b.size.cmp(&a.size));
    languages.truncate(MAX_LANGUAGES);

    RepoItem {
      id: repo.name_with_owner,
      name: repo.name,
      url: repo.url,
      description: repo.description.filter(|d| !d.trim().is_empty()),
      stars: repo.stargazer_count,
      updated_at: repo.updated_at,
      topics: repo
        .repository_topics
        .map(|t| t.nodes.into_iter().map(|n| n.topic.name).collect())
        .unwrap_or_default(),
      languages,
      display_name: None,
      featured: false,
    }
  }
}

// ============================================================================
// Query building
// ============================================================================

/// Alias used for the member at `index` in a query
pub fn alias(index: usize) -> String {
  format!("r{}", index)
}

const REPOSITORY_FIELDS: &str = "nameWithOwner name url description stargazerCount updatedAt \
  repositoryTopics(first: __TOPICS__) { nodes { topic { name } } } \
  languages(first: __LANGS__, orderBy: {field: SIZE, direction: DESC}) { edges { size node { name } } }";

/// Build one GraphQL document selecting every `(owner, name)` pair under
/// its positional alias.
pub fn build_query(repos: &[(&str, &str)]) -> String {
  let fields = REPOSITORY_FIELDS
    .replace("__TOPICS__", &MAX_TOPICS.to_string())
    .replace("__LANGS__", &MAX_LANGUAGES.to_string());

  let mut query = String::from("query { rateLimit { remaining resetAt } ");
  for (index, (owner, name)) in repos.iter().enumerate() {
    // JSON string escaping is valid GraphQL string escaping
    query.push_str(&format!(
      "{}: repository(owner: {}, name: {}) {{ {} }} ",
      alias(index),
      Value::from(*owner),
      Value::from(*name),
      fields
    ));
  }
  query.push('}');
  query
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_build_query_aliases_each_repo() {
    let query = build_query(&[("rust-lang", "rust"), ("tokio-rs", "tokio")]);
    assert!(query.contains(r#"r0: repository(owner: "rust-lang", name: "rust")"#));
    assert!(query.contains(r#"r1: repository(owner: "tokio-rs", name: "tokio")"#));
    assert!(query.contains("rateLimit { remaining resetAt }"));
    assert!(query.contains("languages(first: 3"));
  }

  #[test]
  fn test_build_query_escapes_quotes() {
    let query = build_query(&[("evil\"owner", "name")]);
    assert!(query.contains(r#"owner: "evil\"owner""#));
  }

  #[test]
  fn test_repository_converts_to_item() {
    let repo: ApiRepository = serde_json::from_value(json!({
      "nameWithOwner": "acme/widget",
      "name": "widget",
      "url": "https://github.com/acme/widget",
      "description": "   ",
      "stargazerCount": 42,
      "updatedAt": "2026-03-01T10:00:00Z",
      "repositoryTopics": { "nodes": [{ "topic": { "name": "cli" } }] },
      "languages": { "edges": [
        { "size": 10, "node": { "name": "Shell" } },
        { "size": 500, "node": { "name": "Rust" } },
        { "size": 40, "node": { "name": "Python" } },
        { "size": 30, "node": { "name": "Nix" } }
      ] }
    }))
    .unwrap();

    let item = RepoItem::from(repo);
    assert_eq!(item.id, "acme/widget");
    assert_eq!(item.stars, 42);
    assert_eq!(item.description, None);
    assert_eq!(item.topics, vec!["cli".to_string()]);
    let names: Vec<&str> = item.languages.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["Rust", "Python", "Nix"]);
  }

  #[test]
  fn test_error_kinds() {
    let resp: ApiResponse = serde_json::from_value(json!({
      "data": { "r0": null },
      "errors": [{ "type": "NOT_FOUND", "message": "Could not resolve" }]
    }))
    .unwrap();
    assert!(resp.errors[0].is_not_found());
    assert!(!resp.errors[0].is_rate_limited());
    assert!(resp.data.unwrap().get("r0").unwrap().is_null());
  }
}
