use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Repository metadata as cached for a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoItem {
  /// `owner/name` identifier, matches the configured member name
  pub id: String,
  pub name: String,
  pub url: String,
  pub description: Option<String>,
  pub stars: u64,
  pub updated_at: DateTime<Utc>,
  #[serde(default)]
  pub topics: Vec<String>,
  /// Up to three languages, largest first
  #[serde(default)]
  pub languages: Vec<LanguageShare>,
  /// Set from configuration overrides at response time, never cached
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub display_name: Option<String>,
  #[serde(default)]
  pub featured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageShare {
  pub name: String,
  /// Bytes of code in this language
  pub size: u64,
}

/// Rate-limit snapshot reported by the upstream API alongside a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
  pub remaining: u64,
  pub reset_at: Option<DateTime<Utc>>,
}
