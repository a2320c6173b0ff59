use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::github::client::split_member;
use crate::github::RepoItem;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub github: GithubConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  /// Cluster key -> members
  #[serde(default)]
  pub clusters: BTreeMap<String, ClusterConfig>,
  /// Per-repository presentation overrides, keyed by `owner/name`
  #[serde(default)]
  pub overrides: BTreeMap<String, RepoOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
  /// GraphQL endpoint
  #[serde(default = "default_api_url")]
  pub api_url: String,
}

impl Default for GithubConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
    }
  }
}

fn default_api_url() -> String {
  "https://api.github.com/graphql".to_string()
}

impl GithubConfig {
  pub fn endpoint(&self) -> Result<Url> {
    Url::parse(&self.api_url).map_err(|e| eyre!("Invalid github.api_url '{}': {}", self.api_url, e))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClusterConfig {
  /// Active clusters use the shorter TTL
  #[serde(default)]
  pub active: bool,
  /// Ordered `owner/name` identifiers
  #[serde(default)]
  pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RepoOverride {
  pub display_name: Option<String>,
  #[serde(default)]
  pub featured: bool,
}

/// Cache tunables
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// SQLite file (defaults to the user data directory)
  pub database: Option<PathBuf>,
  pub ttl_hours: u64,
  pub active_ttl_hours: u64,
  /// Consecutive failures before a cluster is marked `error`
  pub error_threshold: u32,
  pub error_backoff_minutes: u64,
  pub background_refresh: bool,
  pub fetch_timeout_secs: u64,
  /// A `refreshing` status older than this is eligible for retry; `None` never expires
  pub refreshing_lease_minutes: Option<u64>,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      database: None,
      ttl_hours: 6,
      active_ttl_hours: 1,
      error_threshold: 3,
      error_backoff_minutes: 60,
      background_refresh: true,
      fetch_timeout_secs: 20,
      refreshing_lease_minutes: Some(15),
    }
  }
}

/// Upper bound for every hour/minute tunable: ten years
const MAX_HOURS: u64 = 24 * 365 * 10;
const MAX_MINUTES: u64 = MAX_HOURS * 60;

impl CacheSettings {
  /// Reject values that cannot be turned into durations safely.
  pub fn validate(&self) -> Result<()> {
    let hours = [
      ("cache.ttl_hours", self.ttl_hours),
      ("cache.active_ttl_hours", self.active_ttl_hours),
    ];
    for (name, value) in hours {
      if value > MAX_HOURS {
        return Err(eyre!("{} must be at most {} (got {})", name, MAX_HOURS, value));
      }
    }

    let minutes = [
      ("cache.error_backoff_minutes", Some(self.error_backoff_minutes)),
      ("cache.refreshing_lease_minutes", self.refreshing_lease_minutes),
    ];
    for (name, value) in minutes {
      if let Some(value) = value.filter(|v| *v > MAX_MINUTES) {
        return Err(eyre!("{} must be at most {} (got {})", name, MAX_MINUTES, value));
      }
    }

    if self.error_threshold == 0 {
      return Err(eyre!("cache.error_threshold must be at least 1"));
    }
    Ok(())
  }

  pub fn ttl_for(&self, cluster: &ClusterConfig) -> Duration {
    if cluster.active {
      Duration::hours(self.active_ttl_hours as i64)
    } else {
      Duration::hours(self.ttl_hours as i64)
    }
  }

  pub fn error_backoff(&self) -> Duration {
    Duration::minutes(self.error_backoff_minutes as i64)
  }

  pub fn refreshing_lease(&self) -> Option<Duration> {
    self
      .refreshing_lease_minutes
      .map(|m| Duration::minutes(m as i64))
  }

  pub fn fetch_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.fetch_timeout_secs)
  }

  /// Apply `REPOCACHE_*` environment overrides.
  pub fn apply_env(&mut self) -> Result<()> {
    self.apply_overrides(|name| std::env::var(name).ok())
  }

  fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(v) = lookup("REPOCACHE_TTL_HOURS") {
      self.ttl_hours = parse_env("REPOCACHE_TTL_HOURS", &v)?;
    }
    if let Some(v) = lookup("REPOCACHE_ACTIVE_TTL_HOURS") {
      self.active_ttl_hours = parse_env("REPOCACHE_ACTIVE_TTL_HOURS", &v)?;
    }
    if let Some(v) = lookup("REPOCACHE_ERROR_THRESHOLD") {
      self.error_threshold = parse_env("REPOCACHE_ERROR_THRESHOLD", &v)?;
    }
    if let Some(v) = lookup("REPOCACHE_BACKGROUND_REFRESH") {
      self.background_refresh = match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        other => return Err(eyre!("Invalid REPOCACHE_BACKGROUND_REFRESH value: {}", other)),
      };
    }
    Ok(())
  }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
  T::Err: std::fmt::Display,
{
  value
    .trim()
    .parse()
    .map_err(|e| eyre!("Invalid {} value '{}': {}", name, value, e))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./repocache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/repocache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/repocache/config.yaml"
        ))
      }
    };
    config.cache.apply_env()?;
    config.cache.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("repocache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("repocache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    for (key, cluster) in &self.clusters {
      if let Some(bad) = cluster.members.iter().find(|m| split_member(m).is_none()) {
        return Err(eyre!(
          "Cluster '{}' has member '{}' which is not an owner/name pair",
          key,
          bad
        ));
      }
    }
    self.github.endpoint()?;
    self.cache.validate()
  }

  pub fn cluster(&self, key: &str) -> Option<&ClusterConfig> {
    self.clusters.get(key)
  }

  /// Apply presentation overrides to items about to be returned
  pub fn apply_overrides(&self, items: &mut [RepoItem]) {
    for item in items {
      if let Some(o) = self.overrides.get(&item.id) {
        item.display_name = o.display_name.clone();
        item.featured = o.featured;
      }
    }
  }

  /// Path of the SQLite cache database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("repocache").join("cache.db"))
  }

  /// Get the GitHub API token from environment variables.
  ///
  /// Checks REPOCACHE_GITHUB_TOKEN first, then GITHUB_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("REPOCACHE_GITHUB_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .map_err(|_| {
        eyre!("GitHub token not found. Set REPOCACHE_GITHUB_TOKEN or GITHUB_TOKEN environment variable.")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::github::fetcher::testing::item;
  use std::collections::HashMap;

  const SAMPLE: &str = r#"
cache:
  ttl_hours: 12
  refreshing_lease_minutes: null
clusters:
  cinder:
    active: true
    members: [acme/one, acme/two]
  quiet:
    members: []
overrides:
  acme/one:
    display_name: "One!"
    featured: true
"#;

  #[test]
  fn test_parse_sample() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    assert_eq!(config.cache.ttl_hours, 12);
    assert_eq!(config.cache.active_ttl_hours, 1);
    assert_eq!(config.cache.error_threshold, 3);
    assert_eq!(config.cache.refreshing_lease(), None);
    assert_eq!(
      config.github.endpoint().unwrap().as_str(),
      "https://api.github.com/graphql"
    );

    let cinder = config.cluster("cinder").unwrap();
    assert_eq!(cinder.members, vec!["acme/one", "acme/two"]);
    assert_eq!(config.cache.ttl_for(cinder), Duration::hours(1));
    let quiet = config.cluster("quiet").unwrap();
    assert_eq!(config.cache.ttl_for(quiet), Duration::hours(12));
  }

  #[test]
  fn test_rejects_malformed_member() {
    let err = Config::from_yaml("clusters:\n  x:\n    members: [not-a-pair]\n").unwrap_err();
    assert!(err.to_string().contains("not-a-pair"));
  }

  #[test]
  fn test_rejects_bad_endpoint() {
    assert!(Config::from_yaml("github:\n  api_url: not a url\n").is_err());
  }

  #[test]
  fn test_apply_overrides() {
    let config = Config::from_yaml(SAMPLE).unwrap();
    let mut items = vec![item("acme/one", 1), item("acme/two", 2)];
    config.apply_overrides(&mut items);
    assert_eq!(items[0].display_name.as_deref(), Some("One!"));
    assert!(items[0].featured);
    assert_eq!(items[1].display_name, None);
    assert!(!items[1].featured);
  }

  #[test]
  fn test_env_overrides() {
    let env: HashMap<&str, &str> = [
      ("REPOCACHE_TTL_HOURS", "24"),
      ("REPOCACHE_ERROR_THRESHOLD", "5"),
      ("REPOCACHE_BACKGROUND_REFRESH", "off"),
    ]
    .into_iter()
    .collect();

    let mut settings = CacheSettings::default();
    settings
      .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
      .unwrap();
    assert_eq!(settings.ttl_hours, 24);
    assert_eq!(settings.active_ttl_hours, 1);
    assert_eq!(settings.error_threshold, 5);
    assert!(!settings.background_refresh);
  }

  #[test]
  fn test_env_override_rejects_garbage() {
    let mut settings = CacheSettings::default();
    let result = settings.apply_overrides(|name| {
      (name == "REPOCACHE_TTL_HOURS").then(|| "soon".to_string())
    });
    assert!(result.is_err());
  }

  #[test]
  fn test_rejects_oversized_durations() {
    let err = Config::from_yaml("cache:\n  ttl_hours: 9000000000000000\n").unwrap_err();
    assert!(err.to_string().contains("ttl_hours"));

    let err = Config::from_yaml("cache:\n  refreshing_lease_minutes: 18446744073709551615\n").unwrap_err();
    assert!(err.to_string().contains("refreshing_lease_minutes"));

    assert!(Config::from_yaml("cache:\n  error_threshold: 0\n").is_err());
    assert!(Config::from_yaml("cache:\n  ttl_hours: 87600\n").is_ok());
  }

  #[test]
  fn test_env_override_is_validated() {
    let mut settings = CacheSettings::default();
    settings
      .apply_overrides(|name| {
        (name == "REPOCACHE_ACTIVE_TTL_HOURS").then(|| "9000000000000000".to_string())
      })
      .unwrap();
    assert!(settings.validate().is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("repocache.yaml");
    std::fs::write(&path, SAMPLE).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.clusters.len(), 2);
  }

  #[test]
  fn test_load_missing_explicit_path() {
    let result = Config::load(Some(Path::new("/definitely/not/here.yaml")));
    assert!(result.is_err());
  }
}
