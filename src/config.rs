use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::SyncType;

/// Network timeout applied when neither the strategy nor `network` sets one.
pub const DEFAULT_NETWORK_TIMEOUT_SECONDS: u64 = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub app: AppConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub manifest: ManifestConfig,
  /// Declaration order matters: the first matching strategy wins
  #[serde(default)]
  pub strategies: Vec<StrategyConfig>,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  pub name: String,
  pub version: String,
  /// Base URL that relative manifest and sync paths resolve against
  pub origin: String,
  /// Prefix of sync tags (defaults to the app name)
  pub sync_prefix: Option<String>,
  /// Activate right after install instead of waiting for SKIP_WAITING
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// Take control of already-open tabs on activation
  #[serde(default = "default_true")]
  pub clients_claim: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_seconds: DEFAULT_NETWORK_TIMEOUT_SECONDS,
    }
  }
}

/// What gets pre-cached on install.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestConfig {
  #[serde(default)]
  pub static_assets: Vec<String>,
  #[serde(default)]
  pub offline_pages: Vec<String>,
  #[serde(default)]
  pub critical_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
  pub name: String,
  pub algorithm: Algorithm,
  /// Substring patterns; `*` matches any run of characters
  pub url_patterns: Vec<String>,
  pub max_entries: Option<usize>,
  pub max_age_seconds: Option<u64>,
  pub network_timeout_seconds: Option<u64>,
}

impl StrategyConfig {
  pub fn max_age(&self) -> Option<Duration> {
    self.max_age_seconds.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Endpoints re-fetched per sync type
  #[serde(default = "default_routines")]
  pub routines: BTreeMap<String, Vec<String>>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      routines: default_routines(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_timeout_seconds() -> u64 {
  DEFAULT_NETWORK_TIMEOUT_SECONDS
}

fn default_routines() -> BTreeMap<String, Vec<String>> {
  BTreeMap::from([
    (
      SyncType::Requests.as_str().to_string(),
      vec!["/api/delivery-requests".to_string()],
    ),
    (
      SyncType::Estimates.as_str().to_string(),
      vec!["/api/pricing/fallback-rates".to_string()],
    ),
    (
      SyncType::Analytics.as_str().to_string(),
      vec!["/api/analytics/summary".to_string()],
    ),
  ])
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-agent/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-agent/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-agent").join("config.yaml");
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

  /// Parse and validate a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.app.name.trim().is_empty() {
      return Err(eyre!("app.name must not be empty"));
    }
    if self.app.version.trim().is_empty() {
      return Err(eyre!("app.version must not be empty"));
    }
    url::Url::parse(&self.app.origin)
      .map_err(|e| eyre!("app.origin '{}' is not a valid URL: {}", self.app.origin, e))?;
    if self.network.timeout_seconds == 0 {
      return Err(eyre!("network.timeout_seconds must be positive"));
    }

    let mut names = BTreeSet::new();
    for strategy in &self.strategies {
      if strategy.name.trim().is_empty() {
        return Err(eyre!("Strategy names must not be empty"));
      }
      if !names.insert(strategy.name.as_str()) {
        return Err(eyre!("Duplicate strategy name '{}'", strategy.name));
      }
      if strategy.url_patterns.is_empty() || strategy.url_patterns.iter().any(|p| p.is_empty()) {
        return Err(eyre!(
          "Strategy '{}' needs at least one non-empty url pattern",
          strategy.name
        ));
      }
      if strategy.max_entries == Some(0) {
        return Err(eyre!("Strategy '{}': max_entries must be positive", strategy.name));
      }
      if strategy.network_timeout_seconds == Some(0) {
        return Err(eyre!(
          "Strategy '{}': network_timeout_seconds must be positive",
          strategy.name
        ));
      }
    }

    for sync_type in self.sync.routines.keys() {
      if let SyncType::Other(unknown) = SyncType::parse(sync_type) {
        return Err(eyre!("Unknown sync routine '{}'", unknown));
      }
    }

    Ok(())
  }

  pub fn sync_prefix(&self) -> &str {
    self.app.sync_prefix.as_deref().unwrap_or(&self.app.name)
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network.timeout_seconds)
  }

  /// Timeout for a strategy, falling back to the network default.
  pub fn strategy_timeout(&self, strategy: &StrategyConfig) -> Duration {
    strategy
      .network_timeout_seconds
      .map(Duration::from_secs)
      .unwrap_or_else(|| self.network_timeout())
  }

  /// Resolve a manifest or sync path against the origin.
  pub fn resolve_url(&self, path: &str) -> Result<String> {
    let origin = url::Url::parse(&self.app.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.app.origin, e))?;
    let resolved = origin
      .join(path)
      .map_err(|e| eyre!("Failed to resolve '{}' against {}: {}", path, origin, e))?;
    Ok(resolved.to_string())
  }
}

/// Directory for the cache database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offline-agent"))
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
app:
  name: courier
  version: "1"
  origin: https://app.test
"#;

  #[test]
  fn test_defaults() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    assert_eq!(config.network.timeout_seconds, 8);
    assert_eq!(config.sync_prefix(), "courier");
    assert!(config.app.skip_waiting);
    assert!(config.app.clients_claim);
    assert!(config.strategies.is_empty());
    assert_eq!(config.sync.routines.len(), 3);
    assert!(config.sync.routines.contains_key("requests"));
  }

  #[test]
  fn test_strategy_parsing() {
    let yaml = format!(
      "{}{}",
      MINIMAL,
      r#"
strategies:
  - name: business
    algorithm: network-first
    url_patterns: ["/api/business/"]
    max_entries: 50
  - name: assets
    algorithm: stale-while-revalidate
    url_patterns: ["/static/*.css"]
    network_timeout_seconds: 3
"#
    );
    let config = Config::from_yaml(&yaml).unwrap();
    assert_eq!(config.strategies.len(), 2);
    assert_eq!(config.strategies[0].algorithm, Algorithm::NetworkFirst);
    assert_eq!(config.strategies[0].max_entries, Some(50));
    assert_eq!(
      config.strategy_timeout(&config.strategies[0]),
      Duration::from_secs(8)
    );
    assert_eq!(
      config.strategy_timeout(&config.strategies[1]),
      Duration::from_secs(3)
    );
  }

  #[test]
  fn test_rejects_unknown_algorithm() {
    let yaml = format!(
      "{}{}",
      MINIMAL,
      r#"
strategies:
  - name: x
    algorithm: cache-maybe
    url_patterns: ["/x"]
"#
    );
    assert!(Config::from_yaml(&yaml).is_err());
  }

  #[test]
  fn test_rejects_duplicate_names() {
    let yaml = format!(
      "{}{}",
      MINIMAL,
      r#"
strategies:
  - name: x
    algorithm: cache-only
    url_patterns: ["/x"]
  - name: x
    algorithm: network-only
    url_patterns: ["/y"]
"#
    );
    let err = Config::from_yaml(&yaml).unwrap_err();
    assert!(err.to_string().contains("Duplicate"));
  }

  #[test]
  fn test_rejects_empty_patterns_and_zero_limits() {
    let no_patterns = format!(
      "{}{}",
      MINIMAL,
      "strategies:\n  - name: x\n    algorithm: cache-only\n    url_patterns: []\n"
    );
    assert!(Config::from_yaml(&no_patterns).is_err());

    let zero = format!(
      "{}{}",
      MINIMAL,
      "strategies:\n  - name: x\n    algorithm: cache-only\n    url_patterns: [\"/x\"]\n    max_entries: 0\n"
    );
    assert!(Config::from_yaml(&zero).is_err());
  }

  #[test]
  fn test_rejects_unknown_sync_routine() {
    let yaml = format!(
      "{}{}",
      MINIMAL,
      "sync:\n  routines:\n    invoices: [\"/api/invoices\"]\n"
    );
    assert!(Config::from_yaml(&yaml).is_err());
  }

  #[test]
  fn test_resolve_url() {
    let config = Config::from_yaml(MINIMAL).unwrap();
    assert_eq!(
      config.resolve_url("/api/business/profile").unwrap(),
      "https://app.test/api/business/profile"
    );
    assert_eq!(
      config.resolve_url("https://cdn.test/a.js").unwrap(),
      "https://cdn.test/a.js"
    );
  }
}
