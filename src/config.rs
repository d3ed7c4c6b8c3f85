use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Version string naming the current cache; changing it invalidates all others
  pub cache_name: String,
  /// Origin the app is served from; relative URLs resolve against it
  pub origin: String,
  /// Requests whose URL starts with this prefix take the network-first path
  pub api_base: String,
  /// Same-origin paths under this prefix are treated as static assets
  pub static_prefix: String,
  /// API paths containing this substring get the dashboard offline stub
  pub dashboard_marker: String,
  /// Paths fetched and stored on install
  pub precache: Vec<String>,
  pub precache_mode: PrecacheMode,
  /// Path fragment identifying submissions replayed by background sync
  pub sync_endpoint: String,
  pub fetch_timeout_secs: u64,
  /// Cache database location (default: $XDG_DATA_HOME/wbs-sw/cache.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrecacheMode {
  /// Any failed URL fails the whole install and nothing is stored
  #[default]
  Strict,
  /// Store what could be fetched, log the rest
  Lenient,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: "wbs-pwa-v1.0.0".to_string(),
      origin: "http://localhost:8080".to_string(),
      api_base: "https://mshadiant0.app.n8n.cloud/webhook".to_string(),
      static_prefix: "/".to_string(),
      dashboard_marker: "dashboard".to_string(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/icons/icon-192.png".to_string(),
        "/icons/icon-512.png".to_string(),
      ],
      precache_mode: PrecacheMode::default(),
      sync_endpoint: "/wbs-submit".to_string(),
      fetch_timeout_secs: 30,
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./wbs-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/wbs-sw/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("wbs-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("wbs-sw").join("config.yaml");
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
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    self.origin_url()?;
    Url::parse(&self.api_base).map_err(|e| eyre!("api_base is not a valid URL: {}", e))?;
    if !self.static_prefix.starts_with('/') {
      return Err(eyre!("static_prefix must start with '/'"));
    }
    Ok(())
  }

  /// Apply `WBS_SW_DATABASE`, which overrides the configured database path.
  fn with_env_overrides(self) -> Self {
    match std::env::var_os("WBS_SW_DATABASE") {
      Some(path) => Self {
        database: Some(PathBuf::from(path)),
        ..self
      },
      None => self,
    }
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("origin is not a valid URL: {}", e))
  }

  /// Resolve a path or absolute URL against the app origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }

  /// Root URL of the app, opened on notification click.
  pub fn app_root(&self) -> Result<Url> {
    self.resolve("/")
  }

  /// URL refreshed by the `update-dashboard` periodic sync.
  pub fn dashboard_url(&self) -> Result<Url> {
    let url = format!("{}/wbs-dashboard", self.api_base.trim_end_matches('/'));
    Url::parse(&url).map_err(|e| eyre!("Invalid dashboard URL '{}': {}", url, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_defaults_match_deployed_worker() {
    let config = Config::default();
    assert_eq!(config.cache_name, "wbs-pwa-v1.0.0");
    assert_eq!(config.precache.len(), 5);
    assert_eq!(config.precache_mode, PrecacheMode::Strict);
    assert_eq!(
      config.dashboard_url().unwrap().as_str(),
      "https://mshadiant0.app.n8n.cloud/webhook/wbs-dashboard"
    );
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "cache_name: wbs-pwa-v2\nprecache_mode: lenient\norigin: https://wbs.example.org\n",
    )
    .unwrap();

    assert_eq!(config.cache_name, "wbs-pwa-v2");
    assert_eq!(config.precache_mode, PrecacheMode::Lenient);
    assert_eq!(config.api_base, Config::default().api_base);
    assert_eq!(
      config.resolve("/index.html").unwrap().as_str(),
      "https://wbs.example.org/index.html"
    );
  }

  #[test]
  fn test_rejects_invalid_values() {
    assert!(Config::from_yaml("static_prefix: assets/\n").is_err());
    assert!(Config::from_yaml("cache_name: ''\n").is_err());
    assert!(Config::from_yaml("origin: not a url\n").is_err());
  }

  #[test]
  fn test_example_config_parses() {
    let config = Config::from_yaml(include_str!("../config.example.yaml")).unwrap();
    assert_eq!(config.precache, Config::default().precache);
    assert_eq!(config.cache_name, Config::default().cache_name);
  }

  #[test]
  fn test_resolve_keeps_absolute_urls() {
    let config = Config::default();
    let url = config.resolve("https://cdn.example.com/lib.js").unwrap();
    assert_eq!(url.as_str(), "https://cdn.example.com/lib.js");
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let missing = temp_dir.path().join("nope.yaml");
    assert!(Config::load(Some(missing.as_path())).is_err());
  }

  #[test]
  fn test_load_explicit_file() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("config.yaml");
    std::fs::write(&path, "sync_endpoint: /reports\nfetch_timeout_secs: 5\n").unwrap();

    let config = Config::load(Some(path.as_path())).unwrap();
    assert_eq!(config.sync_endpoint, "/reports");
    assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
  }
}
