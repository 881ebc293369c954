use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::BucketNames;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the worker sits in front of, e.g. `https://todo.example.com`
  pub origin: String,
  /// Bucket name prefix
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Bumped on every deploy; old buckets are evicted on activation
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub proxy: ProxyConfig,
  /// Cache database (default: $XDG_DATA_HOME/sw-cache/cache.db)
  pub database: Option<PathBuf>,
  /// Write daily-rotated logs here in addition to stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Application shell pre-cached at install time
  pub static_manifest: Vec<String>,
  /// Regexes matched against the path of API requests
  pub api_patterns: Vec<String>,
  pub static_prefix: String,
  pub static_extensions: Vec<String>,
  /// Served to navigations when offline with nothing cached
  pub offline_page: String,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      static_manifest: [
        "/",
        "/static/js/bundle.js",
        "/static/css/main.css",
        "/manifest.json",
        "/favicon.ico",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      api_patterns: vec![r"/api/todos".to_string(), r"/api/user".to_string()],
      static_prefix: "/static/".to_string(),
      static_extensions: [".js", ".css", ".png", ".jpg", ".ico"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
      offline_page: "/offline.html".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Give up on the network and fall back to cache after this long
  pub timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_ms: 10_000 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// One-shot sync tag
  pub tag: String,
  /// Periodic sync tag
  pub periodic_tag: String,
  /// Write endpoint queued mutations are replayed against
  pub replay_endpoint: String,
  /// Failed replays before a mutation is dead-lettered
  pub max_attempts: u32,
  /// Periodic sync period while serving; 0 disables it
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "background-sync-todos".to_string(),
      periodic_tag: "todo-sync".to_string(),
      replay_endpoint: "/api/todos".to_string(),
      max_attempts: 5,
      interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  pub listen: String,
}

impl SyncConfig {
  pub fn interval(&self) -> Option<Duration> {
    (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
  }
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8787".to_string(),
    }
  }
}

fn default_cache_prefix() -> String {
  "todoapp".to_string()
}

fn default_version() -> String {
  "v1.0.0".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./sw-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/sw-cache/config.yaml
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
        "No configuration file found. Create one at ~/.config/sw-cache/config.yaml\n\
                 or pass --origin."
      )),
    }
  }

  /// Defaults for everything but the origin.
  pub fn from_origin(origin: &str) -> Result<Self> {
    let config = Self {
      origin: origin.to_string(),
      cache_prefix: default_cache_prefix(),
      version: default_version(),
      routes: RoutesConfig::default(),
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
      proxy: ProxyConfig::default(),
      database: None,
      log_dir: None,
    };
    config.validate()?;
    Ok(config)
  }

  pub fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("sw-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("sw-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  pub fn load_from_path(path: &Path) -> Result<Self> {
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

  /// Apply `SW_CACHE_ORIGIN` / `SW_CACHE_VERSION` overrides.
  pub fn apply_env(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("SW_CACHE_ORIGIN") {
      self.origin = origin;
    }
    if let Ok(version) = std::env::var("SW_CACHE_VERSION") {
      self.version = version;
    }
    self.validate()?;
    Ok(self)
  }

  /// Replace the origin, e.g. from `--origin`.
  pub fn with_origin(mut self, origin: &str) -> Result<Self> {
    self.origin = origin.to_string();
    self.validate()?;
    Ok(self)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    if self.network.timeout_ms == 0 {
      return Err(eyre!("network.timeout_ms must be at least 1"));
    }
    if self.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    if !self.sync.replay_endpoint.starts_with('/') {
      return Err(eyre!(
        "sync.replay_endpoint must be a path, got {}",
        self.sync.replay_endpoint
      ));
    }
    self.api_patterns()?;
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn bucket_names(&self) -> BucketNames {
    BucketNames::new(&self.cache_prefix, &self.version)
  }

  pub fn api_patterns(&self) -> Result<Vec<Regex>> {
    self
      .routes
      .api_patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid api pattern {}: {}", p, e)))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config = Config::from_yaml("origin: https://todo.example.com\n").unwrap();
    assert_eq!(config.version, "v1.0.0");
    assert_eq!(
      config.bucket_names().static_name(),
      "todoapp-static-v1.0.0"
    );
    assert_eq!(config.routes.static_manifest.len(), 7);
    assert_eq!(config.sync.tag, "background-sync-todos");
    assert_eq!(config.sync.periodic_tag, "todo-sync");
    assert_eq!(config.network.timeout(), Duration::from_secs(10));
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let yaml = r#"
origin: https://todo.example.com
version: v2.0.0
sync:
  max_attempts: 2
routes:
  offline_page: /offline-v2.html
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.sync.max_attempts, 2);
    assert_eq!(config.sync.replay_endpoint, "/api/todos");
    assert_eq!(config.routes.offline_page, "/offline-v2.html");
    assert_eq!(config.routes.static_prefix, "/static/");
    assert_eq!(config.bucket_names().dynamic_name(), "todoapp-dynamic-v2.0.0");
  }

  #[test]
  fn test_rejects_bad_api_pattern() {
    let yaml = "origin: https://todo.example.com\nroutes:\n  api_patterns: ['(']\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_rejects_non_http_origin() {
    assert!(Config::from_origin("ftp://todo.example.com").is_err());
    assert!(Config::from_origin("not a url").is_err());
  }

  #[test]
  fn test_rejects_zero_attempts() {
    let yaml = "origin: https://todo.example.com\nsync:\n  max_attempts: 0\n";
    assert!(Config::from_yaml(yaml).is_err());
  }

  #[test]
  fn test_rejects_zero_timeout() {
    let yaml = "origin: https://todo.example.com\nnetwork:\n  timeout_ms: 0\n";
    let err = Config::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("timeout_ms"));
  }

  #[test]
  fn test_sync_interval_zero_disables() {
    let config = Config::from_origin("https://todo.example.com").unwrap();
    assert_eq!(config.sync.interval(), Some(Duration::from_secs(60)));

    let yaml = "origin: https://todo.example.com\nsync:\n  interval_secs: 0\n";
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.sync.interval(), None);
  }

  #[test]
  fn test_resolve_against_origin() {
    let config = Config::from_origin("https://todo.example.com").unwrap();
    assert_eq!(
      config.resolve("/offline.html").unwrap().as_str(),
      "https://todo.example.com/offline.html"
    );
  }

  #[test]
  fn test_with_origin_overrides_and_validates() {
    let config = Config::from_origin("https://todo.example.com").unwrap();
    let config = config.with_origin("http://localhost:3000").unwrap();
    assert_eq!(config.origin, "http://localhost:3000");
    assert!(config.with_origin("mailto:someone@example.com").is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "origin: http://localhost:3000").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.origin, "http://localhost:3000");
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let err = Config::load(Some(Path::new("/nonexistent/sw-cache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
