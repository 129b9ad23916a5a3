use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::router::{default_rules, RouteRule, Strategy, StrategyTable};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application name, first half of the cache store name
  pub app: String,
  /// Cache version; bumping it invalidates every previously cached asset
  pub version: String,
  /// Site origin that relative paths resolve against
  pub origin: String,
  /// Page served to navigations when both network and cache fail
  pub offline_url: String,
  /// Paths fetched and stored at install time
  pub precache: Vec<String>,
  /// Ordered routing rules; first match wins
  pub routes: Vec<RouteRule>,
  /// Strategy for paths no rule matches
  pub default_strategy: Strategy,
  /// Network timeout in seconds
  pub timeout_secs: u64,
  /// Database path (defaults to $XDG_DATA_HOME/offcache/cache.db)
  pub database: Option<PathBuf>,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Sync tag -> URL substring selecting the queued requests it replays
  pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub open_title: String,
  pub open_icon: String,
  pub close_title: String,
  pub close_icon: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for LevelFilter {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Error => LevelFilter::ERROR,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Trace => LevelFilter::TRACE,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default level when RUST_LOG is not set
  pub level: LogLevel,
  /// Also write a daily log file under the data directory
  pub file: bool,
  /// Log directory (defaults to $XDG_DATA_HOME/offcache/logs)
  pub directory: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app: "smdlabtech".to_string(),
      version: "1.0.0".to_string(),
      origin: "http://localhost:4000/".to_string(),
      offline_url: "/offline.html".to_string(),
      precache: [
        "/",
        "/index.html",
        "/assets/css/main.bundle.css",
        "/assets/js/main.bundle.js",
        "/manifest.json",
        "/favicon.ico",
        "/offline.html",
      ]
      .iter()
      .map(|p| p.to_string())
      .collect(),
      routes: default_rules(),
      default_strategy: Strategy::NetworkFirst,
      timeout_secs: 30,
      database: None,
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    let tags = [
      ("newsletter-sync", "/api/newsletter"),
      ("contact-sync", "/api/contact"),
    ]
    .iter()
    .map(|(tag, filter)| (tag.to_string(), filter.to_string()))
    .collect();

    Self { tags }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "SMDLabTech".to_string(),
      default_body: "Nouveau contenu disponible".to_string(),
      icon: "/assets/img/icon-192.png".to_string(),
      badge: "/assets/img/badge-72.png".to_string(),
      vibrate: vec![100, 50, 100],
      open_title: "Voir".to_string(),
      open_icon: "/assets/img/icon-open.png".to_string(),
      close_title: "Fermer".to_string(),
      close_icon: "/assets/img/icon-close.png".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be an http(s) URL: {}", origin));
    }
    if self.app.trim().is_empty() || self.version.trim().is_empty() {
      return Err(eyre!("Both app and version must be set"));
    }
    self.strategy_table()?;
    Ok(())
  }

  /// The versioned cache store name, e.g. `smdlabtech-v1.0.0`.
  pub fn cache_name(&self) -> String {
    format!("{}-v{}", self.app, self.version)
  }

  /// Compile the routing rules.
  pub fn strategy_table(&self) -> Result<StrategyTable> {
    StrategyTable::compile(&self.routes, self.default_strategy)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }
}
