use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::PartitionNames;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Where the application lives; its origin is the only one intercepted
  pub scope: Url,
  /// Deployment generation; changing it invalidates every partition
  pub version: String,
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Offline-critical resources, relative to `scope`
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  /// Document served to offline navigations; must be precached
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      user_agent: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite database (default: $XDG_DATA_HOME/swcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Write daily-rolling log files here instead of stderr
  pub directory: Option<PathBuf>,
  /// EnvFilter directive used when RUST_LOG is unset
  pub filter: Option<String>,
}

fn default_cache_prefix() -> String {
  "app".to_string()
}

fn default_precache() -> Vec<String> {
  vec!["./".to_string(), "./index.html".to_string()]
}

fn default_offline_fallback() -> String {
  "./index.html".to_string()
}

fn default_true() -> bool {
  true
}

fn default_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
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
        "No configuration file found. Create ./swcache.yaml or ~/.config/swcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Check the invariants the worker relies on.
  pub fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("version must not be empty"));
    }

    let manifest = self.manifest()?;
    let fallback = self.offline_fallback_url()?;
    if !manifest.contains(&fallback) {
      return Err(eyre!(
        "offline_fallback {} is not in the precache list",
        self.offline_fallback
      ));
    }

    Ok(())
  }

  /// Resolve a path against the scope.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .scope
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }

  /// Absolute precache URLs, in manifest order.
  pub fn manifest(&self) -> Result<Vec<Url>> {
    self
      .precache
      .iter()
      .map(|entry| {
        let url = self.resolve(entry)?;
        if url.origin() != self.scope.origin() {
          return Err(eyre!("precache entry {} is not on the scope's origin", entry));
        }
        Ok(url)
      })
      .collect()
  }

  pub fn offline_fallback_url(&self) -> Result<Url> {
    self.resolve(&self.offline_fallback)
  }

  pub fn partition_names(&self) -> PartitionNames {
    PartitionNames::new(&self.cache_prefix, &self.version)
  }
}
