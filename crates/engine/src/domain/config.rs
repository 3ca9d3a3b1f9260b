//! Configuration system for collectord.
//!
//! Config priority: explicit path > `$CONFIG_DIR/config.toml` >
//! `$XDG_CONFIG_HOME/collectord/config.toml` > platform config dir > defaults.

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::watch::FileEventKind;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
}

// ============================================================================
// Roots
// ============================================================================

/// A deployment root as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
  /// Directory whose `key-value` sub-directories become branches
  pub path: PathBuf,
  /// Disabled roots are listed but never watched
  #[serde(default = "default_true")]
  pub enabled: bool,
}

fn default_true() -> bool {
  true
}

impl RootConfig {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      enabled: true,
    }
  }
}

// ============================================================================
// Watcher Configuration
// ============================================================================

/// Filesystem watch and debounce settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
  /// How often watched directories are checked for out-of-band removal (default: 1000)
  pub poll_interval_ms: u64,

  /// Settle delay for created files (default: 1000)
  /// Creations are usually followed by several writes while the file streams in.
  pub create_delay_ms: u64,

  /// Settle delay for modified files (default: 500)
  pub modify_delay_ms: u64,

  /// Settle delay for deleted files (default: 0)
  pub delete_delay_ms: u64,

  /// Extra delay when an event arrives while its path is still being processed (default: 2000)
  pub busy_backoff_ms: u64,
}

impl Default for WatcherConfig {
  fn default() -> Self {
    Self {
      poll_interval_ms: 1000,
      create_delay_ms: 1000,
      modify_delay_ms: 500,
      delete_delay_ms: 0,
      busy_backoff_ms: 2000,
    }
  }
}

impl WatcherConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  /// Kind-dependent settle delay before an event becomes eligible.
  pub fn settle_delay(&self, kind: FileEventKind) -> Duration {
    let ms = match kind {
      FileEventKind::Created => self.create_delay_ms,
      FileEventKind::Modified => self.modify_delay_ms,
      FileEventKind::Deleted => self.delete_delay_ms,
    };
    Duration::from_millis(ms)
  }

  pub fn busy_backoff(&self) -> Duration {
    Duration::from_millis(self.busy_backoff_ms)
  }
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Worker pool sizes. Each pool is bounded and isolated from the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
  /// Filesystem event processing (default: number of CPUs)
  pub events: usize,
  /// Scheduled collections (default: 2x number of CPUs, min 4)
  pub collections: usize,
  /// Branch bootstrap and compilation (default: half the CPUs, min 2)
  pub deploy: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    let cpus = num_cpus::get().max(1);
    Self {
      events: cpus,
      collections: (cpus * 2).max(4),
      deploy: (cpus / 2).max(2),
    }
  }
}

// ============================================================================
// Lifecycle Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Consecutive NOCONN/FAILED collections before a component is isolated (default: 3)
  pub isolation_threshold: u32,

  /// How long an interruptible collection may run after being interrupted
  /// before its worker is cancelled (default: 5000)
  pub interrupt_grace_ms: u64,
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      isolation_threshold: 3,
      interrupt_grace_ms: 5000,
    }
  }
}

impl LifecycleConfig {
  pub fn interrupt_grace(&self) -> Duration {
    Duration::from_millis(self.interrupt_grace_ms)
  }
}

// ============================================================================
// Deploy Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
  /// File extensions under `lib/` that are added to a branch namespace
  pub archive_extensions: Vec<String>,

  /// Sources larger than this are not compiled (default: 1 MiB)
  pub max_source_bytes: u64,

  /// Skip dot-files and editor swap files (default: true)
  pub ignore_hidden: bool,
}

impl Default for DeployConfig {
  fn default() -> Self {
    Self {
      archive_extensions: ["jar", "zip", "tar", "tgz", "wasm"].iter().map(|s| s.to_string()).collect(),
      max_source_bytes: 1024 * 1024,
      ignore_hidden: true,
    }
  }
}

// ============================================================================
// Log Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// off, error, warn, info, debug, trace (default: info)
  pub level: String,
  /// daily, hourly, never (default: daily)
  pub rotation: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Top-level Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub roots: Vec<RootConfig>,
  pub watcher: WatcherConfig,
  pub pools: PoolConfig,
  pub lifecycle: LifecycleConfig,
  pub deploy: DeployConfig,
  pub log: LogConfig,
}

impl Config {
  /// Load configuration from an explicit file.
  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Load the user config if present, defaults otherwise.
  ///
  /// A config file that exists but fails to parse is an error rather than a
  /// silent fallback, so a typo never starts the engine with no roots.
  pub fn load() -> Result<Self, ConfigError> {
    let path = Self::user_config_path();
    if path.exists() { Self::load_from(&path) } else { Ok(Self::default()) }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> PathBuf {
    crate::dirs::default_config_dir().join("config.toml")
  }

  /// Enabled roots, de-duplicated by canonical path (first occurrence wins).
  pub fn enabled_roots(&self) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    self
      .roots
      .iter()
      .filter(|r| r.enabled)
      .map(|r| r.path.canonicalize().unwrap_or_else(|_| r.path.clone()))
      .filter(|p| seen.insert(p.clone()))
      .collect()
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    format!(
      r#"# collectord configuration
# Place in ~/.config/collectord/config.toml or pass --config <file>

# ============================================================================
# Deployment roots
# ============================================================================
# Every `key-value` sub-directory of a root becomes a deployment branch.
# [[roots]]
# path = "/srv/collectors"
# enabled = true

# ============================================================================
# Filesystem watching
# ============================================================================

[watcher]
poll_interval_ms = {poll}
create_delay_ms = {create}
modify_delay_ms = {modify}
delete_delay_ms = {delete}
busy_backoff_ms = {backoff}

# ============================================================================
# Worker pools
# ============================================================================

[pools]
events = {events}
collections = {collections}
deploy = {deploy}

# ============================================================================
# Component lifecycle
# ============================================================================

[lifecycle]
isolation_threshold = {threshold}
interrupt_grace_ms = {grace}

# ============================================================================
# Deployment
# ============================================================================

[deploy]
archive_extensions = ["jar", "zip", "tar", "tgz", "wasm"]
max_source_bytes = {max_source}
ignore_hidden = true

# ============================================================================
# Logging
# ============================================================================

[log]
# off, error, warn, info, debug, trace
level = "info"
# daily, hourly, never
rotation = "daily"
"#,
      poll = defaults.watcher.poll_interval_ms,
      create = defaults.watcher.create_delay_ms,
      modify = defaults.watcher.modify_delay_ms,
      delete = defaults.watcher.delete_delay_ms,
      backoff = defaults.watcher.busy_backoff_ms,
      events = defaults.pools.events,
      collections = defaults.pools.collections,
      deploy = defaults.pools.deploy,
      threshold = defaults.lifecycle.isolation_threshold,
      grace = defaults.lifecycle.interrupt_grace_ms,
      max_source = defaults.deploy.max_source_bytes,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_template_parses_to_defaults() {
    let config: Config = toml::from_str(&Config::generate_template()).unwrap();
    assert!(config.roots.is_empty());
    assert_eq!(config.watcher.create_delay_ms, 1000);
    assert_eq!(config.watcher.busy_backoff_ms, 2000);
    assert_eq!(config.lifecycle.isolation_threshold, 3);
    assert_eq!(config.log.rotation, "daily");
  }

  #[test]
  fn test_partial_config_uses_defaults() {
    let toml_content = r#"
[[roots]]
path = "/srv/a"

[[roots]]
path = "/srv/b"
enabled = false

[watcher]
modify_delay_ms = 100
"#;
    let config: Config = toml::from_str(toml_content).unwrap();
    assert_eq!(config.roots.len(), 2);
    assert!(config.roots[0].enabled);
    assert!(!config.roots[1].enabled);
    assert_eq!(config.watcher.modify_delay_ms, 100);
    assert_eq!(config.watcher.create_delay_ms, 1000);
  }

  #[test]
  fn test_settle_delays_by_kind() {
    let watcher = WatcherConfig::default();
    assert_eq!(watcher.settle_delay(FileEventKind::Deleted), Duration::ZERO);
    assert_eq!(watcher.settle_delay(FileEventKind::Modified), Duration::from_millis(500));
    assert_eq!(watcher.settle_delay(FileEventKind::Created), Duration::from_millis(1000));
  }

  #[test]
  fn test_enabled_roots_are_deduplicated() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = Config {
      roots: vec![
        RootConfig::new(dir.path()),
        RootConfig::new(dir.path().join(".")),
        RootConfig {
          path: PathBuf::from("/nonexistent/disabled"),
          enabled: false,
        },
      ],
      ..Default::default()
    };
    let roots = config.enabled_roots();
    assert_eq!(roots.len(), 1);
  }
}
