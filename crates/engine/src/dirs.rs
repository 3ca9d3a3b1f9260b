//! Well-known directories

use std::path::PathBuf;

/// Get the default config directory
///
/// Respects the following environment variables (in order of precedence):
/// 1. CONFIG_DIR - explicit config directory override
/// 2. XDG_CONFIG_HOME - standard XDG config home directory
/// 3. dirs::config_dir() - platform default
pub fn default_config_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("CONFIG_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
    return PathBuf::from(xdg_config).join("collectord");
  }

  dirs::config_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("collectord")
}

/// Get the default data directory
///
/// Respects DATA_DIR, then XDG_DATA_HOME, then the platform default.
pub fn default_data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("DATA_DIR") {
    return PathBuf::from(dir);
  }

  if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
    return PathBuf::from(xdg_data).join("collectord");
  }

  dirs::data_local_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("collectord")
}

/// Where rolling log files go when the engine runs with `--log-file`
pub fn default_log_dir() -> PathBuf {
  default_data_dir().join("logs")
}
