//! Logging setup for the foreground daemon and one-shot commands

use std::path::PathBuf;

use collectord::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Directory rolling log files are written to
pub fn log_dir() -> PathBuf {
  collectord::dirs::default_log_dir()
}

/// Initialize logging for one-shot commands (console only)
pub fn init_cli_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
    .with_target(false)
    .init();
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging for `collectord run`.
///
/// Without `to_file` logs go to the console with colors. With it they go to a
/// rolling file under [`log_dir`] (no ANSI), rotated per the config.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_run_logging(config: &LogConfig, to_file: bool) -> Option<WorkerGuard> {
  let level = parse_log_level(&config.level);

  // RUST_LOG overrides the configured level
  let env_filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  if !to_file {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let dir = log_dir();
  if let Err(e) = std::fs::create_dir_all(&dir) {
    eprintln!("Cannot create log directory {}: {e}; logging to console", dir.display());
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(&dir, "collectord.log"),
    "never" => tracing_appender::rolling::never(&dir, "collectord.log"),
    _ => tracing_appender::rolling::daily(&dir, "collectord.log"),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
