//! Foreground daemon command

use anyhow::{Context, Result};
use collectord::{Daemon, RuntimeConfig};
use tracing::info;

/// Run the engine until ctrl-c
pub async fn cmd_run(runtime: RuntimeConfig) -> Result<()> {
  info!(version = env!("CARGO_PKG_VERSION"), "collectord starting");
  Daemon::new(runtime).run().await.context("collectord stopped with an error")?;
  Ok(())
}
