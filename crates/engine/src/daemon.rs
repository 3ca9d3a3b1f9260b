//! Foreground daemon lifecycle.
//!
//! ```text
//! Daemon
//!   └── Engine
//!         ├── WatchRegistry (native watchers, pump task)
//!         ├── Debouncer ──> events pool
//!         ├── Deployer ──> deploy pool
//!         │     └── DeploymentTree
//!         │           └── Branch (scope, components)
//!         └── Scheduler ──> collections pool
//! ```
//!
//! # Lifecycle
//!
//! 1. Load configuration (explicit path or user config)
//! 2. Start the engine: pools, watchers, initial scan of every root
//! 3. Wait for ctrl-c or the shutdown token
//! 4. Graceful shutdown: stop components, stop scopes, close pools

use std::path::PathBuf;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
  domain::config::{Config, ConfigError},
  engine::{Engine, EngineError},
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Engine(#[from] EngineError),
}

/// Daemon runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
  /// Config file the settings came from, if any
  pub config_path: Option<PathBuf>,
  /// Extra roots given on the command line
  pub extra_roots: Vec<PathBuf>,
  pub config: Config,
}

impl RuntimeConfig {
  /// Load from `path`, or from the user config when `path` is `None`.
  pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
    let (config, config_path) = match path {
      Some(path) => (Config::load_from(&path)?, Some(path)),
      None => {
        let user = Config::user_config_path();
        let found = user.exists().then_some(user);
        (Config::load()?, found)
      }
    };
    Ok(Self {
      config_path,
      extra_roots: Vec::new(),
      config,
    })
  }

  /// Configured roots plus the extra ones, as the engine should see them.
  pub fn effective_config(&self) -> Config {
    let mut config = self.config.clone();
    config.roots.extend(
      self
        .extra_roots
        .iter()
        .map(|p| crate::domain::config::RootConfig::new(p.clone())),
    );
    config
  }
}

pub struct Daemon {
  runtime_config: RuntimeConfig,
}

impl Daemon {
  pub fn new(runtime_config: RuntimeConfig) -> Self {
    Self { runtime_config }
  }

  /// Run until ctrl-c.
  pub async fn run(self) -> Result<(), DaemonError> {
    let shutdown = CancellationToken::new();

    let on_signal = shutdown.clone();
    tokio::spawn(async move {
      if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        return;
      }
      info!("Received ctrl-c, shutting down...");
      on_signal.cancel();
    });

    self.run_until(shutdown).await
  }

  /// Run until `shutdown` is cancelled.
  pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), DaemonError> {
    info!("Starting collectord");
    if let Some(path) = &self.runtime_config.config_path {
      info!("Config: {:?}", path);
    }

    let engine = Engine::builder(self.runtime_config.effective_config()).start().await?;
    for root in engine.roots() {
      info!("Watching {:?}", root);
    }

    tokio::select! {
      _ = shutdown.cancelled() => {}
      // An engine cancelled from inside (e.g. every root vanished) also ends the run
      _ = engine.cancel_token().cancelled() => {}
    }

    info!("Shutting down...");
    engine.shutdown().await;
    info!("Daemon shutdown complete");
    Ok(())
  }
}
