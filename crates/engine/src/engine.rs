//! Engine - the process-wide state, built once at startup
//!
//! Owns the worker pools, the watch registry, the debouncer, the scheduler
//! and the deployer, wired together with one master `CancellationToken`.
//! Collaborators (host runtime, script compiler, management sink) are plugged
//! in through `EngineBuilder`; the in-process defaults are `LocalHost`,
//! `ManifestCompiler` and `ManagementRegistry`.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Engine::builder(config).start().await?;
//! println!("{}", engine.add_roots(&[PathBuf::from("/srv/more")]).await);
//! engine.shutdown().await;
//! ```

use std::{
  fmt,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use serde::Serialize;
use tokio::{
  sync::broadcast::{self, error::RecvError},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
  component::{Component, ComponentCompiler, LifecycleError, ManifestCompiler, ScriptCompiler},
  deploy::{Bootstrapper, Branch, BranchSnapshot, Deployer, DeployerParts, DeploymentTree},
  domain::{address::BranchAddress, config::Config},
  host::{HostRuntime, LocalHost, ScopeEvent},
  management::{ManagementRegistry, ManagementSink},
  pool::{PoolError, PoolStats, Pools},
  scheduler::{ScheduledEntry, Scheduler, SchedulerError},
  watch::{Debouncer, PendingEvent, WatchRegistry},
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("No deployment root could be watched\n{summary}")]
  NoRoots { summary: RootSummary },

  #[error("Failed to create worker pools: {0}")]
  Pool(#[from] PoolError),

  #[error("No component deployed from {0}")]
  ComponentNotFound(PathBuf),

  #[error(transparent)]
  Lifecycle(#[from] LifecycleError),

  #[error(transparent)]
  Scheduler(#[from] SchedulerError),
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of an add/remove-roots call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RootSummary {
  pub added: Vec<PathBuf>,
  pub removed: Vec<PathBuf>,
  pub skipped: Vec<(PathBuf, String)>,
}

impl fmt::Display for RootSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.added.is_empty() && self.removed.is_empty() && self.skipped.is_empty() {
      return f.write_str("no changes");
    }
    let mut lines = Vec::new();
    lines.extend(self.added.iter().map(|p| format!("added {}", p.display())));
    lines.extend(self.removed.iter().map(|p| format!("removed {}", p.display())));
    lines.extend(
      self
        .skipped
        .iter()
        .map(|(p, reason)| format!("skipped {}: {}", p.display(), reason)),
    );
    f.write_str(&lines.join("\n"))
  }
}

/// Serializable view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
  pub roots: Vec<PathBuf>,
  pub branches: Vec<BranchSnapshot>,
  pub scheduled: Vec<ScheduledEntry>,
  pub pools: Vec<PoolStats>,
  pub watched_dirs: usize,
  pub pending_events: usize,
}

// ============================================================================
// Builder
// ============================================================================

pub struct EngineBuilder {
  config: Config,
  host: Option<Arc<dyn HostRuntime>>,
  script: Option<Arc<dyn ScriptCompiler>>,
  sink: Option<Arc<dyn ManagementSink>>,
}

impl EngineBuilder {
  pub fn host(mut self, host: Arc<dyn HostRuntime>) -> Self {
    self.host = Some(host);
    self
  }

  pub fn script_compiler(mut self, script: Arc<dyn ScriptCompiler>) -> Self {
    self.script = Some(script);
    self
  }

  pub fn sink(mut self, sink: Arc<dyn ManagementSink>) -> Self {
    self.sink = Some(sink);
    self
  }

  /// Build everything, watch and scan the configured roots.
  ///
  /// Fails when the pools cannot be built or when none of the configured
  /// roots can be watched.
  pub async fn start(self) -> Result<Engine, EngineError> {
    let config = self.config;
    let roots = config.enabled_roots();
    if roots.is_empty() {
      return Err(EngineError::NoRoots {
        summary: RootSummary::default(),
      });
    }

    let pools = Pools::from_config(&config.pools)?;
    let cancel = CancellationToken::new();

    let host = self.host.unwrap_or_else(|| Arc::new(LocalHost::new()));
    let script = self.script.unwrap_or_else(|| Arc::new(ManifestCompiler));
    let sink = self.sink.unwrap_or_else(|| Arc::new(ManagementRegistry::default()));

    let registry = WatchRegistry::spawn(&config.watcher, cancel.child_token());
    let debouncer = Debouncer::spawn(config.watcher.clone(), pools.events.clone(), cancel.child_token());
    let scheduler = Arc::new(Scheduler::new(
      pools.collections.clone(),
      config.lifecycle.interrupt_grace(),
      cancel.child_token(),
    ));

    let deployer = Deployer::new(DeployerParts {
      tree: DeploymentTree::new(cancel.child_token()),
      registry,
      debouncer,
      bootstrapper: Bootstrapper::new(Arc::clone(&host), &config.deploy),
      compiler: ComponentCompiler::new(script, &config.deploy),
      scheduler,
      sink: Arc::clone(&sink),
      deploy_pool: pools.deploy.clone(),
      isolation_threshold: config.lifecycle.isolation_threshold,
      requeue_delay: config.watcher.busy_backoff(),
    });

    let scope_log = spawn_scope_log(host.subscribe(), cancel.child_token());

    let engine = Engine {
      config,
      deployer,
      pools,
      host,
      sink,
      cancel,
      scope_log,
    };

    let summary = engine.add_roots(&roots).await;
    if engine.deployer.tree().roots().is_empty() {
      engine.shutdown().await;
      return Err(EngineError::NoRoots { summary });
    }
    for (path, reason) in &summary.skipped {
      warn!(root = %path.display(), reason = %reason, "Skipped deployment root");
    }

    info!(
      roots = engine.deployer.tree().roots().len(),
      branches = engine.deployer.tree().len(),
      scheduled = engine.deployer.scheduler().len(),
      "Engine started"
    );
    Ok(engine)
  }
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
  config: Config,
  deployer: Arc<Deployer>,
  pools: Pools,
  host: Arc<dyn HostRuntime>,
  sink: Arc<dyn ManagementSink>,
  cancel: CancellationToken,
  scope_log: JoinHandle<()>,
}

impl Engine {
  pub fn builder(config: Config) -> EngineBuilder {
    EngineBuilder {
      config,
      host: None,
      script: None,
      sink: None,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn host(&self) -> &Arc<dyn HostRuntime> {
    &self.host
  }

  pub fn sink(&self) -> &Arc<dyn ManagementSink> {
    &self.sink
  }

  pub fn deployer(&self) -> &Arc<Deployer> {
    &self.deployer
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  // ==========================================================================
  // Administration
  // ==========================================================================

  /// Start watching more roots.
  pub async fn add_roots(&self, paths: &[PathBuf]) -> RootSummary {
    let mut summary = RootSummary::default();
    for path in paths {
      match self.deployer.add_root(path).await {
        Ok(canonical) => summary.added.push(canonical),
        Err(reason) => summary.skipped.push((path.clone(), reason)),
      }
    }
    summary
  }

  /// Stop watching roots and tear down everything deployed from them.
  pub async fn remove_roots(&self, paths: &[PathBuf]) -> RootSummary {
    let mut summary = RootSummary::default();
    for path in paths {
      match self.deployer.remove_root(path).await {
        Ok(canonical) => summary.removed.push(canonical),
        Err(reason) => summary.skipped.push((path.clone(), reason)),
      }
    }
    summary
  }

  pub fn roots(&self) -> Vec<PathBuf> {
    self.deployer.tree().roots()
  }

  /// Live branch by address, e.g. `app=orders,env=prod`.
  pub fn branch(&self, address: &str) -> Option<Arc<Branch>> {
    let address = BranchAddress::parse(address)?;
    self.deployer.tree().by_address(&address)
  }

  pub fn branch_for_dir(&self, dir: &Path) -> Option<Arc<Branch>> {
    self.deployer.tree().get(dir)
  }

  pub async fn component(&self, source: &Path) -> Option<Arc<Component>> {
    self.deployer.component(source).await
  }

  async fn require(&self, source: &Path) -> Result<Arc<Component>, EngineError> {
    self
      .component(source)
      .await
      .ok_or_else(|| EngineError::ComponentNotFound(source.to_path_buf()))
  }

  pub async fn pause(&self, source: &Path) -> Result<(), EngineError> {
    Ok(self.require(source).await?.pause().await?)
  }

  pub async fn resume(&self, source: &Path) -> Result<(), EngineError> {
    Ok(self.require(source).await?.resume().await?)
  }

  pub async fn blackout(&self, source: &Path, duration: Duration) -> Result<(), EngineError> {
    Ok(self.require(source).await?.blackout(duration).await?)
  }

  /// Bring an isolated component back and put it on its schedule again.
  pub async fn reset(&self, source: &Path) -> Result<(), EngineError> {
    let component = self.require(source).await?;
    component.reset().await?;
    if let Some(spec) = component.schedule() {
      self.deployer.scheduler().schedule(Arc::clone(&component), spec)?;
    }
    Ok(())
  }

  // ==========================================================================
  // Inspection
  // ==========================================================================

  pub async fn pending_events(&self) -> Vec<PendingEvent> {
    self.deployer.debouncer().pending().await.unwrap_or_default()
  }

  pub async fn status(&self) -> EngineStatus {
    let mut branches = Vec::new();
    for branch in self.deployer.tree().branches() {
      branches.push(branch.snapshot().await);
    }
    EngineStatus {
      roots: self.roots(),
      branches,
      scheduled: self.deployer.scheduler().entries(),
      pools: self.pools.stats(),
      watched_dirs: self.deployer.registry().len(),
      pending_events: self.pending_events().await.len(),
    }
  }

  // ==========================================================================
  // Shutdown
  // ==========================================================================

  /// Stop every component, close every scope and pool.
  pub async fn shutdown(&self) {
    if self.cancel.is_cancelled() {
      return;
    }
    info!("Engine shutting down");

    self.deployer.scheduler().shutdown();
    for root in self.roots() {
      if let Err(reason) = self.deployer.remove_root(&root).await {
        debug!(root = %root.display(), reason = %reason, "Root already gone");
      }
    }

    self.cancel.cancel();
    self.pools.close();
    self.scope_log.abort();
    info!("Engine shutdown complete");
  }
}

/// Trace host scope refresh events.
fn spawn_scope_log(mut events: broadcast::Receiver<ScopeEvent>, cancel: CancellationToken) -> JoinHandle<()> {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => break,

        event = events.recv() => match event {
          Ok(ScopeEvent::Started { scope }) => trace!(scope = %scope, "Scope started"),
          Ok(ScopeEvent::Refreshed { scope, bean }) => trace!(scope = %scope, bean = %bean, "Scope refreshed"),
          Ok(ScopeEvent::Stopped { scope }) => trace!(scope = %scope, "Scope stopped"),
          Err(RecvError::Lagged(skipped)) => debug!(skipped, "Scope event log lagged"),
          Err(RecvError::Closed) => break,
        }
      }
    }
  })
}
