//! Component lifecycle state machine
//!
//! A `Component` wraps one compiled `ScriptInstance` attached to one branch.
//! Structural transitions (start, stop, pause, resume, blackout, reset) are
//! serialized by a per-component transition lock. `collect()` only holds the
//! lock while entering and leaving COLLECTING, so a hung collection never
//! blocks `stop()`.
//!
//! User hooks run through `guarded`, which turns panics into `ScriptError`s:
//! a faulty script can fail its own component but never leave the state
//! machine half way through a transition.

use std::{
  future::Future,
  panic::AssertUnwindSafe,
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex as StdMutex, PoisonError,
    atomic::{AtomicU32, AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
  capability::{ComponentEvent, ScriptError, ScriptInstance},
  compiler::CompiledComponent,
};
use crate::{
  domain::{
    address::BranchAddress,
    schedule::ScheduleSpec,
    state::{CollectResult, CollectorState},
  },
  host::{Bean, ExecutionScope},
  management::Managed,
};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
  #[error("cannot {op} component {name} in state {state}")]
  IllegalTransition {
    name: String,
    op: &'static str,
    state: CollectorState,
  },

  #[error("component {name} has unresolved dependency '{dependency}'")]
  Dependency { name: String, dependency: String },

  #[error("injecting '{dependency}' into {name} failed: {source}")]
  Inject {
    name: String,
    dependency: String,
    #[source]
    source: ScriptError,
  },

  #[error("{hook} hook of {name} failed: {source}")]
  Hook {
    name: String,
    hook: &'static str,
    #[source]
    source: ScriptError,
  },

  #[error("component {0} is not a collector")]
  NotCollector(String),
}

struct Blackout {
  until: Instant,
  until_wall: DateTime<Utc>,
  resume_to: CollectorState,
}

pub struct Component {
  name: String,
  source: Option<PathBuf>,
  digest: String,
  branch: BranchAddress,
  instance: ScriptInstance,
  scope: Arc<dyn ExecutionScope>,
  isolation_threshold: u32,
  /// Distinguishes successive deployments of the same source
  deployment_id: Uuid,
  deployed_at: DateTime<Utc>,

  state: watch::Sender<CollectorState>,
  transition: Mutex<()>,
  failures: AtomicU32,
  collections: AtomicU64,
  last_result: StdMutex<Option<(CollectResult, DateTime<Utc>)>>,
  blackout: StdMutex<Option<Blackout>>,
}

impl Component {
  pub fn new(
    compiled: CompiledComponent,
    branch: BranchAddress,
    scope: Arc<dyn ExecutionScope>,
    isolation_threshold: u32,
  ) -> Self {
    let (state, _) = watch::channel(CollectorState::Init);
    Self {
      name: compiled.name,
      source: compiled.source,
      digest: compiled.digest,
      branch,
      instance: compiled.instance,
      scope,
      isolation_threshold: isolation_threshold.max(1),
      deployment_id: Uuid::now_v7(),
      deployed_at: Utc::now(),
      state,
      transition: Mutex::new(()),
      failures: AtomicU32::new(0),
      collections: AtomicU64::new(0),
      last_result: StdMutex::new(None),
      blackout: StdMutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn source(&self) -> Option<&Path> {
    self.source.as_deref()
  }

  pub fn digest(&self) -> &str {
    &self.digest
  }

  pub fn deployment_id(&self) -> Uuid {
    self.deployment_id
  }

  pub fn branch(&self) -> &BranchAddress {
    &self.branch
  }

  /// Identity used by the scheduler: the source file, or branch and name for
  /// inline sources.
  pub fn key(&self) -> String {
    match &self.source {
      Some(path) => path.display().to_string(),
      None => format!("{}/{}", self.branch, self.name),
    }
  }

  pub fn instance(&self) -> &ScriptInstance {
    &self.instance
  }

  pub fn state(&self) -> CollectorState {
    *self.state.borrow()
  }

  /// Watch state changes.
  pub fn subscribe(&self) -> watch::Receiver<CollectorState> {
    self.state.subscribe()
  }

  pub fn consecutive_failures(&self) -> u32 {
    self.failures.load(Ordering::SeqCst)
  }

  pub fn schedule(&self) -> Option<ScheduleSpec> {
    self.instance.schedulable().map(|s| s.schedule())
  }

  pub fn interruptible(&self) -> bool {
    self.instance.collector().is_some_and(|c| c.interruptible())
  }

  /// Cooperatively interrupt an in-flight collection, if the collector allows it.
  pub fn interrupt(&self) {
    if let Some(collector) = self.instance.collector()
      && collector.interruptible()
    {
      collector.interrupt();
    }
  }

  fn set_state(&self, next: CollectorState) {
    let previous = self.state.send_replace(next);
    if previous != next {
      debug!(component = %self.name, from = %previous, to = %next, "State changed");
    }
  }

  fn illegal(&self, op: &'static str, state: CollectorState) -> LifecycleError {
    LifecycleError::IllegalTransition {
      name: self.name.clone(),
      op,
      state,
    }
  }

  // ==========================================================================
  // Transitions
  // ==========================================================================

  /// INIT/STOPPED -> STARTED.
  ///
  /// Dependencies are injected, then the pre-start, start and post-start hooks
  /// run in order. The state only changes to STARTED if all of them succeed.
  /// An unresolvable dependency on a fresh component moves it to BROKEN.
  pub async fn start(&self) -> Result<(), LifecycleError> {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if !state.can_start() {
      return Err(self.illegal("start", state));
    }

    if let Err(e) = self.inject_dependencies() {
      if state == CollectorState::Init {
        self.set_state(CollectorState::Broken);
      }
      return Err(e);
    }

    if let Some(lifecycle) = self.instance.lifecycle() {
      self.hook("pre_start", lifecycle.pre_start()).await?;
      self.hook("start", lifecycle.start()).await?;
      self.hook("post_start", lifecycle.post_start()).await?;
    }

    if self.instance.named().is_some() {
      let bean: Bean = Arc::new(self.instance.clone());
      if let Err(e) = self.scope.register_bean(&self.name, bean) {
        warn!(component = %self.name, error = %e, "Failed to register component bean");
      }
    }

    self.failures.store(0, Ordering::SeqCst);
    self.set_state(CollectorState::Started);
    info!(component = %self.name, branch = %self.branch, "Component started");
    Ok(())
  }

  /// Any running state -> STOPPED.
  ///
  /// Hook failures are logged and swallowed; the state always ends STOPPED.
  pub async fn stop(&self) -> Result<(), LifecycleError> {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if !state.is_running() {
      return Err(self.illegal("stop", state));
    }

    if let Some(lifecycle) = self.instance.lifecycle() {
      for (hook, result) in [
        ("pre_stop", guarded(lifecycle.pre_stop()).await),
        ("stop", guarded(lifecycle.stop()).await),
        ("post_stop", guarded(lifecycle.post_stop()).await),
      ] {
        if let Err(e) = result {
          warn!(component = %self.name, hook, error = %e, "Stop hook failed");
        }
      }
    }

    if let Some(connector) = self.instance.connector()
      && let Err(e) = guarded(async {
        connector.disconnect().await;
        Ok(())
      })
      .await
    {
      warn!(component = %self.name, error = %e, "Disconnect failed");
    }

    if self.instance.named().is_some() {
      self.scope.remove_bean(&self.name);
    }

    self.clear_blackout();
    self.set_state(CollectorState::Stopped);
    info!(component = %self.name, branch = %self.branch, "Component stopped");
    Ok(())
  }

  /// Run one collection.
  ///
  /// Legal while STARTED or COLLECTING. NOCONN and FAILED results count
  /// toward the isolation threshold; reaching it moves the component to
  /// ISOLATED. A panicking collector counts as FAILED.
  pub async fn collect(&self) -> Result<CollectResult, LifecycleError> {
    let collector = {
      let _transition = self.transition.lock().await;
      let state = self.state();
      if !state.can_collect() {
        return Err(self.illegal("collect", state));
      }
      let collector = self
        .instance
        .collector()
        .cloned()
        .ok_or_else(|| LifecycleError::NotCollector(self.name.clone()))?;
      self.set_state(CollectorState::Collecting);
      collector
    };

    let result = self.run_collection(collector).await;
    self.collections.fetch_add(1, Ordering::SeqCst);
    *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = Some((result, Utc::now()));

    let failures = if result.is_failure() {
      self.failures.fetch_add(1, Ordering::SeqCst) + 1
    } else {
      self.failures.store(0, Ordering::SeqCst);
      0
    };

    let _transition = self.transition.lock().await;
    // stop() may have run while we were collecting
    if self.state() == CollectorState::Collecting {
      if failures >= self.isolation_threshold {
        warn!(
          component = %self.name,
          failures,
          threshold = self.isolation_threshold,
          "Component isolated after consecutive failed collections"
        );
        self.set_state(CollectorState::Isolated);
      } else {
        self.set_state(CollectorState::Started);
      }
    }

    debug!(component = %self.name, %result, failures, "Collection finished");
    Ok(result)
  }

  async fn run_collection(&self, collector: Arc<dyn super::capability::Collector>) -> CollectResult {
    if let Some(connector) = self.instance.connector()
      && let Err(e) = guarded(connector.connect()).await
    {
      debug!(component = %self.name, error = %e, "Connection failed");
      return CollectResult::NoConn;
    }

    match AssertUnwindSafe(collector.collect()).catch_unwind().await {
      Ok(result) => result,
      Err(_) => {
        warn!(component = %self.name, "Collector panicked");
        CollectResult::Failed
      }
    }
  }

  /// STARTED -> PAUSED. Resources stay up; only scheduled invocation stops.
  pub async fn pause(&self) -> Result<(), LifecycleError> {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if state != CollectorState::Started {
      return Err(self.illegal("pause", state));
    }
    self.set_state(CollectorState::Paused);
    Ok(())
  }

  /// PAUSED -> STARTED.
  pub async fn resume(&self) -> Result<(), LifecycleError> {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if state != CollectorState::Paused {
      return Err(self.illegal("resume", state));
    }
    self.set_state(CollectorState::Started);
    Ok(())
  }

  /// STARTED/PAUSED -> BLACKOUT for `duration`, then back to where it was.
  pub async fn blackout(&self, duration: Duration) -> Result<(), LifecycleError> {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if !matches!(state, CollectorState::Started | CollectorState::Paused) {
      return Err(self.illegal("blackout", state));
    }
    let until_wall = Utc::now() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    *self.blackout.lock().unwrap_or_else(PoisonError::into_inner) = Some(Blackout {
      until: Instant::now() + duration,
      until_wall,
      resume_to: state,
    });
    self.set_state(CollectorState::Blackout);
    info!(component = %self.name, until = %until_wall, "Component blacked out");
    Ok(())
  }

  /// End an expired blackout window. Returns the current state.
  pub async fn refresh_blackout(&self) -> CollectorState {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if state != CollectorState::Blackout {
      return state;
    }
    let mut blackout = self.blackout.lock().unwrap_or_else(PoisonError::into_inner);
    match blackout.as_ref() {
      Some(window) if window.until <= Instant::now() => {
        let resume_to = window.resume_to;
        *blackout = None;
        self.set_state(resume_to);
        info!(component = %self.name, state = %resume_to, "Blackout window ended");
        resume_to
      }
      _ => state,
    }
  }

  fn clear_blackout(&self) {
    *self.blackout.lock().unwrap_or_else(PoisonError::into_inner) = None;
  }

  /// ISOLATED -> STARTED with the failure count cleared.
  pub async fn reset(&self) -> Result<(), LifecycleError> {
    let _transition = self.transition.lock().await;
    let state = self.state();
    if state != CollectorState::Isolated {
      return Err(self.illegal("reset", state));
    }
    self.failures.store(0, Ordering::SeqCst);
    self.set_state(CollectorState::Started);
    info!(component = %self.name, "Component reset");
    Ok(())
  }

  /// Hand a sibling's deployment event to this component if it listens.
  pub async fn deliver(&self, event: &ComponentEvent) {
    let Some(listener) = self.instance.event_listener() else {
      return;
    };
    if !self.state().is_running() {
      return;
    }
    let result = guarded(async {
      listener.on_event(event).await;
      Ok(())
    })
    .await;
    if let Err(e) = result {
      warn!(component = %self.name, error = %e, "Event listener failed");
    }
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  fn inject_dependencies(&self) -> Result<(), LifecycleError> {
    let Some(dependent) = self.instance.dependent() else {
      return Ok(());
    };
    for dependency in dependent.dependencies() {
      let bean = self.scope.lookup(&dependency).ok_or_else(|| LifecycleError::Dependency {
        name: self.name.clone(),
        dependency: dependency.clone(),
      })?;
      dependent
        .inject(&dependency, bean)
        .map_err(|source| LifecycleError::Inject {
          name: self.name.clone(),
          dependency: dependency.clone(),
          source,
        })?;
    }
    Ok(())
  }

  async fn hook<F>(&self, hook: &'static str, fut: F) -> Result<(), LifecycleError>
  where
    F: Future<Output = Result<(), ScriptError>>,
  {
    guarded(fut).await.map_err(|source| {
      warn!(component = %self.name, hook, error = %source, "Start hook failed");
      LifecycleError::Hook {
        name: self.name.clone(),
        hook,
        source,
      }
    })
  }
}

/// Await a script future, converting a panic into a `ScriptError`.
async fn guarded<F>(fut: F) -> Result<(), ScriptError>
where
  F: Future<Output = Result<(), ScriptError>>,
{
  match AssertUnwindSafe(fut).catch_unwind().await {
    Ok(result) => result,
    Err(_) => Err(ScriptError::Runtime("script panicked".to_string())),
  }
}

impl Managed for Component {
  fn kind(&self) -> &'static str {
    "component"
  }

  fn attributes(&self) -> serde_json::Value {
    let last = *self.last_result.lock().unwrap_or_else(PoisonError::into_inner);
    let blackout_until = self
      .blackout
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .map(|b| b.until_wall.to_rfc3339());
    json!({
      "name": self.name,
      "branch": self.branch.to_string(),
      "source": self.source,
      "digest": self.digest,
      "state": self.state(),
      "capabilities": self.instance.capabilities().names(),
      "schedule": self.schedule().map(|s| s.to_string()),
      "consecutive_failures": self.consecutive_failures(),
      "collections": self.collections.load(Ordering::SeqCst),
      "last_result": last.map(|(r, _)| r),
      "last_collected_at": last.map(|(_, at)| at.to_rfc3339()),
      "blackout_until": blackout_until,
      "deployment_id": self.deployment_id.to_string(),
      "deployed_at": self.deployed_at.to_rfc3339(),
    })
  }
}
