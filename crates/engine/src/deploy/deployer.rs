//! Deployer - turns settled file events into branch and component changes
//!
//! Every watched directory gets a `DirWatch` listener that feeds the
//! debouncer. Once an event settles it comes back here through
//! `DirHandler::handle` and is routed by the role of the directory it was
//! observed in:
//!
//! - **Root**: a `key-value` child directory appeared or vanished
//! - **Branch**: a source file, a child branch or `lib/` changed
//! - **Lib**: an archive in the branch's `lib/` changed (re-bootstrap)
//!
//! Bootstrap and compile run on the `deploy` pool. The directory walk itself
//! stays on the calling task so nested branches never wait on a pool slot
//! held by their own parent.

use std::{
  future::Future,
  path::{Path, PathBuf},
  sync::{Arc, Weak},
  time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use tracing::{debug, info, trace, warn};

use super::{
  bootstrap::{Bootstrapper, LIB_DIR},
  branch::{Branch, Slot},
  tree::{DeploymentTree, TreeError},
};
use crate::{
  component::{CompileError, Component, ComponentCompiler, ComponentEvent, ComponentEventKind},
  domain::{address::Segment, state::BranchStatus},
  management::{ManagementSink, ObjectAddress},
  pool::WorkerPool,
  scheduler::Scheduler,
  watch::{
    DebouncerHandle, EventHandler, EventKinds, FileEvent, FileEventKind, WatchListener, WatchRegistry,
  },
};

// ============================================================================
// Hand-off to the deploy pool
// ============================================================================

#[derive(Debug, thiserror::Error)]
enum HandOffError {
  #[error("branch was destroyed")]
  Cancelled,
  #[error("deploy worker panicked")]
  Panicked,
  #[error("deploy pool is closed")]
  Closed,
}

// ============================================================================
// Deployer
// ============================================================================

/// Everything the deployer needs, built once by the engine.
pub struct DeployerParts {
  pub tree: DeploymentTree,
  pub registry: Arc<WatchRegistry>,
  pub debouncer: DebouncerHandle,
  pub bootstrapper: Bootstrapper,
  pub compiler: ComponentCompiler,
  pub scheduler: Arc<Scheduler>,
  pub sink: Arc<dyn ManagementSink>,
  pub deploy_pool: WorkerPool,
  pub isolation_threshold: u32,
  /// Delay before retrying an event for a branch still bootstrapping
  pub requeue_delay: Duration,
}

pub struct Deployer {
  tree: DeploymentTree,
  registry: Arc<WatchRegistry>,
  debouncer: DebouncerHandle,
  bootstrapper: Bootstrapper,
  compiler: ComponentCompiler,
  scheduler: Arc<Scheduler>,
  sink: Arc<dyn ManagementSink>,
  deploy_pool: WorkerPool,
  isolation_threshold: u32,
  requeue_delay: Duration,
  this: Weak<Deployer>,
}

impl Deployer {
  pub fn new(parts: DeployerParts) -> Arc<Self> {
    Arc::new_cyclic(|this| Self {
      tree: parts.tree,
      registry: parts.registry,
      debouncer: parts.debouncer,
      bootstrapper: parts.bootstrapper,
      compiler: parts.compiler,
      scheduler: parts.scheduler,
      sink: parts.sink,
      deploy_pool: parts.deploy_pool,
      isolation_threshold: parts.isolation_threshold,
      requeue_delay: parts.requeue_delay,
      this: this.clone(),
    })
  }

  pub fn tree(&self) -> &DeploymentTree {
    &self.tree
  }

  pub fn scheduler(&self) -> &Arc<Scheduler> {
    &self.scheduler
  }

  pub fn registry(&self) -> &Arc<WatchRegistry> {
    &self.registry
  }

  pub fn debouncer(&self) -> &DebouncerHandle {
    &self.debouncer
  }

  /// The live component deployed from `source`.
  pub async fn component(&self, source: &Path) -> Option<Arc<Component>> {
    let branch = self.tree.owning_branch(source)?;
    branch.component(source).await
  }

  /// Run `fut` on the deploy pool, abandoning it if the branch is destroyed.
  async fn hand_off<T, F>(&self, branch: &Branch, fut: F) -> Result<T, HandOffError>
  where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
  {
    let mut job = self.deploy_pool.spawn(fut);
    tokio::select! {
      biased;

      _ = branch.cancel_token().cancelled() => {
        job.abort();
        Err(HandOffError::Cancelled)
      }

      joined = &mut job => match joined {
        Ok(Some(out)) => Ok(out),
        Ok(None) => Err(HandOffError::Closed),
        Err(e) if e.is_panic() => Err(HandOffError::Panicked),
        Err(_) => Err(HandOffError::Cancelled),
      }
    }
  }

  // ==========================================================================
  // Roots
  // ==========================================================================

  /// Validate, watch and scan a deployment root.
  ///
  /// Returns the canonical path, or the reason the root was skipped.
  pub async fn add_root(&self, path: &Path) -> Result<PathBuf, String> {
    let canonical = tokio::fs::canonicalize(path)
      .await
      .map_err(|e| format!("cannot resolve: {e}"))?;
    let meta = tokio::fs::metadata(&canonical)
      .await
      .map_err(|e| format!("cannot stat: {e}"))?;
    if !meta.is_dir() {
      return Err("not a directory".to_string());
    }
    let _entries = tokio::fs::read_dir(&canonical)
      .await
      .map_err(|e| format!("not readable: {e}"))?;

    let Some(root) = self.tree.add_root(&canonical) else {
      return Err("already a deployment root".to_string());
    };

    let listener = self.listener(WatchRole::Root, &canonical);
    match self.registry.watch(&canonical, listener, EventKinds::ALL) {
      Ok(handle) => root.set_watch(handle),
      Err(e) => {
        self.tree.remove_root(&canonical);
        return Err(e.to_string());
      }
    }

    info!(root = %canonical.display(), "Deployment root added");
    self.scan_root(&canonical).await;
    Ok(canonical)
  }

  /// Stop watching a root and destroy every branch under it.
  pub async fn remove_root(&self, path: &Path) -> Result<PathBuf, String> {
    let canonical = tokio::fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());
    let Some(root) = self.tree.remove_root(&canonical) else {
      return Err("not a deployment root".to_string());
    };
    if let Some(handle) = root.take_watch() {
      self.registry.cancel(&handle);
    }
    self.destroy_branch(&canonical).await;
    info!(root = %canonical.display(), "Deployment root removed");
    Ok(canonical)
  }

  async fn scan_root(&self, root: &Path) {
    for dir in child_dirs(root).await {
      if Segment::from_dir(&dir).is_none() {
        warn!(dir = %dir.display(), "Skipping directory: name is not of the form key-value");
        continue;
      }
      if let Err(e) = self.deploy_directory(&dir).await {
        warn!(dir = %dir.display(), error = %e, "Skipping directory");
      }
    }
  }

  // ==========================================================================
  // Branches
  // ==========================================================================

  /// Resolve or create the branch for `dir`; new branches are bootstrapped
  /// and scanned before this returns.
  pub fn deploy_directory<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Arc<Branch>, TreeError>> {
    async move {
      let (branch, created) = self.tree.resolve_or_create(dir).await?;
      if !created {
        return Ok(branch);
      }

      let address = ObjectAddress::branch(branch.address());
      self.sink.register(address, branch.clone());
      info!(branch = %branch.address(), dir = %dir.display(), "Branch discovered");

      {
        let _bootstrap = branch.lock_bootstrap().await;
        self.watch(&branch, WatchRole::Branch, branch.dir());
        if self.bootstrap_branch(&branch).await {
          self.scan_branch(&branch).await;
        }
      }
      Ok(branch)
    }
    .boxed()
  }

  /// Build the branch scope. Callers hold the branch bootstrap lock.
  async fn bootstrap_branch(&self, branch: &Arc<Branch>) -> bool {
    let lib = branch.lib_dir();
    if is_dir(&lib).await {
      self.watch(branch, WatchRole::Lib, &lib);
    }

    let Some(this) = self.this.upgrade() else {
      return false;
    };
    let target = Arc::clone(branch);
    let result = self
      .hand_off(branch, async move { this.bootstrapper.bootstrap(&target).await })
      .await;

    let address = ObjectAddress::branch(branch.address());
    let reason = match result {
      Ok(Ok(runtime)) => {
        branch.set_runtime(runtime);
        branch.set_status(BranchStatus::Ready);
        self.sink.notify(&address, "branch.ready", &branch.dir().display().to_string());
        info!(branch = %branch.address(), "Branch ready");
        return true;
      }
      Ok(Err(e)) => e.to_string(),
      Err(HandOffError::Cancelled) => {
        debug!(branch = %branch.address(), "Bootstrap abandoned, branch destroyed");
        return false;
      }
      Err(e) => e.to_string(),
    };

    warn!(branch = %branch.address(), reason = %reason, "Branch bootstrap failed");
    branch.set_status(BranchStatus::Broken { reason: reason.clone() });
    self.sink.notify(&address, "branch.broken", &reason);
    false
  }

  /// Deploy every eligible source, then every child branch.
  async fn scan_branch(&self, branch: &Arc<Branch>) {
    let mut entries = Vec::new();
    match tokio::fs::read_dir(branch.dir()).await {
      Ok(mut dir) => {
        while let Ok(Some(entry)) = dir.next_entry().await {
          let path = entry.path();
          let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
          entries.push((path, is_dir));
        }
      }
      Err(e) => {
        warn!(branch = %branch.address(), error = %e, "Failed to scan branch directory");
        return;
      }
    }
    entries.sort();

    for (path, _) in entries.iter().filter(|(_, is_dir)| !is_dir) {
      if self.compiler.is_eligible(path) {
        self.deploy_source(branch, path).await;
      }
    }

    for (path, _) in entries.iter().filter(|(_, is_dir)| *is_dir) {
      if path.file_name().is_some_and(|n| n == LIB_DIR) || Segment::from_dir(path).is_none() {
        continue;
      }
      if let Err(e) = self.deploy_directory(path).await {
        warn!(dir = %path.display(), error = %e, "Skipping directory");
      }
    }
  }

  /// Tear down `dir`'s branch and everything below it.
  pub async fn destroy_branch(&self, dir: &Path) {
    let branches = self.tree.subtree(dir);
    if branches.is_empty() {
      return;
    }
    for branch in &branches {
      self.teardown(branch, Teardown::Destroy).await;
    }
    self.tree.remove(&branches).await;
  }

  /// Rebuild a branch's scope from scratch and redeploy its sources.
  ///
  /// Child branches hang off this branch's scope, so they are destroyed and
  /// recreated by the rescan.
  pub async fn rebootstrap(&self, branch: &Arc<Branch>, only_if_broken: bool) {
    let _bootstrap = branch.lock_bootstrap().await;
    if !branch.is_live() || (only_if_broken && !branch.status().is_broken()) {
      return;
    }
    info!(branch = %branch.address(), "Re-bootstrapping branch");

    let descendants: Vec<Arc<Branch>> = self
      .tree
      .subtree(branch.dir())
      .into_iter()
      .filter(|b| !Arc::ptr_eq(b, branch))
      .collect();
    for child in &descendants {
      self.teardown(child, Teardown::Destroy).await;
    }
    self.tree.remove(&descendants).await;

    self.teardown(branch, Teardown::Reset).await;
    if self.bootstrap_branch(branch).await {
      self.scan_branch(branch).await;
    }
  }

  async fn teardown(&self, branch: &Arc<Branch>, mode: Teardown) {
    let lib = branch.lib_dir();
    match mode {
      Teardown::Destroy => {
        // Raced with another teardown of the same branch
        if !branch.mark_destroyed() {
          return;
        }
        branch.cancel_token().cancel();
        for handle in branch.take_watches() {
          self.registry.cancel(&handle);
        }
      }
      Teardown::Reset => {
        branch.set_status(BranchStatus::Bootstrapping);
        for handle in branch.take_watches() {
          if handle.dir() == lib {
            self.registry.cancel(&handle);
          } else {
            branch.add_watch(handle);
          }
        }
      }
    }

    let slots: Vec<(PathBuf, Slot)> = branch.lock_components().await.drain().collect();
    for (_, slot) in slots {
      if let Slot::Live(component) = slot {
        self.retire(branch, &component, true).await;
      }
    }

    if let Some(runtime) = branch.take_runtime() {
      runtime.scope.stop().await;
    }

    if mode == Teardown::Destroy {
      let address = ObjectAddress::branch(branch.address());
      self.sink.notify(&address, "branch.destroyed", &branch.dir().display().to_string());
      self.sink.unregister(&address);
      info!(branch = %branch.address(), dir = %branch.dir().display(), "Branch destroyed");
    }
  }

  // ==========================================================================
  // Components
  // ==========================================================================

  /// Compile `path` and swap it in for whatever the file deployed before.
  pub async fn deploy_source(&self, branch: &Arc<Branch>, path: &Path) {
    let Some(runtime) = branch.runtime() else {
      return;
    };

    let (text, digest) = match self.compiler.read_source(path).await {
      Ok(read) => read,
      Err(CompileError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
        self.undeploy_source(branch, path).await;
        return;
      }
      Err(e) => {
        self.mark_bust(branch, path, None, e.to_string(), false).await;
        return;
      }
    };

    if self.is_unchanged(branch, path, &digest).await {
      debug!(path = %path.display(), "Source unchanged, skipping redeploy");
      return;
    }

    let Some(this) = self.this.upgrade() else {
      return;
    };
    let namespace = Arc::clone(&runtime.namespace);
    let origin = path.to_path_buf();
    let compiled = self
      .hand_off(branch, async move {
        this.compiler.compile_source(&text, Some(&origin), &namespace).await
      })
      .await;

    let compiled = match compiled {
      Ok(Ok(compiled)) => compiled,
      Ok(Err(e)) => {
        self.mark_bust(branch, path, Some(digest), e.to_string(), false).await;
        return;
      }
      Err(HandOffError::Cancelled) => {
        debug!(path = %path.display(), "Compile abandoned, branch destroyed");
        return;
      }
      Err(e) => {
        self.mark_bust(branch, path, Some(digest), e.to_string(), true).await;
        return;
      }
    };

    let component = Arc::new(Component::new(
      compiled,
      branch.address().clone(),
      Arc::clone(&runtime.scope),
      self.isolation_threshold,
    ));

    let kind = {
      let mut slots = branch.lock_components().await;

      // Destroyed or re-bootstrapped while compiling; the rescan redeploys
      let current_scope = branch.runtime().map(|rt| rt.scope.id().to_string());
      if !branch.is_live() || current_scope.as_deref() != Some(runtime.scope.id()) {
        debug!(path = %path.display(), "Branch changed during compile, dropping result");
        return;
      }
      // A concurrent deploy of the same content won
      if slots.get(path).and_then(Slot::component).is_some_and(|c| c.digest() == digest) {
        return;
      }

      if let Some(other) = slots
        .iter()
        .find(|(p, s)| p.as_path() != path && s.component().is_some_and(|c| c.name() == component.name()))
        .map(|(p, _)| p.clone())
      {
        let reason = format!("component name '{}' is already deployed from {}", component.name(), other.display());
        drop(slots);
        self
          .mark_bust(branch, path, Some(component.digest().to_string()), reason, false)
          .await;
        return;
      }

      let previous = slots.remove(path);
      let replaced = match &previous {
        Some(Slot::Live(old)) => {
          self.retire(branch, old, false).await;
          true
        }
        _ => false,
      };

      match component.start().await {
        Ok(()) => {
          slots.insert(path.to_path_buf(), Slot::Live(Arc::clone(&component)));
          self.sink.register(
            ObjectAddress::component(branch.address(), component.name()),
            component.clone(),
          );
          match component.schedule() {
            Some(spec) => {
              if let Err(e) = self.scheduler.schedule(Arc::clone(&component), spec) {
                warn!(component = %component.name(), error = %e, "Failed to schedule component");
              }
            }
            None => self.scheduler.cancel(&component),
          }
          info!(
            branch = %branch.address(),
            component = %component.name(),
            path = %path.display(),
            replaced,
            "Component deployed"
          );
          if replaced {
            ComponentEventKind::Replaced
          } else {
            ComponentEventKind::Deployed
          }
        }
        Err(e) => {
          self.scheduler.cancel(&component);
          let reason = e.to_string();
          warn!(component = %component.name(), path = %path.display(), error = %reason, "Component failed to start");
          self.sink.notify(&ObjectAddress::branch(branch.address()), "component.bust", &reason);
          slots.insert(
            path.to_path_buf(),
            Slot::Bust {
              name: Some(component.name().to_string()),
              digest: Some(digest),
              reason,
              retry: true,
            },
          );
          ComponentEventKind::Bust
        }
      }
    };

    self
      .fan_out(branch, ComponentEvent {
        branch: branch.address().to_string(),
        component: component.name().to_string(),
        source: path.to_path_buf(),
        kind,
      })
      .await;
  }

  /// Stop and forget whatever `path` deployed.
  pub async fn undeploy_source(&self, branch: &Arc<Branch>, path: &Path) {
    let removed = {
      let mut slots = branch.lock_components().await;
      let removed = slots.remove(path);
      if let Some(Slot::Live(component)) = &removed {
        self.retire(branch, component, true).await;
      }
      removed
    };

    match removed {
      Some(Slot::Live(component)) => {
        info!(branch = %branch.address(), component = %component.name(), path = %path.display(), "Component undeployed");
        self
          .fan_out(branch, ComponentEvent {
            branch: branch.address().to_string(),
            component: component.name().to_string(),
            source: path.to_path_buf(),
            kind: ComponentEventKind::Undeployed,
          })
          .await;
      }
      Some(Slot::Bust { .. }) => debug!(path = %path.display(), "Forgot bust source"),
      None => trace!(path = %path.display(), "Nothing deployed from path"),
    }
  }

  async fn is_unchanged(&self, branch: &Branch, path: &Path, digest: &str) -> bool {
    let slots = branch.lock_components().await;
    match slots.get(path) {
      // Start failures may succeed once a dependency shows up
      Some(Slot::Bust { retry: true, .. }) | None => false,
      Some(slot) => slot.digest() == Some(digest),
    }
  }

  /// Record a failed compile. A previously live component from the same file
  /// is stopped and unscheduled.
  async fn mark_bust(&self, branch: &Arc<Branch>, path: &Path, digest: Option<String>, reason: String, retry: bool) {
    warn!(branch = %branch.address(), path = %path.display(), error = %reason, "Component bust");
    let name = {
      let mut slots = branch.lock_components().await;
      let name = match slots.remove(path) {
        Some(Slot::Live(old)) => {
          self.retire(branch, &old, true).await;
          Some(old.name().to_string())
        }
        Some(Slot::Bust { name, .. }) => name,
        None => None,
      };
      slots.insert(
        path.to_path_buf(),
        Slot::Bust {
          name: name.clone(),
          digest,
          reason: reason.clone(),
          retry,
        },
      );
      name
    };

    self
      .sink
      .notify(&ObjectAddress::branch(branch.address()), "component.bust", &reason);
    self
      .fan_out(branch, ComponentEvent {
        branch: branch.address().to_string(),
        component: name.unwrap_or_default(),
        source: path.to_path_buf(),
        kind: ComponentEventKind::Bust,
      })
      .await;
  }

  /// Stop a component that is leaving its slot. On redeploy the schedule
  /// entry is left for the replacement to swap.
  async fn retire(&self, branch: &Branch, component: &Arc<Component>, unschedule: bool) {
    if unschedule {
      self.scheduler.cancel(component);
    }
    if component.state().is_running()
      && let Err(e) = component.stop().await
    {
      debug!(component = %component.name(), error = %e, "Stop skipped");
    }
    self
      .sink
      .unregister(&ObjectAddress::component(branch.address(), component.name()));
  }

  /// Tell the branch's event listeners about a sibling change.
  async fn fan_out(&self, branch: &Branch, event: ComponentEvent) {
    let listeners: Vec<Arc<Component>> = branch
      .components()
      .await
      .into_iter()
      .filter(|c| c.instance().event_listener().is_some() && c.source() != Some(event.source.as_path()))
      .collect();
    for listener in listeners {
      listener.deliver(&event).await;
    }
  }

  // ==========================================================================
  // Event routing
  // ==========================================================================

  fn listener(&self, role: WatchRole, dir: &Path) -> Arc<dyn WatchListener> {
    Arc::new(DirWatch {
      handler: Arc::new(DirHandler {
        deployer: self.this.clone(),
        role,
        dir: dir.to_path_buf(),
      }),
      debouncer: self.debouncer.clone(),
    })
  }

  fn watch(&self, branch: &Branch, role: WatchRole, dir: &Path) {
    match self.registry.watch(dir, self.listener(role, dir), EventKinds::ALL) {
      Ok(handle) => branch.add_watch(handle),
      Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to watch directory"),
    }
  }

  async fn handle_event(&self, handler: &DirHandler, event: FileEvent) {
    trace!(path = %event.path.display(), kind = ?event.kind, role = ?handler.role, "Processing event");
    match handler.role {
      WatchRole::Root => self.on_root_event(&event).await,
      WatchRole::Branch => self.on_branch_event(&handler.dir, event).await,
      WatchRole::Lib => {
        let Some(dir) = handler.dir.parent() else {
          return;
        };
        if let Some(branch) = self.tree.get(dir) {
          self.rebootstrap(&branch, false).await;
        }
      }
    }
  }

  async fn on_root_event(&self, event: &FileEvent) {
    if event.kind == FileEventKind::Deleted {
      self.destroy_branch(&event.path).await;
      return;
    }
    if !is_dir(&event.path).await {
      return;
    }
    if Segment::from_dir(&event.path).is_none() {
      warn!(dir = %event.path.display(), "Skipping directory: name is not of the form key-value");
      return;
    }
    if let Err(e) = self.deploy_directory(&event.path).await {
      warn!(dir = %event.path.display(), error = %e, "Skipping directory");
    }
  }

  async fn on_branch_event(&self, dir: &Path, event: FileEvent) {
    let Some(branch) = self.tree.get(dir) else {
      trace!(dir = %dir.display(), "Event for untracked branch directory");
      return;
    };

    match branch.status() {
      BranchStatus::Bootstrapping => {
        let delay = self.requeue_delay;
        if let Err(e) = self.debouncer.enqueue_with_delay(event, delay) {
          debug!(error = %e, "Dropping event for bootstrapping branch");
        }
        return;
      }
      BranchStatus::Broken { .. } => {
        self.rebootstrap(&branch, true).await;
        return;
      }
      BranchStatus::Destroyed => return,
      BranchStatus::Ready => {}
    }

    let path = event.path.as_path();
    if path.file_name().is_some_and(|n| n == LIB_DIR) {
      self.rebootstrap(&branch, false).await;
      return;
    }

    if event.kind == FileEventKind::Deleted {
      if self.tree.get(path).is_some() {
        self.destroy_branch(path).await;
      } else {
        self.undeploy_source(&branch, path).await;
      }
      return;
    }

    match tokio::fs::metadata(path).await {
      Err(_) => self.undeploy_source(&branch, path).await,
      Ok(meta) if meta.is_dir() => {
        if Segment::from_dir(path).is_none() {
          trace!(dir = %path.display(), "Not a branch directory");
          return;
        }
        if let Err(e) = self.deploy_directory(path).await {
          warn!(dir = %path.display(), error = %e, "Skipping directory");
        }
      }
      Ok(_) => {
        if self.compiler.is_eligible(path) {
          self.deploy_source(&branch, path).await;
        }
      }
    }
  }

  /// A branch directory was deleted. Teardown starts now, outside the
  /// `events` pool, so in-flight work on the branch is cancelled even while
  /// every events worker is busy with it.
  fn on_dir_deleted(&self, dir: &Path) {
    if self.tree.get(dir).is_none() || dir.exists() {
      return;
    }
    let Some(this) = self.this.upgrade() else {
      return;
    };
    let dir = dir.to_path_buf();
    debug!(dir = %dir.display(), "Branch directory deleted, tearing down");
    tokio::spawn(async move { this.destroy_branch(&dir).await });
  }

  /// A watched directory vanished without a delete event reaching us.
  fn on_dir_cancelled(&self, role: WatchRole, dir: &Path) {
    let Some(this) = self.this.upgrade() else {
      return;
    };
    let dir = dir.to_path_buf();
    match role {
      WatchRole::Root => {
        warn!(root = %dir.display(), "Deployment root disappeared");
        tokio::spawn(async move {
          let _ = this.remove_root(&dir).await;
        });
      }
      WatchRole::Branch => {
        tokio::spawn(async move { this.destroy_branch(&dir).await });
      }
      // The branch watch sees lib/ go away and re-bootstraps
      WatchRole::Lib => {}
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
  Destroy,
  Reset,
}

async fn is_dir(path: &Path) -> bool {
  tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

/// Immediate subdirectories of `dir`, sorted.
async fn child_dirs(dir: &Path) -> Vec<PathBuf> {
  let mut out = Vec::new();
  let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
    return out;
  };
  while let Ok(Some(entry)) = entries.next_entry().await {
    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
      out.push(entry.path());
    }
  }
  out.sort();
  out
}

// ============================================================================
// Listeners
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchRole {
  Root,
  Branch,
  Lib,
}

/// Processes settled events for one watched directory
struct DirHandler {
  deployer: Weak<Deployer>,
  role: WatchRole,
  dir: PathBuf,
}

#[async_trait]
impl EventHandler for DirHandler {
  fn describe(&self) -> String {
    format!("{:?}:{}", self.role, self.dir.display())
  }

  async fn handle(&self, event: FileEvent) {
    if let Some(deployer) = self.deployer.upgrade() {
      deployer.handle_event(self, event).await;
    }
  }
}

/// Bridges native watch callbacks into the debouncer
struct DirWatch {
  handler: Arc<DirHandler>,
  debouncer: DebouncerHandle,
}

impl WatchListener for DirWatch {
  fn on_event(&self, path: &Path, kind: FileEventKind) {
    if kind == FileEventKind::Deleted
      && let Some(deployer) = self.handler.deployer.upgrade()
    {
      deployer.on_dir_deleted(path);
    }
    let event = FileEvent::new(path.to_path_buf(), kind, self.handler.clone());
    if let Err(e) = self.debouncer.enqueue(event) {
      trace!(path = %path.display(), error = %e, "Debouncer gone, dropping event");
    }
  }

  fn on_cancelled(&self, dir: &Path) {
    if let Some(deployer) = self.handler.deployer.upgrade() {
      deployer.on_dir_cancelled(self.handler.role, dir);
    }
  }
}
