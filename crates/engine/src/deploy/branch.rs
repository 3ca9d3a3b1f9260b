//! Deployment branch: one `key-value` directory and everything deployed from it

use std::{
  collections::HashMap,
  fmt,
  path::{Path, PathBuf},
  sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::sync::CancellationToken;

use crate::{
  component::Component,
  domain::{
    address::{BranchAddress, Segment},
    state::{BranchStatus, CollectorState},
  },
  host::{ExecutionScope, Namespace},
  management::Managed,
  watch::WatchHandle,
};

/// What a source file under a branch currently maps to
pub enum Slot {
  Live(Arc<Component>),
  /// Compilation or compile-triggered start failed; the file stays watched
  Bust {
    name: Option<String>,
    digest: Option<String>,
    reason: String,
    /// Failed at start rather than compile; the same digest is tried again
    retry: bool,
  },
}

impl Slot {
  pub fn component(&self) -> Option<&Arc<Component>> {
    match self {
      Self::Live(component) => Some(component),
      Self::Bust { .. } => None,
    }
  }

  pub fn digest(&self) -> Option<&str> {
    match self {
      Self::Live(component) => Some(component.digest()),
      Self::Bust { digest, .. } => digest.as_deref(),
    }
  }
}

/// Namespace and scope built by the bootstrapper
#[derive(Clone)]
pub struct BranchRuntime {
  pub namespace: Arc<Namespace>,
  pub scope: Arc<dyn ExecutionScope>,
}

impl fmt::Debug for BranchRuntime {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BranchRuntime")
      .field("scope", &self.scope.id())
      .field("namespace", &self.namespace.own_sources())
      .finish()
  }
}

pub struct Branch {
  dir: PathBuf,
  root: PathBuf,
  segment: Segment,
  address: BranchAddress,
  parent: Option<Weak<Branch>>,
  created_at: DateTime<Utc>,

  status: watch::Sender<BranchStatus>,
  runtime: RwLock<Option<BranchRuntime>>,
  /// Per-branch update lock over the component set
  components: Mutex<HashMap<PathBuf, Slot>>,
  /// Serializes bootstrap and re-bootstrap
  bootstrap: Mutex<()>,
  watches: StdMutex<Vec<WatchHandle>>,
  cancel: CancellationToken,
}

impl Branch {
  pub fn new(
    dir: PathBuf,
    root: PathBuf,
    segment: Segment,
    address: BranchAddress,
    parent: Option<&Arc<Branch>>,
    cancel: CancellationToken,
  ) -> Self {
    let (status, _) = watch::channel(BranchStatus::Bootstrapping);
    Self {
      dir,
      root,
      segment,
      address,
      parent: parent.map(Arc::downgrade),
      created_at: Utc::now(),
      status,
      runtime: RwLock::new(None),
      components: Mutex::new(HashMap::new()),
      bootstrap: Mutex::new(()),
      watches: StdMutex::new(Vec::new()),
      cancel,
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn address(&self) -> &BranchAddress {
    &self.address
  }

  /// The parent branch, if it is still alive.
  pub fn parent(&self) -> Option<Arc<Branch>> {
    self.parent.as_ref().and_then(Weak::upgrade)
  }

  pub fn is_root_branch(&self) -> bool {
    self.parent.is_none()
  }

  pub fn lib_dir(&self) -> PathBuf {
    self.dir.join("lib")
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  pub fn status(&self) -> BranchStatus {
    self.status.borrow().clone()
  }

  pub fn set_status(&self, status: BranchStatus) {
    self.status.send_replace(status);
  }

  /// Mark the branch destroyed; false if it already was.
  pub fn mark_destroyed(&self) -> bool {
    self.status.send_if_modified(|status| {
      if matches!(status, BranchStatus::Destroyed) {
        return false;
      }
      *status = BranchStatus::Destroyed;
      true
    })
  }

  pub fn is_live(&self) -> bool {
    !matches!(*self.status.borrow(), BranchStatus::Destroyed)
  }

  // ==========================================================================
  // Runtime
  // ==========================================================================

  pub fn runtime(&self) -> Option<BranchRuntime> {
    self.runtime.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn set_runtime(&self, runtime: BranchRuntime) {
    *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
  }

  pub fn take_runtime(&self) -> Option<BranchRuntime> {
    self.runtime.write().unwrap_or_else(PoisonError::into_inner).take()
  }

  // ==========================================================================
  // Components
  // ==========================================================================

  /// Take the branch update lock.
  pub async fn lock_components(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
    self.components.lock().await
  }

  pub(crate) async fn lock_bootstrap(&self) -> MutexGuard<'_, ()> {
    self.bootstrap.lock().await
  }

  pub async fn component(&self, source: &Path) -> Option<Arc<Component>> {
    self.components.lock().await.get(source).and_then(|s| s.component().cloned())
  }

  pub async fn components(&self) -> Vec<Arc<Component>> {
    self
      .components
      .lock()
      .await
      .values()
      .filter_map(|s| s.component().cloned())
      .collect()
  }

  // ==========================================================================
  // Watches
  // ==========================================================================

  pub fn add_watch(&self, handle: WatchHandle) {
    self.watches.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
  }

  pub fn take_watches(&self) -> Vec<WatchHandle> {
    std::mem::take(&mut *self.watches.lock().unwrap_or_else(PoisonError::into_inner))
  }

  // ==========================================================================
  // Snapshot
  // ==========================================================================

  pub async fn snapshot(&self) -> BranchSnapshot {
    let slots = self.components.lock().await;
    let mut components: Vec<ComponentSnapshot> = slots.iter().map(|(path, slot)| ComponentSnapshot::new(path, slot)).collect();
    drop(slots);
    components.sort_by(|a, b| a.source.cmp(&b.source));

    BranchSnapshot {
      address: self.address.to_string(),
      dir: self.dir.clone(),
      root: self.root.clone(),
      parent: self.parent().map(|p| p.address.to_string()),
      status: self.status(),
      namespace: self
        .runtime()
        .map(|rt| rt.namespace.own_sources().to_vec())
        .unwrap_or_default(),
      components,
    }
  }
}

impl fmt::Debug for Branch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Branch")
      .field("address", &self.address.to_string())
      .field("dir", &self.dir)
      .field("status", &self.status())
      .finish()
  }
}

impl Managed for Branch {
  fn kind(&self) -> &'static str {
    "branch"
  }

  fn attributes(&self) -> serde_json::Value {
    // Attribute reads must not wait on a redeploy in progress
    let components = self.components.try_lock().ok().map(|slots| {
      slots
        .iter()
        .map(|(path, slot)| ComponentSnapshot::new(path, slot))
        .collect::<Vec<_>>()
    });
    json!({
      "address": self.address.to_string(),
      "segment": self.segment.to_string(),
      "dir": self.dir,
      "root": self.root,
      "parent": self.parent().map(|p| p.address.to_string()),
      "status": self.status(),
      "scope": self.runtime().map(|rt| rt.scope.id().to_string()),
      "namespace": self.runtime().map(|rt| rt.namespace.own_sources().to_vec()),
      "components": components,
      "created_at": self.created_at.to_rfc3339(),
    })
  }
}

/// Serializable view of one branch
#[derive(Debug, Clone, Serialize)]
pub struct BranchSnapshot {
  pub address: String,
  pub dir: PathBuf,
  pub root: PathBuf,
  pub parent: Option<String>,
  pub status: BranchStatus,
  pub namespace: Vec<PathBuf>,
  pub components: Vec<ComponentSnapshot>,
}

/// Serializable view of one source file slot
#[derive(Debug, Clone, Serialize)]
pub struct ComponentSnapshot {
  pub source: PathBuf,
  pub name: Option<String>,
  pub state: CollectorState,
  pub consecutive_failures: u32,
  pub capabilities: Vec<&'static str>,
  pub schedule: Option<String>,
  pub error: Option<String>,
}

impl ComponentSnapshot {
  fn new(path: &Path, slot: &Slot) -> Self {
    match slot {
      Slot::Live(c) => Self {
        source: path.to_path_buf(),
        name: Some(c.name().to_string()),
        state: c.state(),
        consecutive_failures: c.consecutive_failures(),
        capabilities: c.instance().capabilities().names(),
        schedule: c.schedule().map(|s| s.to_string()),
        error: None,
      },
      Slot::Bust { name, reason, .. } => Self {
        source: path.to_path_buf(),
        name: name.clone(),
        state: CollectorState::Bust,
        consecutive_failures: 0,
        capabilities: Vec::new(),
        schedule: None,
        error: Some(reason.clone()),
      },
    }
  }
}
