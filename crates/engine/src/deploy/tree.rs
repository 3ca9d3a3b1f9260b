//! DeploymentTree - the live set of deployment roots and branches
//!
//! Branches are indexed two ways: by directory (for event routing) and by
//! address (the identity management and components see). Both indexes are
//! `DashMap`s for lock-free reads; structural changes (creating or removing
//! branches) go through one async mutex so the two indexes never disagree.
//!
//! The tree only tracks structure. Bootstrapping, component deployment and
//! teardown belong to the deployer, which calls `resolve_or_create`,
//! `subtree` and `remove` around that work.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::branch::Branch;
use crate::{
  domain::address::{AddressError, BranchAddress, resolve_address},
  watch::WatchHandle,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
  #[error(transparent)]
  Address(#[from] AddressError),

  #[error("{dir} is not under a deployment root")]
  OutsideRoot { dir: PathBuf },
}

// ============================================================================
// DeploymentRoot
// ============================================================================

/// A configured root directory. Its immediate `key-value` children are
/// top-level branches; the root itself contributes no address segment.
pub struct DeploymentRoot {
  path: PathBuf,
  cancel: CancellationToken,
  watch: std::sync::Mutex<Option<WatchHandle>>,
}

impl DeploymentRoot {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn set_watch(&self, handle: WatchHandle) {
    *self.watch.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
  }

  pub fn take_watch(&self) -> Option<WatchHandle> {
    self.watch.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
  }
}

// ============================================================================
// DeploymentTree
// ============================================================================

pub struct DeploymentTree {
  roots: DashMap<PathBuf, Arc<DeploymentRoot>>,
  by_dir: DashMap<PathBuf, Arc<Branch>>,
  by_address: DashMap<BranchAddress, Arc<Branch>>,
  /// Held for every structural change
  update: Mutex<()>,
  cancel: CancellationToken,
}

impl DeploymentTree {
  /// `cancel` is the parent of every root's token.
  pub fn new(cancel: CancellationToken) -> Self {
    Self {
      roots: DashMap::new(),
      by_dir: DashMap::new(),
      by_address: DashMap::new(),
      update: Mutex::new(()),
      cancel,
    }
  }

  // ==========================================================================
  // Roots
  // ==========================================================================

  /// Register a root. Returns `None` if it is already registered.
  pub fn add_root(&self, path: &Path) -> Option<Arc<DeploymentRoot>> {
    match self.roots.entry(path.to_path_buf()) {
      dashmap::mapref::entry::Entry::Occupied(_) => None,
      dashmap::mapref::entry::Entry::Vacant(slot) => {
        let root = Arc::new(DeploymentRoot {
          path: path.to_path_buf(),
          cancel: self.cancel.child_token(),
          watch: std::sync::Mutex::new(None),
        });
        slot.insert(root.clone());
        Some(root)
      }
    }
  }

  /// Unregister a root and cancel its token. Branches are left to the caller.
  pub fn remove_root(&self, path: &Path) -> Option<Arc<DeploymentRoot>> {
    let (_, root) = self.roots.remove(path)?;
    root.cancel.cancel();
    Some(root)
  }

  pub fn root(&self, path: &Path) -> Option<Arc<DeploymentRoot>> {
    self.roots.get(path).map(|r| r.value().clone())
  }

  pub fn roots(&self) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = self.roots.iter().map(|r| r.key().clone()).collect();
    roots.sort();
    roots
  }

  /// The registered root containing `dir`, if any.
  pub fn root_of(&self, dir: &Path) -> Option<Arc<DeploymentRoot>> {
    self
      .roots
      .iter()
      .filter(|r| dir.starts_with(r.key()) && dir != r.key().as_path())
      .max_by_key(|r| r.key().components().count())
      .map(|r| r.value().clone())
  }

  // ==========================================================================
  // Branches
  // ==========================================================================

  /// Get the branch for `dir`, creating it if needed.
  ///
  /// Returns the branch and whether this call created it. A newly created
  /// branch is in `Bootstrapping`; the caller bootstraps it.
  ///
  /// When another live branch already has the same address (two directories
  /// resolving to the same segment set), the existing branch is returned and
  /// the new directory is not tracked.
  pub async fn resolve_or_create(&self, dir: &Path) -> Result<(Arc<Branch>, bool), TreeError> {
    // Fast path
    if let Some(branch) = self.get(dir) {
      return Ok((branch, false));
    }

    let root = self.root_of(dir).ok_or_else(|| TreeError::OutsideRoot { dir: dir.to_path_buf() })?;
    let resolved = resolve_address(dir, Some(root.path()))?;

    let _guard = self.update.lock().await;

    // Another task may have created it while we waited for the lock
    if let Some(branch) = self.get(dir) {
      debug!(dir = %dir.display(), "Branch created by another task");
      return Ok((branch, false));
    }

    if let Some(existing) = self.by_address.get(&resolved.address).map(|b| b.value().clone())
      && existing.is_live()
    {
      warn!(
        address = %resolved.address,
        existing = %existing.dir().display(),
        ignored = %dir.display(),
        "Two directories resolve to the same branch address; keeping the existing branch"
      );
      return Ok((existing, false));
    }

    let parent = resolved
      .parent
      .as_ref()
      .and_then(|(parent_dir, _)| self.get(parent_dir));
    let cancel = match &parent {
      Some(p) => p.cancel_token().child_token(),
      None => root.cancel_token().child_token(),
    };

    let branch = Arc::new(Branch::new(
      dir.to_path_buf(),
      root.path().to_path_buf(),
      resolved.segment,
      resolved.address.clone(),
      parent.as_ref(),
      cancel,
    ));

    self.by_dir.insert(dir.to_path_buf(), branch.clone());
    self.by_address.insert(resolved.address, branch.clone());

    debug!(
      address = %branch.address(),
      dir = %dir.display(),
      parent = ?parent.as_ref().map(|p| p.address().to_string()),
      "Branch created"
    );

    Ok((branch, true))
  }

  /// Live branch for a directory.
  pub fn get(&self, dir: &Path) -> Option<Arc<Branch>> {
    self
      .by_dir
      .get(dir)
      .map(|b| b.value().clone())
      .filter(|b| b.is_live())
  }

  /// Live branch for an address.
  pub fn by_address(&self, address: &BranchAddress) -> Option<Arc<Branch>> {
    self
      .by_address
      .get(address)
      .map(|b| b.value().clone())
      .filter(|b| b.is_live())
  }

  /// The branch whose directory directly contains `path`.
  pub fn owning_branch(&self, path: &Path) -> Option<Arc<Branch>> {
    path.parent().and_then(|dir| self.get(dir))
  }

  /// All tracked branches, ordered by directory (parents before children).
  pub fn branches(&self) -> Vec<Arc<Branch>> {
    let mut branches: Vec<Arc<Branch>> = self.by_dir.iter().map(|b| b.value().clone()).collect();
    branches.sort_by(|a, b| a.dir().cmp(b.dir()));
    branches
  }

  /// `dir`'s branch and every branch below it, deepest first.
  pub fn subtree(&self, dir: &Path) -> Vec<Arc<Branch>> {
    let mut branches: Vec<Arc<Branch>> = self
      .by_dir
      .iter()
      .filter(|b| b.key().starts_with(dir))
      .map(|b| b.value().clone())
      .collect();
    branches.sort_by(|a, b| {
      b.dir()
        .components()
        .count()
        .cmp(&a.dir().components().count())
        .then_with(|| a.dir().cmp(b.dir()))
    });
    branches
  }

  /// Top-level branches of a root.
  pub fn top_level(&self, root: &Path) -> Vec<Arc<Branch>> {
    let mut branches: Vec<Arc<Branch>> = self
      .by_dir
      .iter()
      .filter(|b| b.value().root() == root && b.value().is_root_branch())
      .map(|b| b.value().clone())
      .collect();
    branches.sort_by(|a, b| a.dir().cmp(b.dir()));
    branches
  }

  /// Drop torn-down branches from both indexes.
  ///
  /// The address index is only cleared when it still points at the same
  /// branch, so a replacement created meanwhile survives.
  pub async fn remove(&self, branches: &[Arc<Branch>]) {
    let _guard = self.update.lock().await;
    for branch in branches {
      self.by_dir.remove_if(branch.dir(), |_, b| Arc::ptr_eq(b, branch));
      self.by_address.remove_if(branch.address(), |_, b| Arc::ptr_eq(b, branch));
    }
  }

  pub fn len(&self) -> usize {
    self.by_dir.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_dir.is_empty()
  }
}
