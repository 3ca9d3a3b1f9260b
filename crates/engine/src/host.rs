//! Hosting runtime seam
//!
//! The engine never talks to a concrete container. Each branch gets an
//! `ExecutionScope` started through a `HostRuntime`: a named bean registry with
//! parent fallback, tagged with the branch directory and its code-resolution
//! `Namespace`. `LocalHost` is the in-process implementation.

use std::{
  any::Any,
  collections::BTreeMap,
  fmt,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// A value registered in a scope. Typed access goes through `lookup_as`.
pub type Bean = Arc<dyn Any + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
  #[error("scope '{0}' is not running")]
  NotRunning(String),

  #[error("scope '{0}' is already running")]
  AlreadyRunning(String),

  #[error("bean '{0}' not found")]
  BeanNotFound(String),

  #[error("bean '{name}' is not a {expected}")]
  BeanType { name: String, expected: &'static str },

  #[error("resolution source {path} is not readable: {reason}")]
  Source { path: PathBuf, reason: String },
}

// ============================================================================
// Namespace
// ============================================================================

/// Ordered code-resolution sources chained to a parent namespace.
///
/// Resolution is child-first: a branch's own `lib/` archives shadow anything
/// with the same file name further up the chain.
#[derive(Debug, Clone)]
pub struct Namespace {
  name: String,
  home: Option<PathBuf>,
  sources: Vec<PathBuf>,
  parent: Option<Arc<Namespace>>,
}

impl Namespace {
  /// The empty namespace every chain ends in
  pub fn root() -> Arc<Self> {
    Arc::new(Self {
      name: "root".to_string(),
      home: None,
      sources: Vec::new(),
      parent: None,
    })
  }

  pub fn child(parent: &Arc<Namespace>, name: impl Into<String>, home: &Path, sources: Vec<PathBuf>) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      home: Some(home.to_path_buf()),
      sources,
      parent: Some(Arc::clone(parent)),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Directory the namespace belongs to (the branch directory)
  pub fn home(&self) -> Option<&Path> {
    self.home.as_deref()
  }

  /// Sources contributed by this namespace alone
  pub fn own_sources(&self) -> &[PathBuf] {
    &self.sources
  }

  pub fn parent(&self) -> Option<&Arc<Namespace>> {
    self.parent.as_ref()
  }

  /// All sources in resolution order (own first, then each ancestor).
  pub fn sources(&self) -> Vec<PathBuf> {
    let mut out = self.sources.clone();
    let mut current = self.parent.as_deref();
    while let Some(ns) = current {
      out.extend(ns.sources.iter().cloned());
      current = ns.parent.as_deref();
    }
    out
  }

  /// Find a source by file name, nearest namespace first.
  pub fn resolve(&self, file_name: &str) -> Option<PathBuf> {
    self
      .sources()
      .into_iter()
      .find(|p| p.file_name().is_some_and(|n| n == file_name))
  }
}

// ============================================================================
// Scope events
// ============================================================================

/// Refresh notifications published by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
  Started { scope: String },
  Refreshed { scope: String, bean: String },
  Stopped { scope: String },
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait ExecutionScope: Send + Sync {
  fn id(&self) -> &str;

  fn namespace(&self) -> Arc<Namespace>;

  fn tags(&self) -> &BTreeMap<String, String>;

  fn parent(&self) -> Option<Arc<dyn ExecutionScope>>;

  fn is_running(&self) -> bool;

  async fn start(&self) -> Result<(), HostError>;

  /// Stop the scope and drop its beans. Stopping a stopped scope is a no-op.
  async fn stop(&self);

  fn register_bean(&self, name: &str, bean: Bean) -> Result<(), HostError>;

  fn remove_bean(&self, name: &str) -> Option<Bean>;

  /// Look a bean up here, then in each parent scope.
  fn lookup(&self, name: &str) -> Option<Bean>;
}

impl dyn ExecutionScope {
  /// Typed lookup.
  pub fn lookup_as<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, HostError> {
    let bean = self.lookup(name).ok_or_else(|| HostError::BeanNotFound(name.to_string()))?;
    bean.downcast::<T>().map_err(|_| HostError::BeanType {
      name: name.to_string(),
      expected: std::any::type_name::<T>(),
    })
  }
}

impl fmt::Debug for dyn ExecutionScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionScope")
      .field("id", &self.id())
      .field("running", &self.is_running())
      .finish()
  }
}

#[async_trait]
pub trait HostRuntime: Send + Sync {
  /// The process-wide root scope, running for the life of the host
  fn root_scope(&self) -> Arc<dyn ExecutionScope>;

  /// Create and start a scope under `parent`.
  async fn start_child_scope(
    &self,
    parent: &Arc<dyn ExecutionScope>,
    namespace: Arc<Namespace>,
    tags: BTreeMap<String, String>,
  ) -> Result<Arc<dyn ExecutionScope>, HostError>;

  fn subscribe(&self) -> broadcast::Receiver<ScopeEvent>;
}

// ============================================================================
// LocalHost
// ============================================================================

pub struct LocalScope {
  id: String,
  namespace: Arc<Namespace>,
  tags: BTreeMap<String, String>,
  parent: Option<Arc<dyn ExecutionScope>>,
  beans: DashMap<String, Bean>,
  running: AtomicBool,
  events: broadcast::Sender<ScopeEvent>,
}

impl LocalScope {
  fn publish(&self, event: ScopeEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  pub fn bean_names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.beans.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
  }
}

#[async_trait]
impl ExecutionScope for LocalScope {
  fn id(&self) -> &str {
    &self.id
  }

  fn namespace(&self) -> Arc<Namespace> {
    Arc::clone(&self.namespace)
  }

  fn tags(&self) -> &BTreeMap<String, String> {
    &self.tags
  }

  fn parent(&self) -> Option<Arc<dyn ExecutionScope>> {
    self.parent.clone()
  }

  fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  async fn start(&self) -> Result<(), HostError> {
    if let Some(parent) = &self.parent
      && !parent.is_running()
    {
      return Err(HostError::NotRunning(parent.id().to_string()));
    }
    for source in self.namespace.own_sources() {
      let meta = std::fs::metadata(source).map_err(|e| HostError::Source {
        path: source.clone(),
        reason: e.to_string(),
      })?;
      if !meta.is_file() {
        return Err(HostError::Source {
          path: source.clone(),
          reason: "not a regular file".to_string(),
        });
      }
    }
    if self.running.swap(true, Ordering::SeqCst) {
      return Err(HostError::AlreadyRunning(self.id.clone()));
    }
    debug!(scope = %self.id, sources = self.namespace.own_sources().len(), "Scope started");
    self.publish(ScopeEvent::Started { scope: self.id.clone() });
    Ok(())
  }

  async fn stop(&self) {
    if self.running.swap(false, Ordering::SeqCst) {
      self.beans.clear();
      debug!(scope = %self.id, "Scope stopped");
      self.publish(ScopeEvent::Stopped { scope: self.id.clone() });
    }
  }

  fn register_bean(&self, name: &str, bean: Bean) -> Result<(), HostError> {
    if !self.is_running() {
      return Err(HostError::NotRunning(self.id.clone()));
    }
    self.beans.insert(name.to_string(), bean);
    trace!(scope = %self.id, bean = name, "Bean registered");
    self.publish(ScopeEvent::Refreshed {
      scope: self.id.clone(),
      bean: name.to_string(),
    });
    Ok(())
  }

  fn remove_bean(&self, name: &str) -> Option<Bean> {
    let removed = self.beans.remove(name).map(|(_, bean)| bean);
    if removed.is_some() {
      self.publish(ScopeEvent::Refreshed {
        scope: self.id.clone(),
        bean: name.to_string(),
      });
    }
    removed
  }

  fn lookup(&self, name: &str) -> Option<Bean> {
    if let Some(bean) = self.beans.get(name) {
      return Some(Arc::clone(bean.value()));
    }
    self.parent.as_ref().and_then(|p| p.lookup(name))
  }
}

/// In-process host: scopes are bean maps chained to their parent.
pub struct LocalHost {
  root: Arc<LocalScope>,
  events: broadcast::Sender<ScopeEvent>,
  next_id: AtomicU64,
}

impl LocalHost {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(256);
    let root = Arc::new(LocalScope {
      id: "root".to_string(),
      namespace: Namespace::root(),
      tags: BTreeMap::new(),
      parent: None,
      beans: DashMap::new(),
      running: AtomicBool::new(true),
      events: events.clone(),
    });
    Self {
      root,
      events,
      next_id: AtomicU64::new(1),
    }
  }
}

impl Default for LocalHost {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl HostRuntime for LocalHost {
  fn root_scope(&self) -> Arc<dyn ExecutionScope> {
    self.root.clone()
  }

  async fn start_child_scope(
    &self,
    parent: &Arc<dyn ExecutionScope>,
    namespace: Arc<Namespace>,
    tags: BTreeMap<String, String>,
  ) -> Result<Arc<dyn ExecutionScope>, HostError> {
    let id = format!("{}#{}", namespace.name(), self.next_id.fetch_add(1, Ordering::SeqCst));
    let scope = Arc::new(LocalScope {
      id,
      namespace,
      tags,
      parent: Some(Arc::clone(parent)),
      beans: DashMap::new(),
      running: AtomicBool::new(false),
      events: self.events.clone(),
    });
    scope.start().await?;
    Ok(scope)
  }

  fn subscribe(&self) -> broadcast::Receiver<ScopeEvent> {
    self.events.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_lookup_falls_back_to_parent() {
    let host = LocalHost::new();
    let root = host.root_scope();
    root.register_bean("greeting", Arc::new("hello".to_string())).unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let ns = Namespace::child(&root.namespace(), "app=x", dir.path(), Vec::new());
    let child = host.start_child_scope(&root, ns, BTreeMap::new()).await.unwrap();
    child.register_bean("count", Arc::new(7u32)).unwrap();

    assert_eq!(*child.lookup_as::<String>("greeting").unwrap(), "hello");
    assert_eq!(*child.lookup_as::<u32>("count").unwrap(), 7);
    assert!(root.lookup("count").is_none());
    assert!(matches!(
      child.lookup_as::<u64>("count"),
      Err(HostError::BeanType { .. })
    ));
  }

  #[tokio::test]
  async fn test_missing_source_fails_start() {
    let host = LocalHost::new();
    let root = host.root_scope();
    let dir = tempfile::TempDir::new().unwrap();
    let ns = Namespace::child(&root.namespace(), "app=x", dir.path(), vec![dir.path().join("gone.jar")]);
    let result = host.start_child_scope(&root, ns, BTreeMap::new()).await;
    assert!(matches!(result, Err(HostError::Source { .. })));
  }

  #[tokio::test]
  async fn test_scope_events_are_published() {
    let host = LocalHost::new();
    let mut events = host.subscribe();
    let root = host.root_scope();
    let dir = tempfile::TempDir::new().unwrap();
    let ns = Namespace::child(&root.namespace(), "env=prod", dir.path(), Vec::new());
    let child = host.start_child_scope(&root, ns, BTreeMap::new()).await.unwrap();
    child.stop().await;
    child.stop().await;

    assert!(matches!(events.recv().await.unwrap(), ScopeEvent::Started { .. }));
    assert!(matches!(events.recv().await.unwrap(), ScopeEvent::Stopped { .. }));
    assert!(events.try_recv().is_err());
  }

  #[test]
  fn test_namespace_resolution_is_child_first() {
    let root = Namespace::root();
    let parent = Namespace::child(&root, "app=x", Path::new("/r/app-x"), vec![PathBuf::from("/r/app-x/lib/a.jar")]);
    let child = Namespace::child(
      &parent,
      "app=x,env=prod",
      Path::new("/r/app-x/env-prod"),
      vec![PathBuf::from("/r/app-x/env-prod/lib/a.jar")],
    );
    assert_eq!(child.resolve("a.jar"), Some(PathBuf::from("/r/app-x/env-prod/lib/a.jar")));
    assert_eq!(child.sources().len(), 2);
    assert_eq!(parent.resolve("b.jar"), None);
  }
}
