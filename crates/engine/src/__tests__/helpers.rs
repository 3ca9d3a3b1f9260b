//! Test helpers for engine end-to-end tests.
//!
//! Provides `EngineTestContext`, which owns a temporary deployment root and a
//! running `Engine` wired to `ProbeCompiler`: a scripted compiler for
//! `*.probe` files (TOML) that records every compile, start, stop, collect and
//! delivered event so tests can assert on exact counts.

use std::{
  collections::BTreeMap,
  future::Future,
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use filetime::FileTime;
use serde::Deserialize;
use tempfile::TempDir;

use crate::{
  Engine,
  component::{
    Collector, CompiledObject, ComponentEvent, Dependent, EventListener, Lifecycle, Named, Schedulable, ScriptCompiler,
    ScriptError,
  },
  config::{Config, RootConfig},
  host::{Bean, Namespace},
  management::ManagementRegistry,
  schedule::{ScheduleSpec, TimeUnit},
  state::{CollectResult, CollectorState},
};

// ============================================================================
// ProbeCompiler
// ============================================================================

/// Everything the probe compiler and its objects observed
#[derive(Default)]
pub struct ProbeStats {
  /// Compiles started
  pub compiles: AtomicUsize,
  /// Compiles that ran to completion
  pub compiled: AtomicUsize,
  pub interrupts: AtomicUsize,
  pub starts: DashMap<String, usize>,
  pub stops: DashMap<String, usize>,
  pub collects: DashMap<String, usize>,
  pub events: Mutex<Vec<(String, ComponentEvent)>>,
}

impl ProbeStats {
  pub fn compiles(&self) -> usize {
    self.compiles.load(Ordering::SeqCst)
  }

  pub fn compiled(&self) -> usize {
    self.compiled.load(Ordering::SeqCst)
  }

  pub fn interrupts(&self) -> usize {
    self.interrupts.load(Ordering::SeqCst)
  }

  pub fn starts(&self, name: &str) -> usize {
    self.starts.get(name).map(|v| *v).unwrap_or(0)
  }

  pub fn stops(&self, name: &str) -> usize {
    self.stops.get(name).map(|v| *v).unwrap_or(0)
  }

  pub fn collects(&self, name: &str) -> usize {
    self.collects.get(name).map(|v| *v).unwrap_or(0)
  }

  /// Events delivered to the listener called `listener`.
  pub fn events_for(&self, listener: &str) -> Vec<ComponentEvent> {
    self
      .events
      .lock()
      .unwrap()
      .iter()
      .filter(|(l, _)| l == listener)
      .map(|(_, e)| e.clone())
      .collect()
  }
}

/// A `*.probe` source
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProbeSpec {
  name: Option<String>,
  /// complete, partial, noconn, failed; makes the probe a collector
  result: Option<String>,
  /// Fixed-delay schedule in milliseconds
  period_ms: Option<u64>,
  #[serde(default)]
  fail_start: bool,
  #[serde(default)]
  needs: Vec<String>,
  #[serde(default)]
  listen: bool,
  /// Time the compiler spends on this source
  compile_ms: Option<u64>,
  /// Time each collection takes; interrupts are ignored
  collect_ms: Option<u64>,
  #[serde(default)]
  interruptible: bool,
  /// Ignored; lets tests change content without changing behavior
  #[allow(dead_code)]
  revision: Option<u64>,
}

pub struct ProbeCompiler {
  stats: Arc<ProbeStats>,
}

impl ProbeCompiler {
  pub fn new(stats: Arc<ProbeStats>) -> Self {
    Self { stats }
  }
}

#[async_trait]
impl ScriptCompiler for ProbeCompiler {
  fn accepts(&self, path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "probe")
  }

  async fn compile(
    &self,
    source: &str,
    synthetic_name: &str,
    _namespace: &Namespace,
  ) -> Result<Arc<dyn CompiledObject>, ScriptError> {
    self.stats.compiles.fetch_add(1, Ordering::SeqCst);
    let spec: ProbeSpec = toml::from_str(source).map_err(|e| ScriptError::Syntax(e.to_string()))?;
    let result = match spec.result.as_deref() {
      None => None,
      Some("complete") => Some(CollectResult::Complete),
      Some("partial") => Some(CollectResult::Partial),
      Some("noconn") => Some(CollectResult::NoConn),
      Some("failed") => Some(CollectResult::Failed),
      Some(other) => return Err(ScriptError::Syntax(format!("unknown result '{other}'"))),
    };
    if let Some(ms) = spec.compile_ms {
      tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    self.stats.compiled.fetch_add(1, Ordering::SeqCst);
    Ok(Arc::new(ProbeObject {
      name: spec.name.clone().unwrap_or_else(|| synthetic_name.to_string()),
      named: spec.name.is_some(),
      result,
      period_ms: spec.period_ms,
      fail_start: spec.fail_start,
      needs: spec.needs,
      listen: spec.listen,
      collect_ms: spec.collect_ms,
      interruptible: spec.interruptible,
      injected: Mutex::new(BTreeMap::new()),
      stats: Arc::clone(&self.stats),
    }))
  }
}

struct ProbeObject {
  name: String,
  named: bool,
  result: Option<CollectResult>,
  period_ms: Option<u64>,
  fail_start: bool,
  needs: Vec<String>,
  listen: bool,
  collect_ms: Option<u64>,
  interruptible: bool,
  injected: Mutex<BTreeMap<String, Bean>>,
  stats: Arc<ProbeStats>,
}

impl CompiledObject for ProbeObject {
  fn markers(&self) -> Vec<String> {
    let mut markers = vec!["lifecycle".to_string()];
    if self.named {
      markers.push("named".to_string());
    }
    if self.result.is_some() {
      markers.push("collector".to_string());
    }
    if self.period_ms.is_some() {
      markers.push("schedule".to_string());
    }
    if !self.needs.is_empty() {
      markers.push("inject".to_string());
    }
    if self.listen {
      markers.push("listener".to_string());
    }
    markers
  }

  fn as_lifecycle(self: Arc<Self>) -> Option<Arc<dyn Lifecycle>> {
    Some(self)
  }

  fn as_collector(self: Arc<Self>) -> Option<Arc<dyn Collector>> {
    Some(self)
  }

  fn as_schedulable(self: Arc<Self>) -> Option<Arc<dyn Schedulable>> {
    Some(self)
  }

  fn as_event_listener(self: Arc<Self>) -> Option<Arc<dyn EventListener>> {
    Some(self)
  }

  fn as_dependent(self: Arc<Self>) -> Option<Arc<dyn Dependent>> {
    Some(self)
  }

  fn as_named(self: Arc<Self>) -> Option<Arc<dyn Named>> {
    Some(self)
  }
}

#[async_trait]
impl Lifecycle for ProbeObject {
  async fn start(&self) -> Result<(), ScriptError> {
    if self.fail_start {
      return Err(ScriptError::Runtime("start refused".to_string()));
    }
    *self.stats.starts.entry(self.name.clone()).or_insert(0) += 1;
    Ok(())
  }

  async fn stop(&self) -> Result<(), ScriptError> {
    *self.stats.stops.entry(self.name.clone()).or_insert(0) += 1;
    Ok(())
  }
}

#[async_trait]
impl Collector for ProbeObject {
  async fn collect(&self) -> CollectResult {
    *self.stats.collects.entry(self.name.clone()).or_insert(0) += 1;
    if let Some(ms) = self.collect_ms {
      tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    self.result.unwrap_or(CollectResult::Complete)
  }

  fn interruptible(&self) -> bool {
    self.interruptible
  }

  fn interrupt(&self) {
    self.stats.interrupts.fetch_add(1, Ordering::SeqCst);
  }
}

impl Schedulable for ProbeObject {
  fn schedule(&self) -> ScheduleSpec {
    ScheduleSpec::FixedDelay {
      period: self.period_ms.unwrap_or(1000),
      initial_delay: 0,
      unit: TimeUnit::Milliseconds,
    }
  }
}

#[async_trait]
impl EventListener for ProbeObject {
  async fn on_event(&self, event: &ComponentEvent) {
    self
      .stats
      .events
      .lock()
      .unwrap()
      .push((self.name.clone(), event.clone()));
  }
}

impl Dependent for ProbeObject {
  fn dependencies(&self) -> Vec<String> {
    self.needs.clone()
  }

  fn inject(&self, name: &str, bean: Bean) -> Result<(), ScriptError> {
    self.injected.lock().unwrap().insert(name.to_string(), bean);
    Ok(())
  }
}

impl Named for ProbeObject {
  fn name(&self) -> String {
    self.name.clone()
  }
}

// ============================================================================
// EngineTestContext
// ============================================================================

/// Test context for engine end-to-end tests.
pub struct EngineTestContext {
  /// Holds the deployment root
  pub temp: TempDir,
  /// The deployment root (canonical)
  pub root: PathBuf,
  pub stats: Arc<ProbeStats>,
  pub management: Arc<ManagementRegistry>,
  pub engine: Engine,
}

impl EngineTestContext {
  /// Start an engine on an empty root.
  pub async fn new() -> Self {
    Self::with_root_name("deploy", |_| {}).await
  }

  /// Start an engine on a root called `root_name`, after `prepare` has laid
  /// out files under it.
  pub async fn with_root_name(root_name: &str, prepare: impl FnOnce(&Path)) -> Self {
    Self::start(root_name, prepare, |_| {}).await
  }

  /// Start an engine on an empty root with adjusted settings.
  pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
    Self::start("deploy", |_| {}, adjust).await
  }

  async fn start(root_name: &str, prepare: impl FnOnce(&Path), adjust: impl FnOnce(&mut Config)) -> Self {
    let temp = TempDir::new().expect("create temp dir");
    let root = temp.path().join(root_name);
    std::fs::create_dir_all(&root).expect("create root");
    let root = root.canonicalize().expect("canonicalize root");
    prepare(&root);

    let stats = Arc::new(ProbeStats::default());
    let management = Arc::new(ManagementRegistry::default());
    let mut config = test_config(&root);
    adjust(&mut config);
    let engine = Engine::builder(config)
      .script_compiler(Arc::new(ProbeCompiler::new(Arc::clone(&stats))))
      .sink(management.clone())
      .start()
      .await
      .expect("start engine");

    Self {
      temp,
      root,
      stats,
      management,
      engine,
    }
  }

  pub fn path(&self, rel: &str) -> PathBuf {
    self.root.join(rel)
  }

  pub async fn mkdir(&self, rel: &str) {
    tokio::fs::create_dir_all(self.path(rel)).await.expect("create dir");
  }

  pub async fn write(&self, rel: &str, content: &str) {
    let path = self.path(rel);
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.expect("create parent dirs");
    }
    tokio::fs::write(&path, content).await.expect("write file");
  }

  pub async fn remove(&self, rel: &str) {
    let path = self.path(rel);
    if path.is_dir() {
      tokio::fs::remove_dir_all(&path).await.expect("remove dir");
    } else {
      tokio::fs::remove_file(&path).await.expect("remove file");
    }
  }

  /// Update file mtime without changing content.
  pub fn touch(&self, rel: &str) {
    filetime::set_file_mtime(self.path(rel), FileTime::now()).expect("set mtime");
  }

  /// Wait until the component from `rel` reaches `state`.
  pub async fn wait_for_state(&self, rel: &str, state: CollectorState) -> bool {
    let path = self.path(rel);
    wait_for(Duration::from_secs(10), || {
      let path = path.clone();
      async move { self.engine.component(&path).await.is_some_and(|c| c.state() == state) }
    })
    .await
  }

  /// Wait until nothing is deployed from `rel`.
  pub async fn wait_for_gone(&self, rel: &str) -> bool {
    let path = self.path(rel);
    wait_for(Duration::from_secs(10), || {
      let path = path.clone();
      async move { self.engine.component(&path).await.is_none() }
    })
    .await
  }

  /// Wait until the branch for `rel` exists and is ready.
  pub async fn wait_for_branch(&self, rel: &str) -> bool {
    let dir = self.path(rel);
    wait_for(Duration::from_secs(10), || {
      let dir = dir.clone();
      async move {
        self
          .engine
          .branch_for_dir(&dir)
          .is_some_and(|b| b.status().is_ready())
      }
    })
    .await
  }

  /// Wait until the debouncer has nothing queued and the events pool is idle.
  pub async fn settle(&self) {
    wait_for(Duration::from_secs(10), || async {
      let status = self.engine.status().await;
      let idle = status
        .pools
        .iter()
        .filter(|p| p.name != "collections")
        .all(|p| p.active == 0 && p.queued == 0);
      status.pending_events == 0 && idle
    })
    .await;
  }
}

/// Deployment settings with short settle delays
pub fn test_config(root: &Path) -> Config {
  let mut config = Config::default();
  config.roots.push(RootConfig::new(root));
  config.watcher.poll_interval_ms = 100;
  config.watcher.create_delay_ms = 200;
  config.watcher.modify_delay_ms = 200;
  config.watcher.delete_delay_ms = 0;
  config.watcher.busy_backoff_ms = 200;
  config.lifecycle.isolation_threshold = 3;
  config.lifecycle.interrupt_grace_ms = 100;
  config
}

/// Poll `check` every 25ms until it holds or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if check().await {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
  }
}
