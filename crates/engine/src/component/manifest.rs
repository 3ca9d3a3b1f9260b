//! `*.collector` manifests
//!
//! A declarative script format: a TOML file whose sections declare the
//! component's markers. Commands run through the platform shell in the branch
//! directory, with the branch namespace exported as `COLLECTORD_LIB_PATH`.
//!
//! ```toml
//! name = "orders-db"          # named
//! inject = ["database"]       # dependent
//! listen = true               # event listener
//!
//! [collect]                   # collector
//! command = "./check.sh"
//! timeout_ms = 30000
//! interruptible = true
//!
//! [schedule]                  # schedulable
//! period = 30
//! unit = "seconds"            # or: cron = "*/5 * * * *"
//!
//! [connect]                   # connector
//! command = "nc -z db 5432"
//!
//! [lifecycle]                 # lifecycle
//! start = "./setup.sh"
//! stop = "./teardown.sh"
//! ```
//!
//! Collect exit codes: 0 COMPLETE, 1 PARTIAL, 2 NOCONN, anything else FAILED.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  process::Stdio,
  sync::{Arc, Mutex, PoisonError},
  time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, sync::Notify};
use tracing::{debug, info, trace};

use super::{
  capability::{
    Collector, CompiledObject, ComponentEvent, Connector, Dependent, EventListener, Lifecycle, Named, Schedulable,
    ScriptError, ScriptInstance,
  },
  compiler::ScriptCompiler,
};
use crate::{
  domain::{
    schedule::{ScheduleSpec, TimeUnit},
    state::CollectResult,
  },
  host::{Bean, Namespace},
};

pub const EXTENSION: &str = "collector";

fn default_timeout_ms() -> u64 {
  30_000
}

// ============================================================================
// Manifest format
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
  name: Option<String>,
  #[serde(default)]
  listen: bool,
  #[serde(default)]
  inject: Vec<String>,
  collect: Option<CommandSection>,
  schedule: Option<ScheduleSection>,
  connect: Option<CommandSection>,
  lifecycle: Option<LifecycleSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandSection {
  command: String,
  #[serde(default = "default_timeout_ms")]
  timeout_ms: u64,
  #[serde(default)]
  interruptible: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleSection {
  period: Option<u64>,
  initial_delay: Option<u64>,
  unit: Option<String>,
  cron: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LifecycleSection {
  start: Option<String>,
  stop: Option<String>,
  #[serde(default = "default_timeout_ms")]
  timeout_ms: u64,
}

// ============================================================================
// Compiler
// ============================================================================

/// Compiles `*.collector` manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestCompiler;

#[async_trait]
impl ScriptCompiler for ManifestCompiler {
  fn accepts(&self, path: &Path) -> bool {
    path.extension().is_some_and(|e| e == EXTENSION)
  }

  async fn compile(
    &self,
    source: &str,
    synthetic_name: &str,
    namespace: &Namespace,
  ) -> Result<Arc<dyn CompiledObject>, ScriptError> {
    let manifest: Manifest = toml::from_str(source).map_err(|e| ScriptError::Syntax(e.to_string()))?;

    let schedule = manifest
      .schedule
      .as_ref()
      .map(|s| {
        let unit = s
          .unit
          .as_deref()
          .map(str::parse::<TimeUnit>)
          .transpose()
          .map_err(|e| ScriptError::Syntax(e.to_string()))?;
        ScheduleSpec::from_parts(s.period, s.initial_delay, unit, s.cron.as_deref())
          .map_err(|e| ScriptError::Syntax(format!("[schedule]: {e}")))
      })
      .transpose()?;

    if schedule.is_some() && manifest.collect.is_none() {
      return Err(ScriptError::Syntax("[schedule] requires a [collect] section".to_string()));
    }

    let lib_path = std::env::join_paths(namespace.sources())
      .map(|p| p.to_string_lossy().into_owned())
      .unwrap_or_default();

    Ok(Arc::new(ManifestObject {
      name: manifest
        .name
        .clone()
        .unwrap_or_else(|| synthetic_name.to_string()),
      workdir: namespace.home().map(Path::to_path_buf),
      lib_path,
      schedule,
      manifest,
      injected: Mutex::new(BTreeMap::new()),
      interrupted: Notify::new(),
      events_seen: Mutex::new(0),
    }))
  }
}

// ============================================================================
// Compiled manifest
// ============================================================================

pub struct ManifestObject {
  name: String,
  workdir: Option<PathBuf>,
  lib_path: String,
  schedule: Option<ScheduleSpec>,
  manifest: Manifest,
  injected: Mutex<BTreeMap<String, String>>,
  interrupted: Notify,
  events_seen: Mutex<u64>,
}

enum Outcome {
  Exited(i32),
  TimedOut,
  Interrupted,
}

impl ManifestObject {
  fn command(&self, line: &str) -> Command {
    #[cfg(windows)]
    let mut command = {
      let mut c = Command::new("cmd");
      c.arg("/C").arg(line);
      c
    };
    #[cfg(not(windows))]
    let mut command = {
      let mut c = Command::new("sh");
      c.arg("-c").arg(line);
      c
    };

    if let Some(dir) = &self.workdir {
      command.current_dir(dir);
    }
    command
      .env("COLLECTORD_COMPONENT", &self.name)
      .env("COLLECTORD_LIB_PATH", &self.lib_path)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    for (dependency, value) in self.injected.lock().unwrap_or_else(PoisonError::into_inner).iter() {
      let key = format!(
        "COLLECTORD_DEP_{}",
        dependency
          .chars()
          .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
          .collect::<String>()
      );
      command.env(key, value);
    }
    command
  }

  async fn run(&self, line: &str, timeout: Duration, interruptible: bool) -> Result<Outcome, ScriptError> {
    let child = self
      .command(line)
      .spawn()
      .map_err(|e| ScriptError::Runtime(format!("failed to spawn '{line}': {e}")))?;

    // Dropping the output future kills the child
    let output = tokio::time::timeout(timeout, child.wait_with_output());
    tokio::select! {
      result = output => match result {
        Ok(Ok(output)) => {
          let code = output.status.code().unwrap_or(-1);
          trace!(
            component = %self.name,
            code,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Command finished"
          );
          Ok(Outcome::Exited(code))
        }
        Ok(Err(e)) => Err(ScriptError::Runtime(format!("'{line}' failed: {e}"))),
        Err(_) => Ok(Outcome::TimedOut),
      },
      _ = self.interrupted.notified(), if interruptible => Ok(Outcome::Interrupted),
    }
  }

  async fn run_hook(&self, line: Option<&str>, timeout_ms: u64) -> Result<(), ScriptError> {
    let Some(line) = line else {
      return Ok(());
    };
    let timeout = Duration::from_millis(timeout_ms);
    match self.run(line, timeout, false).await? {
      Outcome::Exited(0) => Ok(()),
      Outcome::Exited(code) => Err(ScriptError::Runtime(format!("'{line}' exited with {code}"))),
      Outcome::TimedOut => Err(ScriptError::Timeout(timeout)),
      Outcome::Interrupted => Err(ScriptError::Interrupted),
    }
  }

  /// Number of component events delivered to this listener
  pub fn events_seen(&self) -> u64 {
    *self.events_seen.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl CompiledObject for ManifestObject {
  fn markers(&self) -> Vec<String> {
    let m = &self.manifest;
    [
      (m.name.is_some(), "named"),
      (m.listen, "listener"),
      (!m.inject.is_empty(), "inject"),
      (m.collect.is_some(), "collector"),
      (m.schedule.is_some(), "schedule"),
      (m.connect.is_some(), "connector"),
      (m.lifecycle.is_some(), "lifecycle"),
    ]
    .into_iter()
    .filter(|(declared, _)| *declared)
    .map(|(_, marker)| marker.to_string())
    .collect()
  }

  fn as_lifecycle(self: Arc<Self>) -> Option<Arc<dyn Lifecycle>> {
    Some(self)
  }

  fn as_collector(self: Arc<Self>) -> Option<Arc<dyn Collector>> {
    Some(self)
  }

  fn as_schedulable(self: Arc<Self>) -> Option<Arc<dyn Schedulable>> {
    let spec = self.schedule.clone()?;
    Some(Arc::new(ManifestSchedule(spec)))
  }

  fn as_event_listener(self: Arc<Self>) -> Option<Arc<dyn EventListener>> {
    Some(self)
  }

  fn as_dependent(self: Arc<Self>) -> Option<Arc<dyn Dependent>> {
    Some(self)
  }

  fn as_connector(self: Arc<Self>) -> Option<Arc<dyn Connector>> {
    Some(self)
  }

  fn as_named(self: Arc<Self>) -> Option<Arc<dyn Named>> {
    Some(self)
  }
}

#[async_trait]
impl Lifecycle for ManifestObject {
  async fn start(&self) -> Result<(), ScriptError> {
    let Some(section) = &self.manifest.lifecycle else {
      return Ok(());
    };
    self.run_hook(section.start.as_deref(), section.timeout_ms).await
  }

  async fn stop(&self) -> Result<(), ScriptError> {
    let Some(section) = &self.manifest.lifecycle else {
      return Ok(());
    };
    self.run_hook(section.stop.as_deref(), section.timeout_ms).await
  }
}

#[async_trait]
impl Collector for ManifestObject {
  async fn collect(&self) -> CollectResult {
    let Some(section) = &self.manifest.collect else {
      return CollectResult::Failed;
    };
    let timeout = Duration::from_millis(section.timeout_ms);
    match self.run(&section.command, timeout, section.interruptible).await {
      Ok(Outcome::Exited(0)) => CollectResult::Complete,
      Ok(Outcome::Exited(1)) => CollectResult::Partial,
      Ok(Outcome::Exited(2)) => CollectResult::NoConn,
      Ok(Outcome::Exited(_)) | Ok(Outcome::TimedOut) | Ok(Outcome::Interrupted) => CollectResult::Failed,
      Err(e) => {
        debug!(component = %self.name, error = %e, "Collect command failed");
        CollectResult::Failed
      }
    }
  }

  fn interruptible(&self) -> bool {
    self.manifest.collect.as_ref().is_some_and(|c| c.interruptible)
  }

  fn interrupt(&self) {
    self.interrupted.notify_waiters();
  }
}

/// The parsed `[schedule]` section
struct ManifestSchedule(ScheduleSpec);

impl Schedulable for ManifestSchedule {
  fn schedule(&self) -> ScheduleSpec {
    self.0.clone()
  }
}

#[async_trait]
impl EventListener for ManifestObject {
  async fn on_event(&self, event: &ComponentEvent) {
    *self.events_seen.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    info!(
      listener = %self.name,
      component = %event.component,
      branch = %event.branch,
      kind = ?event.kind,
      "Component event"
    );
  }
}

impl Dependent for ManifestObject {
  fn dependencies(&self) -> Vec<String> {
    self.manifest.inject.clone()
  }

  fn inject(&self, name: &str, bean: Bean) -> Result<(), ScriptError> {
    let value = match bean.downcast_ref::<ScriptInstance>() {
      Some(instance) => instance.named().map(|n| n.name()).unwrap_or_else(|| name.to_string()),
      None => match bean.downcast_ref::<String>() {
        Some(text) => text.clone(),
        None => name.to_string(),
      },
    };
    self
      .injected
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(name.to_string(), value);
    Ok(())
  }
}

#[async_trait]
impl Connector for ManifestObject {
  async fn connect(&self) -> Result<(), ScriptError> {
    let Some(section) = &self.manifest.connect else {
      return Ok(());
    };
    self.run_hook(Some(&section.command), section.timeout_ms).await
  }
}

impl Named for ManifestObject {
  fn name(&self) -> String {
    self.name.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    component::{
      capability::Capability,
      compiler::{CompileError, ComponentCompiler},
    },
    domain::config::DeployConfig,
  };

  fn compiler() -> ComponentCompiler {
    ComponentCompiler::new(Arc::new(ManifestCompiler), &DeployConfig::default())
  }

  #[tokio::test]
  async fn test_sections_map_to_capabilities() {
    let source = r#"
name = "orders"
inject = ["database"]

[collect]
command = "exit 0"

[schedule]
period = 5
unit = "ms"
"#;
    let compiled = compiler().compile_source(source, None, &Namespace::root()).await.unwrap();
    let caps = compiled.instance.capabilities();
    assert_eq!(compiled.name, "orders");
    for cap in [Capability::Named, Capability::Dependent, Capability::Collector, Capability::Schedulable] {
      assert!(caps.contains(cap), "missing {cap}");
    }
    assert!(!caps.contains(Capability::Lifecycle));
    assert!(!caps.contains(Capability::EventListener));
    assert_eq!(
      compiled.instance.schedulable().unwrap().schedule(),
      ScheduleSpec::fixed(5, 0, TimeUnit::Milliseconds).unwrap()
    );
  }

  #[tokio::test]
  async fn test_invalid_manifests_fail_to_compile() {
    let compiler = compiler();
    let ns = Namespace::root();
    for source in [
      "this is not toml",
      "unknown_key = 1",
      "[schedule]\nperiod = 5\n",
      "[collect]\ncommand = \"true\"\n[schedule]\nperiod = 5\ncron = \"* * * * *\"\n",
    ] {
      let result = compiler.compile_source(source, None, &ns).await;
      assert!(matches!(result, Err(CompileError::Script { .. })), "{source}");
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_exit_codes_map_to_results() {
    let compiler = compiler();
    let ns = Namespace::root();
    for (code, expected) in [
      (0, CollectResult::Complete),
      (1, CollectResult::Partial),
      (2, CollectResult::NoConn),
      (7, CollectResult::Failed),
    ] {
      let source = format!("[collect]\ncommand = \"exit {code}\"\n");
      let compiled = compiler.compile_source(&source, None, &ns).await.unwrap();
      assert_eq!(compiled.instance.collector().unwrap().collect().await, expected);
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_timeout_and_interrupt() {
    let compiler = compiler();
    let ns = Namespace::root();

    let slow = "[collect]\ncommand = \"sleep 5\"\ntimeout_ms = 50\n";
    let compiled = compiler.compile_source(slow, None, &ns).await.unwrap();
    assert_eq!(compiled.instance.collector().unwrap().collect().await, CollectResult::Failed);

    let interruptible = "[collect]\ncommand = \"sleep 5\"\ninterruptible = true\n";
    let compiled = compiler.compile_source(interruptible, None, &ns).await.unwrap();
    let collector = compiled.instance.collector().unwrap().clone();
    assert!(collector.interruptible());
    let running = {
      let collector = collector.clone();
      tokio::spawn(async move { collector.collect().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    collector.interrupt();
    let result = tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    assert_eq!(result, CollectResult::Failed);
  }
}
