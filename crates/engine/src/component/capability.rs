//! Capability model
//!
//! A compiled object declares markers; the compiler turns them into a
//! `CapabilitySet` and wraps the object in a `ScriptInstance` that exposes one
//! typed interface per detected capability. The engine only ever dispatches
//! through those interfaces.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
  domain::{schedule::ScheduleSpec, state::CollectResult},
  host::Bean,
};

// ============================================================================
// Capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
  Collector,
  Schedulable,
  EventListener,
  Dependent,
  Connector,
  Named,
  Lifecycle,
}

impl Capability {
  pub const ALL: [Capability; 7] = [
    Self::Collector,
    Self::Schedulable,
    Self::EventListener,
    Self::Dependent,
    Self::Connector,
    Self::Named,
    Self::Lifecycle,
  ];

  fn bit(self) -> u8 {
    1 << (self as u8)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Collector => "collector",
      Self::Schedulable => "schedulable",
      Self::EventListener => "event-listener",
      Self::Dependent => "dependent",
      Self::Connector => "connector",
      Self::Named => "named",
      Self::Lifecycle => "lifecycle",
    }
  }
}

impl fmt::Display for Capability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Explicit set of capability tags carried by a compiled component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
  pub fn insert(&mut self, capability: Capability) {
    self.0 |= capability.bit();
  }

  pub fn contains(self, capability: Capability) -> bool {
    self.0 & capability.bit() != 0
  }

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub fn iter(self) -> impl Iterator<Item = Capability> {
    Capability::ALL.into_iter().filter(move |c| self.contains(*c))
  }

  pub fn names(self) -> Vec<&'static str> {
    self.iter().map(Capability::as_str).collect()
  }
}

impl FromIterator<Capability> for CapabilitySet {
  fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
    let mut set = Self::default();
    for capability in iter {
      set.insert(capability);
    }
    set
  }
}

impl fmt::Display for CapabilitySet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.names().join(","))
  }
}

// ============================================================================
// Script errors and events
// ============================================================================

/// Failures raised by user script code or the script compiler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
  #[error("syntax error: {0}")]
  Syntax(String),

  #[error("{0}")]
  Runtime(String),

  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("interrupted")]
  Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentEventKind {
  Deployed,
  Replaced,
  Undeployed,
  Bust,
}

/// Delivered to event-listener components of a branch when a sibling changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentEvent {
  pub branch: String,
  pub component: String,
  pub source: PathBuf,
  pub kind: ComponentEventKind,
}

// ============================================================================
// Capability interfaces
// ============================================================================

/// Start/stop hooks. Every hook defaults to doing nothing.
#[async_trait]
pub trait Lifecycle: Send + Sync {
  async fn pre_start(&self) -> Result<(), ScriptError> {
    Ok(())
  }

  async fn start(&self) -> Result<(), ScriptError> {
    Ok(())
  }

  async fn post_start(&self) -> Result<(), ScriptError> {
    Ok(())
  }

  async fn pre_stop(&self) -> Result<(), ScriptError> {
    Ok(())
  }

  async fn stop(&self) -> Result<(), ScriptError> {
    Ok(())
  }

  async fn post_stop(&self) -> Result<(), ScriptError> {
    Ok(())
  }
}

#[async_trait]
pub trait Collector: Send + Sync {
  async fn collect(&self) -> CollectResult;

  /// Whether an in-flight collection may be interrupted cooperatively
  fn interruptible(&self) -> bool {
    false
  }

  /// Ask an in-flight collection to wind down.
  fn interrupt(&self) {}
}

pub trait Schedulable: Send + Sync {
  fn schedule(&self) -> ScheduleSpec;
}

#[async_trait]
pub trait EventListener: Send + Sync {
  async fn on_event(&self, event: &ComponentEvent);
}

pub trait Dependent: Send + Sync {
  /// Bean names that must resolve before the component starts
  fn dependencies(&self) -> Vec<String>;

  fn inject(&self, name: &str, bean: Bean) -> Result<(), ScriptError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
  /// Establish (or verify) the connection to the monitored resource.
  async fn connect(&self) -> Result<(), ScriptError>;

  async fn disconnect(&self) {}
}

pub trait Named: Send + Sync {
  fn name(&self) -> String;
}

// ============================================================================
// Compiled objects
// ============================================================================

/// What a script compiler hands back.
///
/// Markers are the declared annotations; the `as_*` accessors expose the
/// interfaces the object implements. Only interfaces whose marker was declared
/// are attached to the component.
pub trait CompiledObject: Send + Sync {
  fn markers(&self) -> Vec<String>;

  fn as_lifecycle(self: Arc<Self>) -> Option<Arc<dyn Lifecycle>> {
    None
  }

  fn as_collector(self: Arc<Self>) -> Option<Arc<dyn Collector>> {
    None
  }

  fn as_schedulable(self: Arc<Self>) -> Option<Arc<dyn Schedulable>> {
    None
  }

  fn as_event_listener(self: Arc<Self>) -> Option<Arc<dyn EventListener>> {
    None
  }

  fn as_dependent(self: Arc<Self>) -> Option<Arc<dyn Dependent>> {
    None
  }

  fn as_connector(self: Arc<Self>) -> Option<Arc<dyn Connector>> {
    None
  }

  fn as_named(self: Arc<Self>) -> Option<Arc<dyn Named>> {
    None
  }
}

/// Typed adapter around a compiled object, one slot per attached capability
#[derive(Clone, Default)]
pub struct ScriptInstance {
  pub(crate) capabilities: CapabilitySet,
  pub(crate) lifecycle: Option<Arc<dyn Lifecycle>>,
  pub(crate) collector: Option<Arc<dyn Collector>>,
  pub(crate) schedulable: Option<Arc<dyn Schedulable>>,
  pub(crate) event_listener: Option<Arc<dyn EventListener>>,
  pub(crate) dependent: Option<Arc<dyn Dependent>>,
  pub(crate) connector: Option<Arc<dyn Connector>>,
  pub(crate) named: Option<Arc<dyn Named>>,
}

impl ScriptInstance {
  pub fn capabilities(&self) -> CapabilitySet {
    self.capabilities
  }

  pub fn has(&self, capability: Capability) -> bool {
    self.capabilities.contains(capability)
  }

  pub fn lifecycle(&self) -> Option<&Arc<dyn Lifecycle>> {
    self.lifecycle.as_ref()
  }

  pub fn collector(&self) -> Option<&Arc<dyn Collector>> {
    self.collector.as_ref()
  }

  pub fn schedulable(&self) -> Option<&Arc<dyn Schedulable>> {
    self.schedulable.as_ref()
  }

  pub fn event_listener(&self) -> Option<&Arc<dyn EventListener>> {
    self.event_listener.as_ref()
  }

  pub fn dependent(&self) -> Option<&Arc<dyn Dependent>> {
    self.dependent.as_ref()
  }

  pub fn connector(&self) -> Option<&Arc<dyn Connector>> {
    self.connector.as_ref()
  }

  pub fn named(&self) -> Option<&Arc<dyn Named>> {
    self.named.as_ref()
  }
}

impl fmt::Debug for ScriptInstance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ScriptInstance")
      .field("capabilities", &self.capabilities.to_string())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_capability_set() {
    let set: CapabilitySet = [Capability::Collector, Capability::Schedulable, Capability::Collector]
      .into_iter()
      .collect();
    assert!(set.contains(Capability::Collector));
    assert!(!set.contains(Capability::Lifecycle));
    assert_eq!(set.iter().count(), 2);
    assert_eq!(set.to_string(), "collector,schedulable");
    assert!(CapabilitySet::default().is_empty());
  }
}
