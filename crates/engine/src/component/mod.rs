//! Components: compiled script units, their capabilities and lifecycle

pub mod capability;
pub mod compiler;
pub mod lifecycle;
pub mod manifest;

pub use capability::{
  Capability, CapabilitySet, Collector, CompiledObject, ComponentEvent, ComponentEventKind, Connector, Dependent,
  EventListener, Lifecycle, Named, Schedulable, ScriptError, ScriptInstance,
};
pub use compiler::{CompileError, CompiledComponent, ComponentCompiler, ScriptCompiler};
pub use lifecycle::{Component, LifecycleError};
pub use manifest::ManifestCompiler;
