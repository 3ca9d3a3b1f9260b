//! collectord - hot-deploying monitoring collectors from a directory tree
//!
//! Directories named `key-value` under a deployment root become addressable
//! branches; source files inside them are compiled into components, started,
//! scheduled and replaced as the files change.

pub mod component;
pub mod deploy;
pub mod host;
pub mod management;
pub mod pool;
pub mod scheduler;
pub mod watch;

mod domain;
pub use domain::{address, config, schedule, state};

pub mod dirs;

mod engine;
pub use engine::{Engine, EngineBuilder, EngineError, EngineStatus, RootSummary};

mod daemon;
pub use daemon::{Daemon, DaemonError, RuntimeConfig};

#[cfg(test)]
mod __tests__;
