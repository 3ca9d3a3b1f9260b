//! Lifecycle states shared by branches and components

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single component.
///
/// ```text
/// INIT ──start──> STARTED ──pause──> PAUSED
///  │                │  ▲                │
///  │ setup/compile  │  └──collect──> COLLECTING
///  │ failure        │
///  ▼                ├──threshold of failed collections──> ISOLATED
/// BROKEN / BUST     └──blackout──> BLACKOUT (until the window ends)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorState {
  Init,
  Started,
  Paused,
  Stopped,
  Collecting,
  /// Setup failed (unresolvable dependency, bootstrap failure)
  Broken,
  /// Compilation or compile-triggered start failed
  Bust,
  /// Too many consecutive failed collections; unscheduled until reset
  Isolated,
  /// Time-windowed suppression
  Blackout,
}

impl CollectorState {
  /// States in which the component holds live resources and must be stopped.
  pub fn is_running(self) -> bool {
    matches!(
      self,
      Self::Started | Self::Paused | Self::Collecting | Self::Isolated | Self::Blackout
    )
  }

  /// States from which `start()` is legal.
  pub fn can_start(self) -> bool {
    matches!(self, Self::Init | Self::Stopped)
  }

  /// States in which `collect()` is legal.
  pub fn can_collect(self) -> bool {
    matches!(self, Self::Started | Self::Collecting)
  }
}

impl fmt::Display for CollectorState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Init => "INIT",
      Self::Started => "STARTED",
      Self::Paused => "PAUSED",
      Self::Stopped => "STOPPED",
      Self::Collecting => "COLLECTING",
      Self::Broken => "BROKEN",
      Self::Bust => "BUST",
      Self::Isolated => "ISOLATED",
      Self::Blackout => "BLACKOUT",
    };
    f.write_str(s)
  }
}

/// Outcome of one `collect()` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectResult {
  Complete,
  /// Could not reach the monitored resource
  #[serde(rename = "NOCONN")]
  NoConn,
  Failed,
  /// Some but not all data was collected
  Partial,
}

impl CollectResult {
  /// Results that count toward the isolation threshold.
  pub fn is_failure(self) -> bool {
    matches!(self, Self::NoConn | Self::Failed)
  }
}

impl fmt::Display for CollectResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Complete => "COMPLETE",
      Self::NoConn => "NOCONN",
      Self::Failed => "FAILED",
      Self::Partial => "PARTIAL",
    };
    f.write_str(s)
  }
}

/// Deployment status of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchStatus {
  /// Registered, scope not yet built
  Bootstrapping,
  Ready,
  /// Bootstrap failed; nothing is deployed until the directory changes again
  Broken { reason: String },
  /// Directory removed; the branch is being or has been torn down
  Destroyed,
}

impl BranchStatus {
  pub fn is_ready(&self) -> bool {
    matches!(self, Self::Ready)
  }

  pub fn is_broken(&self) -> bool {
    matches!(self, Self::Broken { .. })
  }
}
