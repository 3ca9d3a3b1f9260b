//! File events flowing from the native watcher through the debouncer

use std::{
  fmt,
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The kind of change observed on a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
  Created,
  Modified,
  Deleted,
}

impl FileEventKind {
  fn bit(self) -> u8 {
    match self {
      Self::Created => 0b001,
      Self::Modified => 0b010,
      Self::Deleted => 0b100,
    }
  }
}

/// Set of event kinds a watch registration is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKinds(u8);

impl EventKinds {
  pub const ALL: Self = Self(0b111);
  pub const NONE: Self = Self(0);

  pub fn of(kinds: &[FileEventKind]) -> Self {
    Self(kinds.iter().fold(0, |acc, k| acc | k.bit()))
  }

  pub fn contains(self, kind: FileEventKind) -> bool {
    self.0 & kind.bit() != 0
  }
}

/// Processes settled events. Implemented by the root and branch listeners.
#[async_trait]
pub trait EventHandler: Send + Sync {
  /// Short name used in logs
  fn describe(&self) -> String;

  async fn handle(&self, event: FileEvent);
}

/// One pending filesystem change
///
/// Identity for queue conflation is the path alone; the kind is whatever the
/// most recent event for that path said.
#[derive(Clone)]
pub struct FileEvent {
  pub path: PathBuf,
  pub kind: FileEventKind,
  /// When the event was (last) enqueued
  pub enqueued_at: Instant,
  /// Settle delay assigned at enqueue time
  pub delay: Duration,
  /// Who processes the event once it settles
  pub handler: Arc<dyn EventHandler>,
}

impl FileEvent {
  pub fn new(path: PathBuf, kind: FileEventKind, handler: Arc<dyn EventHandler>) -> Self {
    Self {
      path,
      kind,
      enqueued_at: Instant::now(),
      delay: Duration::ZERO,
      handler,
    }
  }
}

impl fmt::Debug for FileEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FileEvent")
      .field("path", &self.path)
      .field("kind", &self.kind)
      .field("delay", &self.delay)
      .field("handler", &self.handler.describe())
      .finish()
  }
}
