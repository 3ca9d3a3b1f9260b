//! Event debouncer
//!
//! A single consumer task owns a `DelayQueue` of pending `FileEvent`s keyed by
//! path. Producers (native watch callbacks, admin calls) push commands through
//! an unbounded channel, so enqueueing never blocks.
//!
//! # Guarantees
//!
//! - At most one event per path is queued: enqueueing removes whatever was
//!   queued for that path before inserting the new event
//! - At most one event per path is being processed: if a path is still in
//!   flight when its next event settles, that event goes back into the queue
//!   with the busy backoff instead of running concurrently

use std::{
  collections::HashMap,
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

use dashmap::DashSet;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::{
  sync::CancellationToken,
  time::{DelayQueue, delay_queue},
};
use tracing::{debug, info, trace};

use super::event::{FileEvent, FileEventKind};
use crate::{domain::config::WatcherConfig, pool::WorkerPool};

// ============================================================================
// Messages
// ============================================================================

enum DebounceCommand {
  Enqueue { event: FileEvent, delay: Option<Duration> },
  Snapshot(oneshot::Sender<Vec<PendingEvent>>),
}

impl std::fmt::Debug for DebounceCommand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Enqueue { event, delay } => f
        .debug_struct("Enqueue")
        .field("event", event)
        .field("delay", delay)
        .finish(),
      Self::Snapshot(_) => f.write_str("Snapshot"),
    }
  }
}

/// A queued event as seen from outside the debouncer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEvent {
  pub path: PathBuf,
  pub kind: FileEventKind,
  pub delay_ms: u64,
}

/// Error when sending to the debouncer
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
  #[error("Debouncer has shut down")]
  ActorGone,
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to the debouncer task. Cheap to clone.
#[derive(Clone, Debug)]
pub struct DebouncerHandle {
  tx: mpsc::UnboundedSender<DebounceCommand>,
}

impl DebouncerHandle {
  /// Queue an event with the settle delay for its kind.
  pub fn enqueue(&self, event: FileEvent) -> Result<(), SendError> {
    self.send(DebounceCommand::Enqueue { event, delay: None })
  }

  /// Queue an event with an explicit settle delay.
  pub fn enqueue_with_delay(&self, event: FileEvent, delay: Duration) -> Result<(), SendError> {
    self.send(DebounceCommand::Enqueue {
      event,
      delay: Some(delay),
    })
  }

  /// Events currently waiting to settle.
  pub async fn pending(&self) -> Result<Vec<PendingEvent>, SendError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self.send(DebounceCommand::Snapshot(reply_tx))?;
    reply_rx.await.map_err(|_| SendError::ActorGone)
  }

  fn send(&self, command: DebounceCommand) -> Result<(), SendError> {
    self.tx.send(command).map_err(|_| SendError::ActorGone)
  }
}

// ============================================================================
// Debouncer
// ============================================================================

/// Bookkeeping for the one queued event of a path
struct Queued {
  key: delay_queue::Key,
  kind: FileEventKind,
  delay: Duration,
}

/// Clears the in-flight mark for a path when its processing ends, however it ends.
struct InFlightGuard {
  in_flight: Arc<DashSet<PathBuf>>,
  path: PathBuf,
}

impl Drop for InFlightGuard {
  fn drop(&mut self) {
    self.in_flight.remove(&self.path);
  }
}

pub struct Debouncer {
  config: WatcherConfig,
  pool: WorkerPool,
  in_flight: Arc<DashSet<PathBuf>>,
  cancel: CancellationToken,
}

impl Debouncer {
  /// Spawn the consumer task and return its handle.
  ///
  /// Settled events run on `pool`.
  pub fn spawn(config: WatcherConfig, pool: WorkerPool, cancel: CancellationToken) -> DebouncerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let debouncer = Self {
      config,
      pool,
      in_flight: Arc::new(DashSet::new()),
      cancel,
    };
    tokio::spawn(debouncer.run(rx));
    DebouncerHandle { tx }
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<DebounceCommand>) {
    let mut queue: DelayQueue<FileEvent> = DelayQueue::new();
    let mut keys: HashMap<PathBuf, Queued> = HashMap::new();

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!(pending = keys.len(), "Debouncer shutting down (cancelled)");
          break;
        }

        command = rx.recv() => {
          match command {
            Some(DebounceCommand::Enqueue { event, delay }) => {
              let delay = delay.unwrap_or_else(|| self.config.settle_delay(event.kind));
              Self::insert(&mut queue, &mut keys, event, delay);
            }
            Some(DebounceCommand::Snapshot(reply)) => {
              let _ = reply.send(Self::snapshot(&keys));
            }
            None => {
              info!("Debouncer shutting down (all handles dropped)");
              break;
            }
          }
        }

        Some(expired) = queue.next(), if !queue.is_empty() => {
          let key = expired.key();
          let event = expired.into_inner();
          if keys.get(&event.path).is_some_and(|q| q.key == key) {
            keys.remove(&event.path);
          }
          self.dispatch(&mut queue, &mut keys, event);
        }
      }
    }
  }

  /// Replace whatever is queued for the event's path with `event`.
  fn insert(
    queue: &mut DelayQueue<FileEvent>,
    keys: &mut HashMap<PathBuf, Queued>,
    mut event: FileEvent,
    delay: Duration,
  ) {
    if let Some(old) = keys.remove(&event.path) {
      let superseded = queue.remove(&old.key).into_inner();
      trace!(
        path = %event.path.display(),
        old = ?superseded.kind,
        new = ?event.kind,
        "Superseded queued event"
      );
    }

    event.enqueued_at = Instant::now();
    event.delay = delay;
    let path = event.path.clone();
    let kind = event.kind;
    let key = queue.insert(event, delay);
    keys.insert(path, Queued { key, kind, delay });
  }

  fn dispatch(&self, queue: &mut DelayQueue<FileEvent>, keys: &mut HashMap<PathBuf, Queued>, event: FileEvent) {
    if self.in_flight.contains(&event.path) {
      if keys.contains_key(&event.path) {
        // A newer event for the path is already waiting; it wins
        trace!(path = %event.path.display(), "Dropping busy event, newer one queued");
      } else {
        debug!(path = %event.path.display(), kind = ?event.kind, "Path busy, re-queueing with backoff");
        Self::insert(queue, keys, event, self.config.busy_backoff());
      }
      return;
    }

    self.in_flight.insert(event.path.clone());
    let guard = InFlightGuard {
      in_flight: Arc::clone(&self.in_flight),
      path: event.path.clone(),
    };

    trace!(
      path = %event.path.display(),
      kind = ?event.kind,
      waited_ms = event.enqueued_at.elapsed().as_millis() as u64,
      handler = %event.handler.describe(),
      "Dispatching settled event"
    );

    let handler = Arc::clone(&event.handler);
    self.pool.spawn(async move {
      let _guard = guard;
      handler.handle(event).await;
    });
  }

  fn snapshot(keys: &HashMap<PathBuf, Queued>) -> Vec<PendingEvent> {
    let mut pending: Vec<PendingEvent> = keys
      .iter()
      .map(|(path, queued)| PendingEvent {
        path: path.clone(),
        kind: queued.kind,
        delay_ms: queued.delay.as_millis() as u64,
      })
      .collect();
    pending.sort_by(|a, b| a.path.cmp(&b.path));
    pending
  }
}
