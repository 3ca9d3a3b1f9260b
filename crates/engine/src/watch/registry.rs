//! WatchRegistry - native filesystem watches shared per filesystem
//!
//! Every logical `watch()` call binds one listener to one directory and yields
//! an independently cancellable `WatchHandle`. Underneath, one notify watcher
//! is created per filesystem (device id on unix) and each directory is
//! watched natively once, reference counted across handles.
//!
//! # Design
//!
//! 1. notify's sync callback uses `blocking_send` to forward raw events to a channel
//! 2. The pump task maps raw events to created/modified/deleted and hands them
//!    to the registrations bound to the event's parent directory
//! 3. On every poll tick the pump checks that watched directories still exist;
//!    a directory removed out-of-band invalidates its registrations and the
//!    listener's `on_cancelled` runs exactly once
//!
//! Listeners are called on the pump task and must not block; the engine's
//! listeners only enqueue into the debouncer.

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};

use dashmap::DashMap;
use notify::{
  Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
  event::{ModifyKind, RenameMode},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::event::{EventKinds, FileEventKind};
use crate::domain::config::WatcherConfig;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur in the watch registry
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch {path}: {source}")]
  Watch {
    path: PathBuf,
    #[source]
    source: notify::Error,
  },

  #[error("Not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("Failed to stat {path}: {source}")]
  Stat {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

// ============================================================================
// Public Types
// ============================================================================

/// Receives changes for the children of one watched directory.
pub trait WatchListener: Send + Sync {
  /// A direct child of the watched directory changed
  fn on_event(&self, path: &Path, kind: FileEventKind);

  /// The watched directory itself is gone; the handle is already invalid
  fn on_cancelled(&self, dir: &Path);
}

/// Cancellable token for one `watch()` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHandle {
  id: u64,
  dir: PathBuf,
}

impl WatchHandle {
  pub fn dir(&self) -> &Path {
    &self.dir
  }
}

// ============================================================================
// Internal Types
// ============================================================================

struct Registration {
  id: u64,
  dir: PathBuf,
  listener: Arc<dyn WatchListener>,
  kinds: EventKinds,
  valid: AtomicBool,
}

/// One notify watcher plus the reference count of each directory it watches
struct NativeService {
  watcher: RecommendedWatcher,
  refs: HashMap<PathBuf, usize>,
}

type FsKey = u64;

// ============================================================================
// WatchRegistry
// ============================================================================

pub struct WatchRegistry {
  services: DashMap<FsKey, Arc<Mutex<NativeService>>>,
  registrations: DashMap<u64, Arc<Registration>>,
  by_dir: DashMap<PathBuf, Vec<u64>>,
  next_id: AtomicU64,
  event_tx: mpsc::Sender<notify::Result<Event>>,
}

impl WatchRegistry {
  /// Create the registry and spawn its pump task.
  pub fn spawn(config: &WatcherConfig, cancel: CancellationToken) -> Arc<Self> {
    // The sync callback uses blocking_send, so we need a reasonable buffer
    let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>(1024);

    let registry = Arc::new(Self {
      services: DashMap::new(),
      registrations: DashMap::new(),
      by_dir: DashMap::new(),
      next_id: AtomicU64::new(1),
      event_tx,
    });

    let pump = Arc::clone(&registry);
    let poll_interval = config.poll_interval();
    tokio::spawn(async move {
      pump.run(event_rx, poll_interval, cancel).await;
    });

    registry
  }

  /// Bind `listener` to changes of the direct children of `dir`.
  pub fn watch(
    &self,
    dir: &Path,
    listener: Arc<dyn WatchListener>,
    kinds: EventKinds,
  ) -> Result<WatchHandle, WatchError> {
    if !dir.is_dir() {
      return Err(WatchError::NotADirectory(dir.to_path_buf()));
    }

    let key = filesystem_key(dir).map_err(|source| WatchError::Stat {
      path: dir.to_path_buf(),
      source,
    })?;
    let service = self.service_for(key)?;

    {
      let mut service = service.lock().unwrap_or_else(PoisonError::into_inner);
      let count = service.refs.get(dir).copied().unwrap_or(0);
      if count == 0 {
        service
          .watcher
          .watch(dir, RecursiveMode::NonRecursive)
          .map_err(|source| WatchError::Watch {
            path: dir.to_path_buf(),
            source,
          })?;
        debug!(dir = %dir.display(), fs = key, "Native watch added");
      }
      service.refs.insert(dir.to_path_buf(), count + 1);
    }

    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let registration = Arc::new(Registration {
      id,
      dir: dir.to_path_buf(),
      listener,
      kinds,
      valid: AtomicBool::new(true),
    });
    self.registrations.insert(id, registration);
    self.by_dir.entry(dir.to_path_buf()).or_default().push(id);

    trace!(id, dir = %dir.display(), "Watch registered");
    Ok(WatchHandle {
      id,
      dir: dir.to_path_buf(),
    })
  }

  /// Cancel a watch. Cancelling an already invalid handle is a no-op.
  pub fn cancel(&self, handle: &WatchHandle) {
    let Some(registration) = self.registrations.get(&handle.id).map(|r| Arc::clone(r.value())) else {
      return;
    };
    if registration.valid.swap(false, Ordering::SeqCst) {
      self.release(&registration);
      trace!(id = handle.id, dir = %handle.dir.display(), "Watch cancelled");
    }
  }

  /// Whether the handle is still live.
  pub fn is_valid(&self, handle: &WatchHandle) -> bool {
    self
      .registrations
      .get(&handle.id)
      .is_some_and(|r| r.valid.load(Ordering::SeqCst))
  }

  /// Directories currently under native observation.
  pub fn watched_dirs(&self) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = self.by_dir.iter().map(|e| e.key().clone()).collect();
    dirs.sort();
    dirs
  }

  /// Number of live registrations.
  pub fn len(&self) -> usize {
    self.registrations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.registrations.is_empty()
  }

  fn service_for(&self, key: FsKey) -> Result<Arc<Mutex<NativeService>>, WatchError> {
    let entry = self.services.entry(key).or_try_insert_with(|| {
      let tx = self.event_tx.clone();
      let watcher = RecommendedWatcher::new(
        move |res| {
          // This runs on notify's thread - use blocking_send
          // If the channel is closed the registry is shutting down
          let _ = tx.blocking_send(res);
        },
        NotifyConfig::default(),
      )
      .map_err(WatchError::Init)?;
      info!(fs = key, "Native watch service started");
      Ok::<_, WatchError>(Arc::new(Mutex::new(NativeService {
        watcher,
        refs: HashMap::new(),
      })))
    })?;
    Ok(Arc::clone(entry.value()))
  }

  /// Drop a registration and release its native watch reference.
  fn release(&self, registration: &Registration) {
    self.registrations.remove(&registration.id);

    let now_unused = match self.by_dir.get_mut(&registration.dir) {
      Some(mut ids) => {
        ids.retain(|id| *id != registration.id);
        ids.is_empty()
      }
      None => false,
    };
    if now_unused {
      self.by_dir.remove_if(&registration.dir, |_, ids| ids.is_empty());
    }

    let Ok(key) = filesystem_key_or_cached(&registration.dir, &self.services) else {
      return;
    };
    let Some(service) = self.services.get(&key).map(|s| Arc::clone(s.value())) else {
      return;
    };
    let unused = {
      let mut guard = service.lock().unwrap_or_else(PoisonError::into_inner);
      let remaining = guard.refs.get(&registration.dir).copied().unwrap_or(0).saturating_sub(1);
      if remaining == 0 {
        guard.refs.remove(&registration.dir);
        true
      } else {
        guard.refs.insert(registration.dir.clone(), remaining);
        false
      }
    };
    if !unused {
      return;
    }

    // notify's unwatch can block on its event thread, which may itself be
    // waiting on the channel the pump drains
    let dir = registration.dir.clone();
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn_blocking(move || unwatch_if_unused(&service, &dir));
      }
      Err(_) => unwatch_if_unused(&service, &dir),
    }
  }

  /// Invalidate a registration whose directory vanished; notifies once.
  fn invalidate(&self, registration: &Arc<Registration>) {
    if registration.valid.swap(false, Ordering::SeqCst) {
      self.release(registration);
      info!(dir = %registration.dir.display(), "Watched directory is gone, watch invalidated");
      registration.listener.on_cancelled(&registration.dir);
    }
  }

  fn registrations_for(&self, dir: &Path) -> Vec<Arc<Registration>> {
    let ids: Vec<u64> = self.by_dir.get(dir).map(|ids| ids.clone()).unwrap_or_default();
    ids
      .iter()
      .filter_map(|id| self.registrations.get(id).map(|r| Arc::clone(r.value())))
      .collect()
  }

  async fn run(
    self: Arc<Self>,
    mut event_rx: mpsc::Receiver<notify::Result<Event>>,
    poll_interval: std::time::Duration,
    cancel: CancellationToken,
  ) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("Watch registry shutting down (cancelled)");
          break;
        }

        event = event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.dispatch(event),
            Some(Err(e)) => warn!(error = %e, "Watcher error"),
            None => {
              info!("Watch registry shutting down (channel closed)");
              break;
            }
          }
        }

        _ = poll.tick() => {
          self.poll_validity();
        }
      }
    }

    self.registrations.clear();
    self.by_dir.clear();
    self.services.clear();
  }

  fn dispatch(&self, event: Event) {
    for (path, kind) in map_event(&event) {
      if kind == FileEventKind::Deleted {
        for registration in self.registrations_for(&path) {
          self.invalidate(&registration);
        }
      }

      let Some(parent) = path.parent() else {
        continue;
      };
      for registration in self.registrations_for(parent) {
        if registration.valid.load(Ordering::SeqCst) && registration.kinds.contains(kind) {
          trace!(path = %path.display(), ?kind, id = registration.id, "Dispatching watch event");
          registration.listener.on_event(&path, kind);
        }
      }
    }
  }

  fn poll_validity(&self) {
    let stale: Vec<Arc<Registration>> = self
      .registrations
      .iter()
      .filter(|r| !r.dir.is_dir())
      .map(|r| Arc::clone(r.value()))
      .collect();
    for registration in stale {
      self.invalidate(&registration);
    }
  }
}

// ============================================================================
// Helpers
// ============================================================================

/// Map a notify event onto (path, kind) pairs.
fn map_event(event: &Event) -> Vec<(PathBuf, FileEventKind)> {
  let all = |kind: FileEventKind| event.paths.iter().map(|p| (p.clone(), kind)).collect::<Vec<_>>();

  match event.kind {
    EventKind::Create(_) => all(FileEventKind::Created),
    EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
      (event.paths[0].clone(), FileEventKind::Deleted),
      (event.paths[1].clone(), FileEventKind::Created),
    ],
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(FileEventKind::Deleted),
    EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(FileEventKind::Created),
    EventKind::Modify(ModifyKind::Name(_)) => event
      .paths
      .iter()
      .map(|p| {
        let kind = if p.exists() {
          FileEventKind::Modified
        } else {
          FileEventKind::Deleted
        };
        (p.clone(), kind)
      })
      .collect(),
    EventKind::Modify(_) => all(FileEventKind::Modified),
    EventKind::Remove(_) => all(FileEventKind::Deleted),
    EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
  }
}

#[cfg(unix)]
fn filesystem_key(path: &Path) -> std::io::Result<FsKey> {
  use std::os::unix::fs::MetadataExt;
  Ok(std::fs::metadata(path)?.dev())
}

#[cfg(not(unix))]
fn filesystem_key(path: &Path) -> std::io::Result<FsKey> {
  use std::hash::{Hash, Hasher};
  let mut hasher = std::collections::hash_map::DefaultHasher::new();
  path.components().next().hash(&mut hasher);
  Ok(hasher.finish())
}

/// Resolve the filesystem of a directory that may already be deleted by
/// finding the service that holds a reference to it.
fn filesystem_key_or_cached(
  dir: &Path,
  services: &DashMap<FsKey, Arc<Mutex<NativeService>>>,
) -> std::io::Result<FsKey> {
  if let Ok(key) = filesystem_key(dir) {
    return Ok(key);
  }
  services
    .iter()
    .find(|entry| {
      entry
        .value()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .refs
        .contains_key(dir)
    })
    .map(|entry| *entry.key())
    .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no service watches this directory"))
}

/// Drop the native watch unless the directory was re-registered meanwhile.
fn unwatch_if_unused(service: &Mutex<NativeService>, dir: &Path) {
  let mut service = service.lock().unwrap_or_else(PoisonError::into_inner);
  if service.refs.contains_key(dir) {
    return;
  }
  // The directory may already be gone, in which case the OS dropped the watch
  if let Err(e) = service.watcher.unwatch(dir) {
    trace!(dir = %dir.display(), error = %e, "Unwatch failed");
  }
  debug!(dir = %dir.display(), "Native watch removed");
}
