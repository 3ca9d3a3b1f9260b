//! Bounded worker pools
//!
//! Every kind of background work runs on its own pool so that one kind cannot
//! starve another: a hung collection holds a `collections` permit, never an
//! `events` permit, so directory-watch processing keeps flowing.
//!
//! A pool is a named `Semaphore` in front of `tokio::spawn`. Tasks are spawned
//! immediately and wait for a permit, so `spawn` never blocks the caller.

use std::{
  future::Future,
  panic::AssertUnwindSafe,
  sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
};

use futures::FutureExt;
use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
  #[error("worker pool '{0}' must have at least one worker")]
  ZeroSize(String),
}

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
  pub name: String,
  pub size: usize,
  pub active: usize,
  pub queued: usize,
  pub completed: u64,
  pub panicked: u64,
  pub closed: bool,
}

#[derive(Debug)]
struct PoolInner {
  name: String,
  size: usize,
  permits: Arc<Semaphore>,
  active: AtomicUsize,
  queued: AtomicUsize,
  completed: AtomicU64,
  panicked: AtomicU64,
}

/// Decrements the active count even when the task panics or is aborted.
struct ActiveGuard(Arc<PoolInner>);

impl Drop for ActiveGuard {
  fn drop(&mut self) {
    self.0.active.fetch_sub(1, Ordering::SeqCst);
  }
}

/// A named, bounded pool of async workers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerPool {
  inner: Arc<PoolInner>,
}

impl WorkerPool {
  pub fn new(name: impl Into<String>, size: usize) -> Result<Self, PoolError> {
    let name = name.into();
    if size == 0 {
      return Err(PoolError::ZeroSize(name));
    }
    Ok(Self {
      inner: Arc::new(PoolInner {
        name,
        size,
        permits: Arc::new(Semaphore::new(size)),
        active: AtomicUsize::new(0),
        queued: AtomicUsize::new(0),
        completed: AtomicU64::new(0),
        panicked: AtomicU64::new(0),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Run `fut` once a worker is free.
  ///
  /// The handle resolves to `None` if the pool was closed before the task got
  /// a worker. Aborting the handle cancels the task wherever it is.
  pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<Option<T>>
  where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    inner.queued.fetch_add(1, Ordering::SeqCst);

    tokio::spawn(async move {
      let permit = Arc::clone(&inner.permits).acquire_owned().await;
      inner.queued.fetch_sub(1, Ordering::SeqCst);
      let Ok(_permit) = permit else {
        debug!(pool = %inner.name, "Pool closed, dropping task");
        return None;
      };

      inner.active.fetch_add(1, Ordering::SeqCst);
      let _guard = ActiveGuard(Arc::clone(&inner));
      match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(out) => {
          inner.completed.fetch_add(1, Ordering::SeqCst);
          Some(out)
        }
        Err(payload) => {
          inner.panicked.fetch_add(1, Ordering::SeqCst);
          warn!(pool = %inner.name, "Worker task panicked");
          std::panic::resume_unwind(payload)
        }
      }
    })
  }

  /// Stop handing out workers. Running tasks finish; queued tasks are dropped.
  pub fn close(&self) {
    self.inner.permits.close();
  }

  pub fn stats(&self) -> PoolStats {
    PoolStats {
      name: self.inner.name.clone(),
      size: self.inner.size,
      active: self.inner.active.load(Ordering::SeqCst),
      queued: self.inner.queued.load(Ordering::SeqCst),
      completed: self.inner.completed.load(Ordering::SeqCst),
      panicked: self.inner.panicked.load(Ordering::SeqCst),
      closed: self.inner.permits.is_closed(),
    }
  }
}

/// The three independently sized pools the engine runs on.
#[derive(Debug, Clone)]
pub struct Pools {
  /// Filesystem event processing
  pub events: WorkerPool,
  /// Scheduled collections
  pub collections: WorkerPool,
  /// Branch bootstrap and compilation
  pub deploy: WorkerPool,
}

impl Pools {
  pub fn from_config(config: &crate::domain::config::PoolConfig) -> Result<Self, PoolError> {
    Ok(Self {
      events: WorkerPool::new("events", config.events)?,
      collections: WorkerPool::new("collections", config.collections)?,
      deploy: WorkerPool::new("deploy", config.deploy)?,
    })
  }

  pub fn stats(&self) -> Vec<PoolStats> {
    vec![self.events.stats(), self.collections.stats(), self.deploy.stats()]
  }

  pub fn close(&self) {
    self.events.close();
    self.collections.close();
    self.deploy.close();
  }
}
