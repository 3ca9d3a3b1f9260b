//! Collection scheduler
//!
//! One ticker task per scheduled component. The ticker only waits; every
//! collection runs on the `collections` pool, so a hung collector holds a
//! collections worker and never an events worker.
//!
//! Entries are keyed by component identity (its source file). Scheduling a
//! key that already has an entry swaps the entry in one map insert and
//! cancels the old ticker, so a redeploy never leaves two tickers running.
//!
//! On cancellation an in-flight collection is left to finish unless the
//! collector is interruptible; then it is interrupted and, if it has not
//! returned within the grace period, its worker is aborted.

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Duration,
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
  component::Component,
  domain::{
    schedule::ScheduleSpec,
    state::{CollectResult, CollectorState},
  },
  pool::WorkerPool,
};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
  #[error("component {0} is not a collector")]
  NotCollector(String),

  #[error("scheduler is shut down")]
  Closed,
}

struct Entry {
  generation: u64,
  component: Arc<Component>,
  spec: ScheduleSpec,
  token: CancellationToken,
}

/// A scheduled component as reported by `Scheduler::entries`
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEntry {
  pub key: String,
  pub component: String,
  pub schedule: String,
}

pub struct Scheduler {
  pool: WorkerPool,
  grace: Duration,
  entries: Arc<DashMap<String, Entry>>,
  generation: AtomicU64,
  cancel: CancellationToken,
}

impl Scheduler {
  pub fn new(pool: WorkerPool, grace: Duration, cancel: CancellationToken) -> Self {
    Self {
      pool,
      grace,
      entries: Arc::new(DashMap::new()),
      generation: AtomicU64::new(0),
      cancel,
    }
  }

  /// Schedule `component`, replacing any entry it already has.
  pub fn schedule(&self, component: Arc<Component>, spec: ScheduleSpec) -> Result<(), SchedulerError> {
    if component.instance().collector().is_none() {
      return Err(SchedulerError::NotCollector(component.name().to_string()));
    }
    if self.cancel.is_cancelled() {
      return Err(SchedulerError::Closed);
    }

    let key = component.key();
    let generation = self.generation.fetch_add(1, Ordering::SeqCst);
    let token = self.cancel.child_token();
    let entry = Entry {
      generation,
      component: Arc::clone(&component),
      spec: spec.clone(),
      token: token.clone(),
    };

    if let Some(old) = self.entries.insert(key.clone(), entry) {
      old.token.cancel();
      debug!(component = %component.name(), "Schedule entry replaced");
    }
    info!(component = %component.name(), schedule = %spec, "Component scheduled");

    let ticker = Ticker {
      key,
      generation,
      component,
      spec,
      pool: self.pool.clone(),
      grace: self.grace,
      entries: Arc::clone(&self.entries),
      token,
    };
    tokio::spawn(ticker.run());
    Ok(())
  }

  /// Remove the component's entry. A no-op for unscheduled components.
  pub fn cancel(&self, component: &Component) {
    if let Some((_, entry)) = self.entries.remove(&component.key()) {
      entry.token.cancel();
      debug!(component = %component.name(), "Schedule entry cancelled");
    }
  }

  /// Whether this exact component instance currently holds the entry for its key.
  pub fn is_scheduled(&self, component: &Arc<Component>) -> bool {
    self
      .entries
      .get(&component.key())
      .is_some_and(|e| Arc::ptr_eq(&e.component, component))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entries(&self) -> Vec<ScheduledEntry> {
    let mut out: Vec<ScheduledEntry> = self
      .entries
      .iter()
      .map(|e| ScheduledEntry {
        key: e.key().clone(),
        component: e.component.name().to_string(),
        schedule: e.spec.to_string(),
      })
      .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
  }

  /// Cancel every entry.
  pub fn shutdown(&self) {
    self.cancel.cancel();
    self.entries.clear();
  }
}

// ============================================================================
// Ticker
// ============================================================================

struct Ticker {
  key: String,
  generation: u64,
  component: Arc<Component>,
  spec: ScheduleSpec,
  pool: WorkerPool,
  grace: Duration,
  entries: Arc<DashMap<String, Entry>>,
  token: CancellationToken,
}

impl Ticker {
  async fn run(self) {
    let mut delay = self.spec.first_delay();

    loop {
      let Some(wait) = delay else {
        info!(component = %self.component.name(), "Schedule has no further fire times");
        self.remove_own_entry();
        break;
      };

      tokio::select! {
        biased;
        _ = self.token.cancelled() => break,
        _ = tokio::time::sleep(wait) => {}
      }

      match self.component.refresh_blackout().await {
        CollectorState::Started => {
          if !self.invoke().await {
            break;
          }
        }
        CollectorState::Isolated => {
          self.isolate();
          break;
        }
        state => {
          trace!(component = %self.component.name(), %state, "Skipping scheduled collection");
        }
      }

      if self.component.state() == CollectorState::Isolated {
        self.isolate();
        break;
      }
      delay = self.spec.next_delay();
    }

    trace!(component = %self.component.name(), "Ticker stopped");
  }

  /// Run one collection on the pool. Returns false when the ticker must stop.
  async fn invoke(&self) -> bool {
    let component = Arc::clone(&self.component);
    let mut job = self.pool.spawn(async move { component.collect().await });

    let outcome = tokio::select! {
      biased;
      _ = self.token.cancelled() => {
        self.wind_down(&mut job).await;
        return false;
      }
      outcome = &mut job => outcome,
    };

    match outcome {
      Ok(Some(Ok(result))) => {
        if result != CollectResult::Complete {
          debug!(component = %self.component.name(), %result, "Scheduled collection finished");
        }
        true
      }
      // The component left STARTED between the check and the call
      Ok(Some(Err(e))) => {
        trace!(component = %self.component.name(), error = %e, "Scheduled collection skipped");
        true
      }
      Ok(None) => {
        debug!(component = %self.component.name(), "Collections pool closed");
        false
      }
      Err(e) => {
        warn!(component = %self.component.name(), error = %e, "Scheduled collection task failed");
        true
      }
    }
  }

  async fn wind_down(&self, job: &mut JoinHandle<Option<Result<CollectResult, crate::component::LifecycleError>>>) {
    if !self.component.interruptible() {
      debug!(component = %self.component.name(), "Leaving in-flight collection to finish");
      return;
    }

    self.component.interrupt();
    if tokio::time::timeout(self.grace, &mut *job).await.is_err() {
      job.abort();
      warn!(
        component = %self.component.name(),
        grace_ms = self.grace.as_millis() as u64,
        "Interrupted collection did not finish within grace period, cancelled"
      );
    }
  }

  fn isolate(&self) {
    info!(component = %self.component.name(), "Component isolated, removing from scheduler");
    self.remove_own_entry();
  }

  fn remove_own_entry(&self) {
    self.entries.remove_if(&self.key, |_, e| e.generation == self.generation);
  }
}
