//! Management façade seam
//!
//! Branches and components are registered under an `ObjectAddress` derived
//! from the branch's label set, so two directory layouts that produce the same
//! labels in a different order map to the same object. Any protocol can sit
//! behind `ManagementSink`; the engine ships an in-memory registry and a sink
//! that only logs.

use std::{
  collections::{BTreeMap, VecDeque},
  fmt,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::address::{BranchAddress, RESERVED_KEY};

/// Domain prefix of every object address
pub const DOMAIN: &str = "collectord";

/// Stable, collision-free name of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectAddress(String);

impl ObjectAddress {
  pub fn branch(address: &BranchAddress) -> Self {
    Self(format!("{DOMAIN}:{address}"))
  }

  pub fn component(address: &BranchAddress, name: &str) -> Self {
    Self(format!("{DOMAIN}:{address},{RESERVED_KEY}={name}"))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ObjectAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Something whose live state can be inspected through the façade.
pub trait Managed: Send + Sync {
  fn kind(&self) -> &'static str;

  fn attributes(&self) -> serde_json::Value;
}

pub trait ManagementSink: Send + Sync {
  fn register(&self, address: ObjectAddress, object: Arc<dyn Managed>);

  fn unregister(&self, address: &ObjectAddress);

  fn notify(&self, address: &ObjectAddress, kind: &str, message: &str);
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
  pub sequence: u64,
  pub address: ObjectAddress,
  pub kind: String,
  pub message: String,
  pub timestamp: DateTime<Utc>,
}

// ============================================================================
// ManagementRegistry
// ============================================================================

/// In-memory registry with a bounded notification log
pub struct ManagementRegistry {
  objects: DashMap<ObjectAddress, Arc<dyn Managed>>,
  notifications: Mutex<VecDeque<Notification>>,
  capacity: usize,
  sequence: AtomicU64,
}

impl ManagementRegistry {
  pub fn new(capacity: usize) -> Self {
    Self {
      objects: DashMap::new(),
      notifications: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
      capacity: capacity.max(1),
      sequence: AtomicU64::new(0),
    }
  }

  pub fn addresses(&self) -> Vec<ObjectAddress> {
    let mut out: Vec<ObjectAddress> = self.objects.iter().map(|e| e.key().clone()).collect();
    out.sort();
    out
  }

  pub fn contains(&self, address: &ObjectAddress) -> bool {
    self.objects.contains_key(address)
  }

  /// Live attributes of one object.
  pub fn attributes(&self, address: &ObjectAddress) -> Option<serde_json::Value> {
    self.objects.get(address).map(|o| o.attributes())
  }

  /// Attributes of every registered object, keyed by address.
  pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
    self
      .objects
      .iter()
      .map(|e| (e.key().to_string(), e.value().attributes()))
      .collect()
  }

  pub fn notifications(&self) -> Vec<Notification> {
    self
      .notifications
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .cloned()
      .collect()
  }
}

impl Default for ManagementRegistry {
  fn default() -> Self {
    Self::new(1000)
  }
}

impl ManagementSink for ManagementRegistry {
  fn register(&self, address: ObjectAddress, object: Arc<dyn Managed>) {
    debug!(address = %address, kind = object.kind(), "Managed object registered");
    self.objects.insert(address, object);
  }

  fn unregister(&self, address: &ObjectAddress) {
    if self.objects.remove(address).is_some() {
      debug!(address = %address, "Managed object unregistered");
    }
  }

  fn notify(&self, address: &ObjectAddress, kind: &str, message: &str) {
    let notification = Notification {
      sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
      address: address.clone(),
      kind: kind.to_string(),
      message: message.to_string(),
      timestamp: Utc::now(),
    };
    let mut log = self.notifications.lock().unwrap_or_else(PoisonError::into_inner);
    if log.len() == self.capacity {
      log.pop_front();
    }
    log.push_back(notification);
  }
}

// ============================================================================
// TracingSink
// ============================================================================

/// Sink that reports every façade call to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ManagementSink for TracingSink {
  fn register(&self, address: ObjectAddress, object: Arc<dyn Managed>) {
    info!(address = %address, kind = object.kind(), "register");
  }

  fn unregister(&self, address: &ObjectAddress) {
    info!(address = %address, "unregister");
  }

  fn notify(&self, address: &ObjectAddress, kind: &str, message: &str) {
    info!(address = %address, kind, message, "notification");
  }
}
