//! Filesystem watching: native watch registry and event debouncer

pub mod debounce;
pub mod event;
pub mod registry;

pub use debounce::{Debouncer, DebouncerHandle, PendingEvent, SendError};
pub use event::{EventHandler, EventKinds, FileEvent, FileEventKind};
pub use registry::{WatchError, WatchHandle, WatchListener, WatchRegistry};
