//! KeyRecorder core - tiered persistence for captured key events.
//!
//! This crate provides the storage engine behind the KeyRecorder service:
//! a crash-safe pipeline that takes a stream of captured events and keeps
//! them queryable without ever losing an acknowledged write.
//!
//! # Overview
//!
//! Events move through three tiers:
//!
//! 1. A debounce buffer in memory, written out after a quiet period
//! 2. The hot store, a small SQLite file optimized for ingest
//! 3. The main store, long-term SQLite storage that is periodically
//!    snapshotted and can be restored from those snapshots
//!
//! The [`Coordinator`] owns all three and is the only component that
//! touches the stores directly.
//!
//! # Modules
//!
//! - [`types`]: Event records, time ranges and retention policy
//! - [`store`]: Hot, main and snapshot store tiers
//! - [`coordinator`]: Buffering, migration, maintenance and recovery
//! - [`ipc`]: Local control channel over a Unix domain socket
//! - [`error`]: Error types for recorder operations
//! - [`utils`]: Shared utilities (debouncing)

pub mod coordinator;
pub mod error;
pub mod ipc;
pub mod store;
pub mod types;
pub mod utils;

pub use coordinator::{Coordinator, CoordinatorError, CoordinatorState};
pub use error::{RecorderError, Result};
pub use ipc::{IpcClient, IpcError, IpcMessage, IpcServer, MessageType, StatusResponse};
pub use store::{HotStore, MainStore, SnapshotStore, Store, StoreError};
pub use types::{CapturedEvent, EventRecord, KeyAction, Modifiers, RetentionPolicy, TimeRange};
pub use utils::{Debouncer, DEFAULT_DEBOUNCE_MS};
