//! Sync coordinator: the single owner of the store tiers.
//!
//! The coordinator wires the debounce buffer, hot store, main store and
//! snapshot directory together and exposes the operations the rest of the
//! system uses:
//!
//! - Ingest: [`record`](Coordinator::record) sequences an event and buffers it;
//!   the buffer is written to the hot tier after a quiet period
//! - Migration: [`sync`](Coordinator::sync) moves hot records into main
//! - Maintenance: integrity checks, snapshots, retention, recovery
//! - Reads: [`recent`](Coordinator::recent) merges both tiers
//!
//! # Lifecycle
//!
//! `Uninitialized -> Initialized -> Running -> Draining -> Closed`.
//! Only a running coordinator accepts new events or migrates records.
//!
//! # Concurrency
//!
//! Writes into the hot tier are serialized by one lock, maintenance jobs by
//! another. A sync takes the hot-write lock only while marking and purging,
//! so ingest is never blocked behind a main-tier write. All SQLite work runs
//! on the blocking thread pool.
//!
//! # Example
//!
//! ```no_run
//! use keyrecorder_core::coordinator::Coordinator;
//! use keyrecorder_core::types::{CapturedEvent, KeyAction, Modifiers};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = Coordinator::new("/var/lib/keyrecorder");
//!     coordinator.initialize().await?;
//!     coordinator.start()?;
//!
//!     coordinator.record(CapturedEvent::now(KeyAction {
//!         virtual_key_code: 0x41,
//!         key_name: "A".to_string(),
//!         is_key_down: true,
//!         modifiers: Modifiers::default(),
//!     }))?;
//!
//!     coordinator.flush().await?;
//!     coordinator.sync().await?;
//!
//!     let unflushed = coordinator.shutdown(Duration::from_secs(5)).await;
//!     assert_eq!(unflushed, 0);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::store::{HotStore, MainStore, SnapshotStore, Store, StoreError};
use crate::types::{CapturedEvent, EventRecord, RetentionPolicy, TimeRange};
use crate::utils::debounce::Debouncer;

pub mod merge;

pub use merge::merge_recent;

/// Lifecycle state of a [`Coordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Uninitialized,
    Initialized,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during coordinator operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} while coordinator is {state}")]
    InvalidState {
        operation: &'static str,
        state: CoordinatorState,
    },

    /// A blocking store task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Handle to the tiered store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    base_path: PathBuf,
    hot: Arc<HotStore>,
    main: Arc<MainStore>,
    snapshots: Arc<SnapshotStore>,
    buffer: Debouncer<EventRecord>,
    /// Records taken from the buffer whose hot-tier write has not finished.
    in_flight: AtomicUsize,
    sequence: AtomicI64,
    state: RwLock<CoordinatorState>,
    hot_writes: AsyncMutex<()>,
    maintenance: AsyncMutex<()>,
    recording: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    last_snapshot: Mutex<Option<DateTime<Utc>>>,
}

impl Coordinator {
    /// Creates a coordinator over `base_path` with the default debounce interval.
    ///
    /// Nothing touches the disk until [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_buffer(base_path, Debouncer::with_default_interval())
    }

    /// Creates a coordinator with a custom debounce interval.
    #[must_use]
    pub fn with_debounce(base_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self::with_buffer(base_path, Debouncer::new(interval))
    }

    fn with_buffer(base_path: impl Into<PathBuf>, buffer: Debouncer<EventRecord>) -> Self {
        let base_path = base_path.into();
        Self {
            inner: Arc::new(Inner {
                hot: Arc::new(HotStore::new(&base_path)),
                main: Arc::new(MainStore::new(&base_path)),
                snapshots: Arc::new(SnapshotStore::new(&base_path)),
                base_path,
                buffer,
                in_flight: AtomicUsize::new(0),
                sequence: AtomicI64::new(0),
                state: RwLock::new(CoordinatorState::Uninitialized),
                hot_writes: AsyncMutex::new(()),
                maintenance: AsyncMutex::new(()),
                recording: AtomicBool::new(true),
                last_sync: Mutex::new(None),
                last_snapshot: Mutex::new(None),
            }),
        }
    }

    /// Directory holding `hot.db`, `main.db` and the snapshots.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.read()
    }

    /// Opens both tiers and seeds the sequence counter.
    ///
    /// If the main tier cannot be opened, recovery from the newest usable
    /// snapshot is attempted before giving up.
    ///
    /// # Errors
    ///
    /// Returns the store error if either tier is unusable, or
    /// [`CoordinatorError::InvalidState`] if already initialized.
    pub async fn initialize(&self) -> Result<(), CoordinatorError> {
        self.expect_state("initialize", &[CoordinatorState::Uninitialized])?;

        // Debounce timers stay on this runtime even when events are
        // recorded from capture threads outside it.
        if let Ok(runtime) = Handle::try_current() {
            self.inner.buffer.bind_runtime(runtime);
        }

        let hot = Arc::clone(&self.inner.hot);
        run_blocking(move || hot.initialize()).await?;

        let main = Arc::clone(&self.inner.main);
        if let Err(e) = run_blocking(move || main.initialize()).await {
            warn!(error = %e, "Main store failed to open, attempting recovery");
            let _maintenance = self.inner.maintenance.lock().await;
            if !self.inner.recover_locked().await {
                return Err(e);
            }
        }

        let hot = Arc::clone(&self.inner.hot);
        let main = Arc::clone(&self.inner.main);
        let last_sequence =
            run_blocking(move || Ok(hot.max_sequence_id()?.max(main.max_sequence_id()?))).await?;
        self.inner.sequence.store(last_sequence, Ordering::SeqCst);

        *self.inner.state.write() = CoordinatorState::Initialized;
        info!(
            path = %self.inner.base_path.display(),
            last_sequence_id = last_sequence,
            "Coordinator initialized"
        );
        Ok(())
    }

    /// Starts accepting events.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        self.transition(
            "start",
            &[CoordinatorState::Initialized],
            CoordinatorState::Running,
        )?;
        info!("Coordinator running");
        Ok(())
    }

    /// Sequences an event and appends it to the debounce buffer.
    ///
    /// Never blocks on disk I/O and may be called from any thread, inside a
    /// Tokio runtime or not. Returns the assigned sequence id.
    pub fn record(&self, event: CapturedEvent) -> Result<i64, CoordinatorError> {
        let state = self.inner.state.read();
        if *state != CoordinatorState::Running {
            return Err(CoordinatorError::InvalidState {
                operation: "record",
                state: *state,
            });
        }

        let sequence_id = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.buffer.push(event.into_record(sequence_id));
        schedule_flush(&self.inner);

        trace!(sequence_id, "Event buffered");
        Ok(sequence_id)
    }

    /// Writes the buffer to the hot tier now. Returns the number written.
    ///
    /// # Errors
    ///
    /// On a store failure the batch is returned to the buffer and the error
    /// is surfaced.
    pub async fn flush(&self) -> Result<usize, CoordinatorError> {
        self.expect_state(
            "flush",
            &[CoordinatorState::Running, CoordinatorState::Draining],
        )?;
        self.inner.buffer.cancel();
        self.inner.write_pending().await
    }

    /// Migrates every unsynced hot record into main, then purges it from hot.
    ///
    /// Re-running after a failure at any step is safe: records are only
    /// marked synced after main has committed them. Returns the number of
    /// records migrated.
    pub async fn sync(&self) -> Result<usize, CoordinatorError> {
        self.expect_state("sync", &[CoordinatorState::Running])?;
        let _maintenance = self.inner.maintenance.lock().await;

        let hot = Arc::clone(&self.inner.hot);
        let unsynced = run_blocking(move || hot.unsynced()).await?;
        if unsynced.is_empty() {
            debug!("No unsynced events");
            *self.inner.last_sync.lock() = Some(Utc::now());
            return Ok(0);
        }

        let ids: Vec<i64> = unsynced.iter().map(|record| record.id).collect();
        let migrated: Vec<EventRecord> = unsynced
            .into_iter()
            .map(|mut record| {
                record.synced = true;
                record
            })
            .collect();
        let count = migrated.len();

        let main = Arc::clone(&self.inner.main);
        run_blocking(move || main.bulk_insert(&migrated)).await?;

        let purged = {
            let _writes = self.inner.hot_writes.lock().await;
            let hot = Arc::clone(&self.inner.hot);
            run_blocking(move || {
                hot.mark_synced(&ids)?;
                hot.purge_synced()
            })
            .await?
        };

        *self.inner.last_sync.lock() = Some(Utc::now());
        info!(synced = count, purged, "Hot to main sync complete");
        Ok(count)
    }

    /// Checks the main tier and recovers from a snapshot if it is damaged.
    ///
    /// Returns `true` only if the check passed.
    pub async fn integrity_check(&self) -> bool {
        let _maintenance = self.inner.maintenance.lock().await;

        let main = Arc::clone(&self.inner.main);
        match run_blocking(move || main.integrity_check()).await {
            Ok(true) => {
                info!("Integrity check passed");
                true
            }
            Ok(false) => {
                warn!("Integrity check failed, attempting recovery");
                self.inner.recover_locked().await;
                false
            }
            Err(CoordinatorError::Store(StoreError::NotInitialized { .. })) => {
                debug!("Skipping integrity check, main store is closed");
                false
            }
            Err(e) => {
                error!(error = %e, "Integrity check could not run, attempting recovery");
                self.inner.recover_locked().await;
                false
            }
        }
    }

    /// Replaces the main tier with the newest snapshot that opens cleanly.
    ///
    /// Returns `false` if no snapshot could be restored; main is then
    /// reopened as it was.
    pub async fn recover(&self) -> bool {
        let _maintenance = self.inner.maintenance.lock().await;
        self.inner.recover_locked().await
    }

    /// Checkpoints main and copies it into a new snapshot. Returns its name.
    pub async fn create_snapshot(&self) -> Result<String, CoordinatorError> {
        let _maintenance = self.inner.maintenance.lock().await;

        let main = Arc::clone(&self.inner.main);
        let snapshots = Arc::clone(&self.inner.snapshots);
        let name = run_blocking(move || {
            main.checkpoint()?;
            snapshots.create(main.path())
        })
        .await?;

        *self.inner.last_snapshot.lock() = Some(Utc::now());
        info!(snapshot = %name, "Snapshot created");
        Ok(name)
    }

    /// Deletes all but the `max_keep` newest snapshots.
    pub async fn prune_snapshots(&self, max_keep: usize) -> Result<usize, CoordinatorError> {
        let snapshots = Arc::clone(&self.inner.snapshots);
        let deleted = run_blocking(move || snapshots.prune(max_keep)).await?;
        if deleted > 0 {
            info!(deleted, max_keep, "Pruned old snapshots");
        }
        Ok(deleted)
    }

    /// Snapshot names, newest first.
    pub async fn snapshots(&self) -> Result<Vec<String>, CoordinatorError> {
        let snapshots = Arc::clone(&self.inner.snapshots);
        run_blocking(move || snapshots.list()).await
    }

    /// Prunes the main tier according to `policy`. Failures are logged.
    pub async fn apply_retention(&self, policy: RetentionPolicy) {
        let _maintenance = self.inner.maintenance.lock().await;

        if policy.retention_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(policy.retention_days));
            let main = Arc::clone(&self.inner.main);
            match run_blocking(move || main.prune_older_than(cutoff)).await {
                Ok(deleted) => info!(
                    deleted,
                    retention_days = policy.retention_days,
                    "Applied age retention"
                ),
                Err(e) => error!(error = %e, "Failed to apply age retention"),
            }
        }

        if let Some(max_events) = policy.max_events {
            let main = Arc::clone(&self.inner.main);
            match run_blocking(move || main.prune_excess(max_events)).await {
                Ok(deleted) => info!(deleted, max_events, "Applied event count limit"),
                Err(e) => error!(error = %e, "Failed to apply event count limit"),
            }
        }

        if let Some(max_storage_bytes) = policy.max_storage_bytes {
            debug!(max_storage_bytes, "Storage size limit is not enforced");
        }
    }

    /// Up to `limit` most recent records across both tiers, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<EventRecord>, CoordinatorError> {
        self.query(TimeRange::all(), limit).await
    }

    /// Up to `limit` records inside `range` across both tiers, newest first.
    pub async fn query(
        &self,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<EventRecord>, CoordinatorError> {
        let hot = Arc::clone(&self.inner.hot);
        let main = Arc::clone(&self.inner.main);
        let (hot_records, main_records) = run_blocking(move || {
            Ok((hot.query(range, limit)?, main.query(range, limit)?))
        })
        .await?;
        Ok(merge_recent(hot_records, main_records, limit))
    }

    /// Stored records in hot plus main.
    ///
    /// May briefly count a record twice between a sync's main commit and
    /// its hot purge.
    pub async fn count(&self) -> Result<u64, CoordinatorError> {
        let hot = Arc::clone(&self.inner.hot);
        let main = Arc::clone(&self.inner.main);
        run_blocking(move || Ok(hot.count()? + main.count()?)).await
    }

    /// Records waiting in the debounce buffer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.buffer.len()
    }

    /// Highest sequence id handed out so far.
    #[must_use]
    pub fn last_sequence_id(&self) -> i64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_sync.lock()
    }

    #[must_use]
    pub fn last_snapshot_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_snapshot.lock()
    }

    /// Whether captured events should be recorded.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    pub fn set_recording(&self, recording: bool) {
        let previous = self.inner.recording.swap(recording, Ordering::SeqCst);
        if previous != recording {
            info!(recording, "Recording state changed");
        }
    }

    /// Feeds events from a capture source into [`record`](Self::record).
    ///
    /// Events arriving while recording is paused are dropped. The task ends
    /// when the channel closes or the coordinator stops accepting events.
    pub fn spawn_consumer(&self, mut events: mpsc::Receiver<CapturedEvent>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !coordinator.is_recording() {
                    trace!("Recording paused, dropping captured event");
                    continue;
                }
                if let Err(e) = coordinator.record(event) {
                    warn!(error = %e, "Captured event rejected, stopping consumer");
                    break;
                }
            }
            debug!("Capture consumer finished");
        })
    }

    /// Stops accepting events, flushes the buffer and closes both tiers.
    ///
    /// Waits at most `timeout` for the final flush. Returns the number of
    /// buffered events that could not be written.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        {
            let mut state = self.inner.state.write();
            match *state {
                CoordinatorState::Initialized
                | CoordinatorState::Running
                | CoordinatorState::Draining => *state = CoordinatorState::Draining,
                CoordinatorState::Uninitialized | CoordinatorState::Closed => {
                    *state = CoordinatorState::Closed;
                    return 0;
                }
            }
        }

        self.inner.buffer.cancel();
        let pending = self.inner.buffer.len();
        if pending > 0 {
            info!(buffered_events = pending, "Flushing buffer before shutdown");
        }

        let unflushed = match tokio::time::timeout(timeout, self.inner.write_pending()).await {
            Ok(Ok(_)) => 0,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to flush buffer during shutdown");
                self.inner.buffer.len()
            }
            Err(_) => {
                // A batch already handed to the blocking pool is unconfirmed.
                let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
                error!(in_flight, "Timeout while flushing buffer during shutdown");
                self.inner.buffer.len() + in_flight
            }
        };

        *self.inner.state.write() = CoordinatorState::Closed;
        self.inner.hot.close();
        self.inner.main.close();
        info!(unflushed, "Coordinator closed");
        unflushed
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[CoordinatorState],
    ) -> Result<(), CoordinatorError> {
        let state = *self.inner.state.read();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidState { operation, state })
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        from: &[CoordinatorState],
        to: CoordinatorState,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.inner.state.write();
        if !from.contains(&*state) {
            return Err(CoordinatorError::InvalidState {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }
}

impl Inner {
    /// Drains the buffer into the hot tier, requeueing the batch on failure.
    async fn write_pending(&self) -> Result<usize, CoordinatorError> {
        let _writes = self.hot_writes.lock().await;

        let batch = self.buffer.take_all();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        let batch = Arc::new(batch);
        let hot = Arc::clone(&self.hot);
        let pending = Arc::clone(&batch);
        self.in_flight.store(count, Ordering::SeqCst);
        let written = tokio::task::spawn_blocking(move || hot.bulk_insert(&pending)).await;
        self.in_flight.store(0, Ordering::SeqCst);

        let failure = match written {
            Ok(Ok(())) => {
                debug!(written = count, "Buffered events written to hot store");
                return Ok(count);
            }
            Ok(Err(e)) => CoordinatorError::from(e),
            Err(e) => CoordinatorError::Task(e.to_string()),
        };

        let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| shared.as_ref().clone());
        self.buffer.requeue(batch);
        Err(failure)
    }

    /// Restores main from snapshots, newest first. Caller holds the
    /// maintenance lock.
    async fn recover_locked(&self) -> bool {
        let snapshots = Arc::clone(&self.snapshots);
        let candidates = match run_blocking(move || snapshots.list()).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to list snapshots");
                Vec::new()
            }
        };
        if candidates.is_empty() {
            error!("No snapshots available for recovery");
            return false;
        }

        self.main.close();
        let target = self.main.path().to_path_buf();

        for name in candidates {
            info!(snapshot = %name, "Attempting restore from snapshot");

            let snapshots = Arc::clone(&self.snapshots);
            let snapshot = name.clone();
            let target = target.clone();
            let restored =
                tokio::task::spawn_blocking(move || snapshots.restore(&snapshot, &target))
                    .await
                    .unwrap_or(false);
            if !restored {
                continue;
            }

            let main = Arc::clone(&self.main);
            match run_blocking(move || main.initialize()).await {
                Ok(()) => {
                    info!(snapshot = %name, "Main store recovered from snapshot");
                    return true;
                }
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "Restored snapshot is unusable");
                    self.main.close();
                }
            }
        }

        error!("Failed to restore main store from any snapshot");
        let main = Arc::clone(&self.main);
        if let Err(e) = run_blocking(move || main.initialize()).await {
            error!(error = %e, "Main store could not be reopened");
        }
        false
    }
}

/// Re-arms the debounce timer so the buffer is written after a quiet period.
fn schedule_flush(inner: &Arc<Inner>) {
    let weak = Arc::downgrade(inner);
    inner.buffer.rearm(move || async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if *inner.state.read() == CoordinatorState::Closed {
            return;
        }
        if let Err(e) = inner.write_pending().await {
            warn!(
                error = %e,
                pending = inner.buffer.len(),
                "Failed to write buffered events, will retry"
            );
            schedule_flush(&inner);
        }
    });
}

async fn run_blocking<T, F>(f: F) -> Result<T, CoordinatorError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoordinatorError::Task(e.to_string()))?
        .map_err(CoordinatorError::from)
}
