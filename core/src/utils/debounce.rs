//! Debounce buffer for coalescing bursts of records into one write.
//!
//! Items pushed into a [`Debouncer`] accumulate in memory. Every push re-arms
//! a single quiet-period timer; when the timer expires without being re-armed,
//! the caller-supplied callback runs and is expected to drain the buffer with
//! [`Debouncer::take_all`].
//!
//! # Architecture
//!
//! At most one timer task exists per debouncer:
//!
//! 1. [`rearm`](Debouncer::rearm) aborts the current timer task, if any
//! 2. A new timer task sleeps for the interval
//! 3. On expiry the callback is spawned as its own task, so a later re-arm
//!    can abort a pending timer but never a write already in progress
//!
//! Timers run on the runtime bound with [`Debouncer::bind_runtime`], which
//! lets producers outside any runtime push and re-arm. Without a bound
//! runtime the caller's current runtime is used.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keyrecorder_core::utils::debounce::Debouncer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let buffer = Arc::new(Debouncer::new(Duration::from_millis(100)));
//!
//!     for i in 0..3 {
//!         buffer.push(i);
//!         let drain = Arc::clone(&buffer);
//!         buffer.rearm(move || async move {
//!             let batch = drain.take_all();
//!             assert_eq!(batch, vec![0, 1, 2]);
//!         });
//!     }
//!
//!     tokio::time::sleep(Duration::from_millis(200)).await;
//!     assert!(buffer.is_empty());
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Default quiet period in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 2000;

/// An in-memory buffer with a resettable quiet-period timer.
pub struct Debouncer<T> {
    interval: Duration,
    queue: Mutex<Vec<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    runtime: Mutex<Option<Handle>>,
}

impl<T> Debouncer<T> {
    /// Creates an empty debouncer with the given quiet period.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            queue: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    /// Creates a debouncer using [`DEFAULT_DEBOUNCE_MS`].
    #[must_use]
    pub fn with_default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DEBOUNCE_MS))
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs future timers on `runtime`, regardless of the calling thread.
    pub fn bind_runtime(&self, runtime: Handle) {
        *self.runtime.lock() = Some(runtime);
    }

    /// Appends an item to the buffer.
    pub fn push(&self, item: T) {
        self.queue.lock().push(item);
    }

    /// Removes and returns every buffered item in insertion order.
    pub fn take_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Puts items back at the front of the buffer, ahead of anything pushed
    /// since they were taken.
    pub fn requeue(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        let newer = std::mem::replace(&mut *queue, items);
        queue.extend(newer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Restarts the quiet-period timer.
    ///
    /// Any pending timer is aborted and `on_quiet` replaces its callback.
    /// Returns `false` if there is no runtime to run the timer on; the
    /// buffer then keeps its items until drained explicitly.
    pub fn rearm<F, Fut>(&self, on_quiet: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self
            .runtime
            .lock()
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!("No runtime available, debounce timer not armed");
            return false;
        };

        let interval = self.interval;
        let mut timer = self.timer.lock();

        if let Some(previous) = timer.take() {
            previous.abort();
            trace!("Debounce timer reset");
        }

        let spawner = runtime.clone();
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            trace!(interval_ms = interval.as_millis() as u64, "Debounce interval elapsed");
            spawner.spawn(on_quiet());
        }));
        true
    }

    /// Aborts the pending timer. Returns `true` if one was still waiting.
    pub fn cancel(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Returns `true` while a timer is waiting to fire.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}
