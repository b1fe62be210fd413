//! Periodic maintenance jobs.
//!
//! Each job runs on its own fixed interval after an initial delay. A job run
//! is spawned as its own task and guarded by a single-flight flag: if the
//! previous run has not finished when the next tick arrives, that tick is
//! skipped rather than queued. All jobs stop when the shutdown signal fires;
//! a run already in progress is allowed to finish.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyrecorder_core::coordinator::Coordinator;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Delay before the first sync.
const SYNC_INITIAL_DELAY: Duration = Duration::from_secs(60);

/// Delay before the first integrity check.
const INTEGRITY_INITIAL_DELAY: Duration = Duration::from_secs(10 * 60);

/// Delay before the first snapshot.
const SNAPSHOT_INITIAL_DELAY: Duration = Duration::from_secs(15 * 60);

/// When and how often a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchedule {
    pub name: &'static str,
    pub initial_delay: Duration,
    pub period: Duration,
}

impl JobSchedule {
    /// A schedule whose initial delay never exceeds its period.
    #[must_use]
    pub fn new(name: &'static str, initial_delay: Duration, period: Duration) -> Self {
        Self {
            name,
            initial_delay: initial_delay.min(period),
            period,
        }
    }
}

/// Allows at most one holder at a time without blocking.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    /// Claims the flag, or returns `None` if it is already held.
    pub fn try_begin(self: &Arc<Self>) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                flight: Arc::clone(self),
            })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the [`SingleFlight`] flag when dropped.
#[derive(Debug)]
pub struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

/// Runs `job` on `schedule` until `shutdown` fires.
pub fn spawn_periodic<F, Fut>(
    schedule: JobSchedule,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let flight = Arc::new(SingleFlight::default());
        let mut interval =
            tokio::time::interval_at(Instant::now() + schedule.initial_delay, schedule.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(
            job = schedule.name,
            initial_delay_secs = schedule.initial_delay.as_secs(),
            period_secs = schedule.period.as_secs(),
            "Maintenance job scheduled"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let Some(guard) = flight.try_begin() else {
                warn!(job = schedule.name, "Previous run still in progress, skipping");
                continue;
            };

            let run = job();
            tokio::spawn(async move {
                let _guard = guard;
                run.await;
            });
        }

        debug!(job = schedule.name, "Maintenance job stopped");
    })
}

/// Spawns the sync, integrity and snapshot jobs for `coordinator`.
pub fn spawn_maintenance(
    coordinator: &Coordinator,
    config: &Config,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let sync = {
        let coordinator = coordinator.clone();
        spawn_periodic(
            JobSchedule::new("sync", SYNC_INITIAL_DELAY, config.sync_interval),
            shutdown.clone(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    if let Err(e) = coordinator.sync().await {
                        error!(error = %e, "Scheduled sync failed, will retry next interval");
                    }
                }
            },
        )
    };

    let integrity = {
        let coordinator = coordinator.clone();
        let retention = config.retention;
        spawn_periodic(
            JobSchedule::new(
                "integrity",
                INTEGRITY_INITIAL_DELAY,
                config.integrity_check_interval,
            ),
            shutdown.clone(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    if !coordinator.integrity_check().await {
                        warn!("Main store failed its integrity check");
                    }
                    coordinator.apply_retention(retention).await;
                }
            },
        )
    };

    let snapshot = {
        let coordinator = coordinator.clone();
        let max_snapshots = config.max_snapshots;
        spawn_periodic(
            JobSchedule::new("snapshot", SNAPSHOT_INITIAL_DELAY, config.snapshot_interval),
            shutdown.clone(),
            move || {
                let coordinator = coordinator.clone();
                async move {
                    if let Err(e) = coordinator.create_snapshot().await {
                        warn!(error = %e, "Scheduled snapshot failed");
                    }
                    if let Err(e) = coordinator.prune_snapshots(max_snapshots).await {
                        warn!(error = %e, "Snapshot pruning failed");
                    }
                }
            },
        )
    };

    info!(
        sync_interval_secs = config.sync_interval.as_secs(),
        integrity_interval_secs = config.integrity_check_interval.as_secs(),
        snapshot_interval_secs = config.snapshot_interval.as_secs(),
        "Maintenance jobs started"
    );
    vec![sync, integrity, snapshot]
}
