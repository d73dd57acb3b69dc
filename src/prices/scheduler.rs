//! Periodic refresh loops, one per asset class.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AssetClass, RefreshCoordinator, RefreshOutcome};

/// When the loops fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    /// Upper bound of the random delay added to each wait.
    pub jitter: Duration,
    /// Refresh once right away instead of waiting a full interval first.
    pub run_immediately: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            jitter: Duration::ZERO,
            run_immediately: true,
        }
    }
}

/// Drives the coordinator on a fixed cadence and on demand. Holds no price state.
#[derive(Clone)]
pub struct Scheduler {
    coordinator: Arc<RefreshCoordinator>,
    schedule: Schedule,
}

impl Scheduler {
    pub fn new(coordinator: Arc<RefreshCoordinator>, schedule: Schedule) -> Self {
        Self {
            coordinator,
            schedule,
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Refreshes every class concurrently. Outcomes follow [`AssetClass::ALL`].
    pub async fn trigger_all(&self) -> Vec<RefreshOutcome> {
        info!("manual refresh of all classes requested");
        join_all(
            AssetClass::ALL
                .iter()
                .map(|&class| self.coordinator.refresh(class)),
        )
        .await
    }

    /// Starts one loop per class. The loops run until [`SchedulerHandle::shutdown`]
    /// is called or the handle is dropped.
    pub fn spawn(&self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = AssetClass::ALL
            .iter()
            .map(|&class| {
                tokio::spawn(run_class_loop(
                    Arc::clone(&self.coordinator),
                    class,
                    self.schedule,
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        info!(
            interval_secs = self.schedule.interval.as_secs(),
            jitter_secs = self.schedule.jitter.as_secs(),
            "refresh scheduler started"
        );
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops the loops and waits for them. A refresh already running is allowed to
    /// finish (or hit its cycle timeout) first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "scheduler loop ended abnormally");
            }
        }
        info!("refresh scheduler stopped");
    }
}

async fn run_class_loop(
    coordinator: Arc<RefreshCoordinator>,
    class: AssetClass,
    schedule: Schedule,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = if schedule.run_immediately {
        Duration::ZERO
    } else {
        compute_next_delay(schedule.interval, schedule.jitter)
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }

        let outcome = coordinator.refresh(class).await;
        delay = compute_next_delay(schedule.interval, schedule.jitter);
        debug!(
            class = %class,
            succeeded = outcome.succeeded,
            next_in_secs = delay.as_secs(),
            "scheduled refresh finished"
        );

        if *shutdown.borrow() {
            break;
        }
    }
    debug!(class = %class, "refresh loop stopped");
}

/// `interval` plus a random extra wait in `[0, jitter]`.
pub fn compute_next_delay(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let extra = rand::thread_rng().gen_range(0..=jitter_ms);
    interval.saturating_add(Duration::from_millis(extra))
}
