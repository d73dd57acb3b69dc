//! Staleness of cached prices, as reported by health checks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::prices::{AssetClass, CacheGeneration, ClassView, RefreshCoordinator, RefreshStatus};

/// Result of a staleness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessCheck {
    pub is_stale: bool,
    pub age: Option<Duration>,
    pub threshold: Duration,
}

impl StalenessCheck {
    pub fn stale(age: Duration, threshold: Duration) -> Self {
        Self { is_stale: true, age: Some(age), threshold }
    }

    pub fn fresh(age: Duration, threshold: Duration) -> Self {
        Self { is_stale: false, age: Some(age), threshold }
    }

    pub fn missing(threshold: Duration) -> Self {
        Self { is_stale: true, age: None, threshold }
    }
}

/// Checks how long ago `last_success` was, relative to `now`.
pub fn check_staleness(
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> StalenessCheck {
    match last_success {
        Some(at) => {
            let age = (now - at).to_std().unwrap_or(Duration::ZERO);
            if age > threshold {
                StalenessCheck::stale(age, threshold)
            } else {
                StalenessCheck::fresh(age, threshold)
            }
        }
        None => StalenessCheck::missing(threshold),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Stale,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassHealth {
    pub class: AssetClass,
    pub status: HealthStatus,
    pub snapshots: usize,
    pub generation: CacheGeneration,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Seconds since the last successful refresh (or the seeded data's fetch time).
    pub age_secs: Option<u64>,
    pub threshold_secs: u64,
    pub stale_since: Option<DateTime<Utc>>,
    pub refresh: RefreshStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub generation: CacheGeneration,
    pub classes: Vec<ClassHealth>,
}

/// Health of one class from its cache view and refresh ledger.
pub fn class_health(
    view: &ClassView,
    refresh: RefreshStatus,
    now: DateTime<Utc>,
    threshold: Duration,
) -> ClassHealth {
    let last_success_at = refresh.last_success_at.or_else(|| view.latest_fetch());
    let check = check_staleness(last_success_at, now, threshold);
    let stale_since = view.stale_since();

    let status = if view.is_empty() {
        HealthStatus::Empty
    } else if check.is_stale || stale_since.is_some() {
        HealthStatus::Stale
    } else {
        HealthStatus::Healthy
    };
    log_class_staleness(refresh.class, &check);

    ClassHealth {
        class: refresh.class,
        status,
        snapshots: view.len(),
        generation: view.generation(),
        last_success_at,
        age_secs: check.age.map(|age| age.as_secs()),
        threshold_secs: threshold.as_secs(),
        stale_since,
        refresh,
    }
}

/// Health of every class. The overall status is the worst class status.
pub fn health_report(coordinator: &RefreshCoordinator, threshold: Duration) -> HealthReport {
    let now = coordinator.clock().now();
    let classes: Vec<ClassHealth> = AssetClass::ALL
        .iter()
        .map(|&class| {
            class_health(
                &coordinator.cache().view(class),
                coordinator.status(class),
                now,
                threshold,
            )
        })
        .collect();
    let status = classes
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Empty);

    HealthReport {
        status,
        checked_at: now,
        generation: coordinator.cache().generation(),
        classes,
    }
}

/// Log staleness check results for a class.
pub fn log_class_staleness(class: AssetClass, check: &StalenessCheck) {
    let status = if check.is_stale { "stale" } else { "fresh" };
    let age_str = check
        .age
        .map(crate::duration::format_duration)
        .unwrap_or_else(|| "never".to_string());
    let threshold_str = crate::duration::format_duration(check.threshold);

    if check.is_stale {
        info!(class = %class, age = %age_str, threshold = %threshold_str, status, "class staleness check");
    } else {
        debug!(class = %class, age = %age_str, threshold = %threshold_str, status, "class staleness check");
    }
}
