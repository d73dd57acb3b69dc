//! Per-class refresh cycles: fetch, validate, persist, then publish.
//!
//! A cycle for one class never touches another class. The cache is only swapped after
//! the history store confirmed both the appended points and the latest-value table, so
//! every cached value has a persisted counterpart. Failed cycles keep the previous
//! snapshots and mark them stale.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::cache::ClassView;
use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::parse::{parse_localized_decimal, percent_change, round_percent, round_value};
use super::retry::{RetryError, RetryPolicy};
use super::single_flight::SingleFlight;
use super::{
    AssetClass, AssetKey, AssetSnapshot, CacheGeneration, HistoryPoint, HistoryStore,
    PersistenceError, PriceSource, RawReading, RefreshError, SnapshotCache, UpstreamError,
};
use crate::clock::{Clock, SystemClock};
use crate::duration::deserialize_duration;

fn default_cycle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Time bounds applied to a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTimeouts {
    /// Whole cycle, retries and backoff included.
    #[serde(
        default = "default_cycle_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub cycle: Duration,

    /// One provider request. A fetch that may fall back gets this once per request.
    #[serde(
        default = "default_provider_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub provider_call: Duration,

    /// One history store call.
    #[serde(
        default = "default_store_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "crate::duration::serialize_duration"
    )]
    pub store_call: Duration,
}

impl Default for RefreshTimeouts {
    fn default() -> Self {
        Self {
            cycle: default_cycle_timeout(),
            provider_call: default_provider_timeout(),
            store_call: default_store_timeout(),
        }
    }
}

/// Result of one refresh cycle for one class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    pub class: AssetClass,
    pub succeeded: bool,
    pub snapshots_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<CacheGeneration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RefreshError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RefreshOutcome {
    fn success(
        class: AssetClass,
        snapshots_written: usize,
        generation: CacheGeneration,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            class,
            succeeded: true,
            snapshots_written,
            generation: Some(generation),
            error: None,
            started_at,
            finished_at,
        }
    }

    fn failure(
        error: RefreshError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            class: error.class(),
            succeeded: false,
            snapshots_written: 0,
            generation: None,
            error: Some(error),
            started_at,
            finished_at,
        }
    }
}

/// Refresh history of one class, as reported by `/health` and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStatus {
    pub class: AssetClass,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RefreshOutcome>,
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Mean wall time of successful cycles.
    pub average_success_ms: Option<u64>,
    pub circuit: CircuitState,
}

#[derive(Debug, Default)]
struct Ledger {
    last_attempt_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_outcome: Option<RefreshOutcome>,
    consecutive_failures: u32,
    total_attempts: u64,
    total_successes: u64,
    total_failures: u64,
    success_time: Duration,
}

impl Ledger {
    fn record(&mut self, outcome: &RefreshOutcome, elapsed: Duration) {
        self.last_attempt_at = Some(outcome.started_at);
        self.total_attempts += 1;
        if outcome.succeeded {
            self.last_success_at = Some(outcome.finished_at);
            self.consecutive_failures = 0;
            self.total_successes += 1;
            self.success_time += elapsed;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.total_failures += 1;
        }
        self.last_outcome = Some(outcome.clone());
    }

    fn average_success_ms(&self) -> Option<u64> {
        if self.total_successes == 0 {
            return None;
        }
        let total_ms = self.success_time.as_millis() / u128::from(self.total_successes);
        Some(u64::try_from(total_ms).unwrap_or(u64::MAX))
    }
}

type LedgerMap = Arc<Mutex<HashMap<AssetClass, Ledger>>>;

fn lock_ledger(ledger: &LedgerMap) -> MutexGuard<'_, HashMap<AssetClass, Ledger>> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sole writer of the snapshot cache and the history store.
pub struct RefreshCoordinator {
    source: Arc<dyn PriceSource>,
    store: Arc<dyn HistoryStore>,
    cache: Arc<SnapshotCache>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    timeouts: RefreshTimeouts,
    breaker: Arc<CircuitBreaker>,
    ledger: LedgerMap,
    flights: SingleFlight<AssetClass, RefreshOutcome>,
}

impl RefreshCoordinator {
    pub fn new(
        source: Arc<dyn PriceSource>,
        store: Arc<dyn HistoryStore>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            source,
            store,
            cache,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            timeouts: RefreshTimeouts::default(),
            breaker: Arc::new(CircuitBreaker::default()),
            ledger: Arc::new(Mutex::new(HashMap::new())),
            flights: SingleFlight::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: RefreshTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(config));
        self
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Runs one refresh cycle for `class`, or joins the one already running.
    pub async fn refresh(&self, class: AssetClass) -> RefreshOutcome {
        let cycle = Cycle {
            class,
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            retry: self.retry.clone(),
            timeouts: self.timeouts,
            breaker: Arc::clone(&self.breaker),
            ledger: Arc::clone(&self.ledger),
        };

        if self.flights.is_in_flight(&class) {
            debug!(class = %class, "joining in-flight refresh");
        }
        match self.flights.run(class, move || cycle.run()).await {
            Ok(outcome) => outcome,
            Err(aborted) => {
                error!(class = %class, error = %aborted, "refresh task aborted");
                let now = self.clock.now();
                RefreshOutcome::failure(
                    RefreshError::UpstreamUnavailable {
                        class,
                        attempts: 0,
                        message: aborted.to_string(),
                    },
                    now,
                    now,
                )
            }
        }
    }

    /// Seeds the cache from the store's latest-value tables.
    ///
    /// A class whose table cannot be read starts empty; a class that already has
    /// snapshots is left alone. Returns the number of snapshots seeded.
    pub async fn warm_start(&self) -> usize {
        let mut seeded = 0;
        for class in AssetClass::ALL {
            if !self.cache.view(class).is_empty() {
                continue;
            }
            let limit = self.timeouts.store_call;
            match bounded(limit, self.store.load_latest(class)).await {
                Ok(snapshots) if snapshots.is_empty() => {
                    debug!(class = %class, "no stored snapshots to seed");
                }
                Ok(snapshots) => {
                    let snapshots: Vec<AssetSnapshot> = snapshots
                        .into_iter()
                        .map(|mut s| {
                            s.source_succeeded = false;
                            s
                        })
                        .collect();
                    let count = snapshots.len();
                    let generation = self.cache.seed(class, snapshots);
                    info!(class = %class, count, generation = %generation, "cache seeded from store");
                    seeded += count;
                }
                Err(err) => {
                    warn!(class = %class, error = %err, "could not load stored snapshots, starting empty");
                }
            }
        }
        seeded
    }

    pub fn status(&self, class: AssetClass) -> RefreshStatus {
        let ledger = lock_ledger(&self.ledger);
        let entry = ledger.get(&class);
        RefreshStatus {
            class,
            last_attempt_at: entry.and_then(|l| l.last_attempt_at),
            last_success_at: entry.and_then(|l| l.last_success_at),
            last_outcome: entry.and_then(|l| l.last_outcome.clone()),
            consecutive_failures: entry.map_or(0, |l| l.consecutive_failures),
            total_attempts: entry.map_or(0, |l| l.total_attempts),
            total_successes: entry.map_or(0, |l| l.total_successes),
            total_failures: entry.map_or(0, |l| l.total_failures),
            average_success_ms: entry.and_then(Ledger::average_success_ms),
            circuit: self.breaker.state(class),
        }
    }

    pub fn statuses(&self) -> Vec<RefreshStatus> {
        AssetClass::ALL.iter().map(|&class| self.status(class)).collect()
    }
}

/// Everything one cycle needs, owned so the cycle can run on its own task.
struct Cycle {
    class: AssetClass,
    source: Arc<dyn PriceSource>,
    store: Arc<dyn HistoryStore>,
    cache: Arc<SnapshotCache>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    timeouts: RefreshTimeouts,
    breaker: Arc<CircuitBreaker>,
    ledger: LedgerMap,
}

impl Cycle {
    async fn run(self) -> RefreshOutcome {
        let class = self.class;
        let started_at = self.clock.now();
        let started = tokio::time::Instant::now();
        debug!(class = %class, source = self.source.name(), "refresh started");

        let result = match tokio::time::timeout(self.timeouts.cycle, self.execute(started_at)).await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshError::RefreshTimeout {
                class,
                timeout_secs: self.timeouts.cycle.as_secs(),
            }),
        };

        let finished_at = self.clock.now().max(started_at);
        let elapsed = started.elapsed();
        let outcome = match result {
            Ok((written, generation)) => {
                self.breaker.record_success(class);
                info!(
                    class = %class,
                    written,
                    generation = %generation,
                    duration_ms = elapsed.as_millis() as u64,
                    "refresh committed"
                );
                RefreshOutcome::success(class, written, generation, started_at, finished_at)
            }
            Err(error) => {
                if error.is_upstream_fault() {
                    self.breaker.record_failure(class, finished_at);
                } else {
                    // The provider answered; its data or the store was at fault.
                    self.breaker.record_success(class);
                }
                self.cache.mark_stale(class, finished_at);
                warn!(
                    class = %class,
                    kind = error.kind(),
                    error = %error,
                    duration_ms = elapsed.as_millis() as u64,
                    "refresh failed, keeping last good snapshots"
                );
                RefreshOutcome::failure(error, started_at, finished_at)
            }
        };

        lock_ledger(&self.ledger)
            .entry(class)
            .or_default()
            .record(&outcome, elapsed);
        outcome
    }

    async fn execute(
        &self,
        started_at: DateTime<Utc>,
    ) -> Result<(usize, CacheGeneration), RefreshError> {
        let class = self.class;
        if !self.breaker.allow(class, started_at) {
            return Err(RefreshError::UpstreamUnavailable {
                class,
                attempts: 0,
                message: "circuit open".to_string(),
            });
        }

        let readings = self.fetch().await?;
        let previous = self.cache.view(class);
        let snapshots = build_snapshots(class, readings, &previous, self.clock.now())?;
        let points: Vec<HistoryPoint> = snapshots
            .iter()
            .map(|s| HistoryPoint {
                key: s.key.clone(),
                value: s.value,
                recorded_at: s.fetched_at,
            })
            .collect();

        self.persist(&points, &snapshots).await?;
        let generation = self.cache.swap(class, snapshots);
        Ok((points.len(), generation))
    }

    async fn fetch(&self) -> Result<Vec<RawReading>, RefreshError> {
        let class = self.class;
        let source = &self.source;
        let limit = self
            .timeouts
            .provider_call
            .saturating_mul(source.requests_per_fetch().max(1));
        let label = format!("{} fetch {class}", source.name());

        self.retry
            .run(
                &label,
                || async move {
                    match tokio::time::timeout(limit, source.fetch(class)).await {
                        Ok(result) => result,
                        Err(_) => Err(UpstreamError::Timeout {
                            provider: source.name().to_string(),
                            secs: limit.as_secs(),
                        }),
                    }
                },
                UpstreamError::is_transient,
            )
            .await
            .map_err(|RetryError { error, attempts }| match error {
                UpstreamError::Decode { .. } | UpstreamError::MissingData { .. } => {
                    RefreshError::MalformedUpstreamData {
                        class,
                        message: error.to_string(),
                    }
                }
                _ => RefreshError::UpstreamUnavailable {
                    class,
                    attempts,
                    message: error.to_string(),
                },
            })
    }

    async fn persist(
        &self,
        points: &[HistoryPoint],
        snapshots: &[AssetSnapshot],
    ) -> Result<(), RefreshError> {
        let class = self.class;
        let store = &self.store;
        let limit = self.timeouts.store_call;
        let failure = |what: &str, RetryError { error, attempts }: RetryError<PersistenceError>| {
            RefreshError::PersistenceFailure {
                class,
                message: format!("{what} failed after {attempts} attempt(s): {error}"),
            }
        };

        self.retry
            .run(
                "history append",
                || bounded(limit, store.append(points)),
                PersistenceError::is_transient,
            )
            .await
            .map_err(|e| failure("history append", e))?;

        self.retry
            .run(
                "latest write",
                || bounded(limit, store.put_latest(class, snapshots)),
                PersistenceError::is_transient,
            )
            .await
            .map_err(|e| failure("latest write", e))?;

        Ok(())
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, PersistenceError>>,
) -> Result<T, PersistenceError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(PersistenceError::Timeout {
            secs: limit.as_secs(),
        }))
}

/// Validates a provider batch and turns it into the next snapshots of `class`.
///
/// Non-numeric and non-positive readings are dropped, as are repeats of a code that
/// was already accepted. Fails when nothing survives.
fn build_snapshots(
    class: AssetClass,
    readings: Vec<RawReading>,
    previous: &ClassView,
    now: DateTime<Utc>,
) -> Result<Vec<AssetSnapshot>, RefreshError> {
    let received = readings.len();
    let mut accepted = HashSet::new();
    let mut snapshots = Vec::with_capacity(received);

    for reading in readings {
        let key = AssetKey::new(class, &reading.code);
        if key.code.is_empty() {
            warn!(class = %class, "dropping reading without a code");
            continue;
        }
        let value = match parse_localized_decimal(&reading.raw_value) {
            Some(value) if value > Decimal::ZERO => round_value(class, value),
            Some(value) => {
                warn!(key = %key, value = %value, "dropping non-positive reading");
                continue;
            }
            None => {
                warn!(key = %key, raw = %reading.raw_value, "dropping non-numeric reading");
                continue;
            }
        };
        if !accepted.insert(key.code.clone()) {
            warn!(key = %key, "dropping duplicate reading");
            continue;
        }

        let prior = previous.get(&key.code);
        let change_percent = prior.map_or(Decimal::ZERO, |p| percent_change(p.value, value));
        let fetched_at = prior.map_or(now, |p| now.max(p.fetched_at));
        let reported_change_percent = reading
            .raw_change
            .as_deref()
            .and_then(parse_localized_decimal)
            .map(round_percent);
        let name = match reading.name.trim() {
            "" => key.code.clone(),
            name => name.to_string(),
        };

        snapshots.push(AssetSnapshot {
            key,
            name,
            value,
            change_percent,
            fetched_at,
            source_succeeded: true,
            stale_since: None,
            reported_change_percent,
        });
    }

    if snapshots.is_empty() {
        let message = if received == 0 {
            "provider returned no readings".to_string()
        } else {
            format!("all {received} readings were rejected")
        };
        return Err(RefreshError::MalformedUpstreamData { class, message });
    }
    if snapshots.len() < received {
        debug!(class = %class, received, accepted = snapshots.len(), "partial batch accepted");
    }
    Ok(snapshots)
}
