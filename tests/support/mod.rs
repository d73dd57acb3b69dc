use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kurabak::clock::ManualClock;
use kurabak::prices::{
    AssetClass, AssetKey, AssetSnapshot, HistoryPoint, HistoryRange, HistoryStore,
    MemoryHistoryStore, PersistenceError, PriceSource, RawReading, RefreshCoordinator,
    RefreshTimeouts, RetryPolicy, SnapshotCache, UpstreamError,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

/// What the scripted source does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Vec<RawReading>),
    Slow(Duration, Vec<RawReading>),
    Fail(UpstreamError),
    /// Never answers; only the per-call timeout ends it.
    Hang,
}

/// Price source that plays back a queue of steps per class. The last step repeats
/// once the queue is down to one entry.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<AssetClass, VecDeque<Step>>>,
    calls: Mutex<HashMap<AssetClass, u32>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, class: AssetClass, steps: Vec<Step>) -> Self {
        self.script(class, steps);
        self
    }

    /// Replaces the remaining steps of `class`.
    pub fn script(&self, class: AssetClass, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(class, steps.into_iter().collect());
    }

    pub fn calls(&self, class: AssetClass) -> u32 {
        self.calls.lock().unwrap().get(&class).copied().unwrap_or(0)
    }

    fn next_step(&self, class: AssetClass) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.get_mut(&class)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl PriceSource for ScriptedSource {
    async fn fetch(&self, class: AssetClass) -> Result<Vec<RawReading>, UpstreamError> {
        *self.calls.lock().unwrap().entry(class).or_insert(0) += 1;
        match self.next_step(class) {
            Some(Step::Ok(readings)) => Ok(readings),
            Some(Step::Slow(delay, readings)) => {
                tokio::time::sleep(delay).await;
                Ok(readings)
            }
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => std::future::pending().await,
            None => Err(UpstreamError::MissingData {
                provider: "scripted".to_string(),
                class,
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn currency(readings: &[(&str, &str)]) -> Vec<RawReading> {
    readings
        .iter()
        .map(|(code, value)| RawReading::new(*code, *code, *value))
        .collect()
}

pub fn gram_gold(value: &str) -> Vec<RawReading> {
    vec![RawReading::new("Gram Altın", "Gram Altın", value)]
}

pub fn silver(value: &str) -> Vec<RawReading> {
    vec![RawReading::new("Gümüş", "Gümüş", value)]
}

pub fn server_error() -> UpstreamError {
    UpstreamError::Status {
        provider: "scripted".to_string(),
        status: 503,
    }
}

/// Memory store that can be told to fail, and that records what the cache showed
/// for each appended key at the moment of the append.
pub struct TestStore {
    inner: MemoryHistoryStore,
    cache: Mutex<Option<Arc<SnapshotCache>>>,
    pub fail_append: AtomicBool,
    pub fail_latest: AtomicBool,
    pub fail_load: AtomicBool,
    appends: AtomicU32,
    seen_at_append: Mutex<Vec<(HistoryPoint, Option<AssetSnapshot>)>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryHistoryStore::new(),
            cache: Mutex::new(None),
            fail_append: AtomicBool::new(false),
            fail_latest: AtomicBool::new(false),
            fail_load: AtomicBool::new(false),
            appends: AtomicU32::new(0),
            seen_at_append: Mutex::new(Vec::new()),
        }
    }

    pub fn observe(&self, cache: Arc<SnapshotCache>) {
        *self.cache.lock().unwrap() = Some(cache);
    }

    pub fn appends(&self) -> u32 {
        self.appends.load(Ordering::SeqCst)
    }

    pub fn seen_at_append(&self) -> Vec<(HistoryPoint, Option<AssetSnapshot>)> {
        self.seen_at_append.lock().unwrap().clone()
    }

    pub async fn points(&self, key: &AssetKey) -> Vec<HistoryPoint> {
        self.inner.query(key, &HistoryRange::all()).await.unwrap()
    }
}

#[async_trait]
impl HistoryStore for TestStore {
    async fn append(&self, points: &[HistoryPoint]) -> Result<(), PersistenceError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io("disk full".to_string()));
        }
        if let Some(cache) = self.cache.lock().unwrap().as_ref() {
            let mut seen = self.seen_at_append.lock().unwrap();
            for point in points {
                seen.push((point.clone(), cache.get(&point.key)));
            }
        }
        self.inner.append(points).await
    }

    async fn query(
        &self,
        key: &AssetKey,
        range: &HistoryRange,
    ) -> Result<Vec<HistoryPoint>, PersistenceError> {
        self.inner.query(key, range).await
    }

    async fn load_latest(&self, class: AssetClass) -> Result<Vec<AssetSnapshot>, PersistenceError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(PersistenceError::Serialization("corrupt latest table".to_string()));
        }
        self.inner.load_latest(class).await
    }

    async fn put_latest(
        &self,
        class: AssetClass,
        snapshots: &[AssetSnapshot],
    ) -> Result<(), PersistenceError> {
        if self.fail_latest.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io("read-only file system".to_string()));
        }
        self.inner.put_latest(class, snapshots).await
    }
}

pub fn test_timeouts() -> RefreshTimeouts {
    RefreshTimeouts {
        cycle: Duration::from_secs(60),
        provider_call: Duration::from_secs(1),
        store_call: Duration::from_secs(1),
    }
}

/// Coordinator with immediate retries and a manual clock.
pub fn coordinator(
    source: Arc<ScriptedSource>,
    store: Arc<TestStore>,
    clock: Arc<ManualClock>,
) -> RefreshCoordinator {
    let cache = Arc::new(SnapshotCache::new());
    store.observe(Arc::clone(&cache));
    RefreshCoordinator::new(source, store, cache)
        .with_clock(clock)
        .with_retry_policy(RetryPolicy::immediate(3))
        .with_timeouts(test_timeouts())
}
