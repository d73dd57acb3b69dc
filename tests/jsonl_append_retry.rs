use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use kurabak::clock::ManualClock;
use kurabak::prices::{
    AssetClass, AssetKey, AssetSnapshot, HistoryPoint, HistoryRange, HistoryStore,
    JsonlHistoryStore, PersistenceError, RefreshCoordinator, RefreshTimeouts, RetryPolicy,
    SnapshotCache,
};
use rust_decimal_macros::dec;

mod support;
use support::{currency, t0, ScriptedSource, Step};

/// JSONL store whose next append writes its points and then fails or stalls.
struct FlakyJsonlStore {
    inner: JsonlHistoryStore,
    fail_after_write: AtomicBool,
    stall_after_write: AtomicBool,
    appends: AtomicU32,
}

impl FlakyJsonlStore {
    fn new(dir: &std::path::Path) -> Self {
        Self {
            inner: JsonlHistoryStore::new(dir),
            fail_after_write: AtomicBool::new(false),
            stall_after_write: AtomicBool::new(false),
            appends: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl HistoryStore for FlakyJsonlStore {
    async fn append(&self, points: &[HistoryPoint]) -> Result<(), PersistenceError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.inner.append(points).await?;
        if self.fail_after_write.swap(false, Ordering::SeqCst) {
            return Err(PersistenceError::Io("fsync failed".to_string()));
        }
        if self.stall_after_write.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn query(
        &self,
        key: &AssetKey,
        range: &HistoryRange,
    ) -> Result<Vec<HistoryPoint>, PersistenceError> {
        self.inner.query(key, range).await
    }

    async fn load_latest(&self, class: AssetClass) -> Result<Vec<AssetSnapshot>, PersistenceError> {
        self.inner.load_latest(class).await
    }

    async fn put_latest(
        &self,
        class: AssetClass,
        snapshots: &[AssetSnapshot],
    ) -> Result<(), PersistenceError> {
        self.inner.put_latest(class, snapshots).await
    }
}

fn coordinator(store: Arc<FlakyJsonlStore>) -> RefreshCoordinator {
    let source = Arc::new(ScriptedSource::new().with(
        AssetClass::Currency,
        vec![Step::Ok(currency(&[("USD", "32,50"), ("EUR", "35,10")]))],
    ));
    RefreshCoordinator::new(source, store, Arc::new(SnapshotCache::new()))
        .with_clock(Arc::new(ManualClock::new(t0())))
        .with_retry_policy(RetryPolicy::immediate(3))
        .with_timeouts(RefreshTimeouts {
            cycle: Duration::from_secs(30),
            provider_call: Duration::from_secs(1),
            store_call: Duration::from_millis(500),
        })
}

#[tokio::test]
async fn append_error_after_write_is_retried_without_duplicates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FlakyJsonlStore::new(dir.path()));
    store.fail_after_write.store(true, Ordering::SeqCst);
    let coordinator = coordinator(Arc::clone(&store));

    let outcome = coordinator.refresh(AssetClass::Currency).await;
    assert!(outcome.succeeded, "{:?}", outcome.error);
    assert_eq!(store.appends.load(Ordering::SeqCst), 2);

    let usd = store
        .query(&AssetKey::currency("USD"), &HistoryRange::all())
        .await?;
    assert_eq!(usd.len(), 1);
    assert_eq!(usd[0].value, dec!(32.50));
    let eur = store
        .query(&AssetKey::currency("EUR"), &HistoryRange::all())
        .await?;
    assert_eq!(eur.len(), 1);
    Ok(())
}

#[tokio::test]
async fn append_stalled_after_write_is_retried_without_duplicates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FlakyJsonlStore::new(dir.path()));
    store.stall_after_write.store(true, Ordering::SeqCst);
    let coordinator = coordinator(Arc::clone(&store));

    let outcome = coordinator.refresh(AssetClass::Currency).await;
    assert!(outcome.succeeded, "{:?}", outcome.error);
    assert_eq!(store.appends.load(Ordering::SeqCst), 2);

    let usd = store
        .query(&AssetKey::currency("USD"), &HistoryRange::all())
        .await?;
    assert_eq!(usd.len(), 1);

    let file = dir
        .path()
        .join("history")
        .join("currency")
        .join("USD")
        .join("2024.jsonl");
    assert_eq!(std::fs::read_to_string(file)?.lines().count(), 1);
    Ok(())
}
