use std::collections::HashMap;

use super::{AssetClass, AssetKey, AssetSnapshot, HistoryPoint, HistoryRange, PersistenceError};

/// Durable record of every accepted value plus the latest value per class.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends points. Points for a key must arrive in `recorded_at` order.
    /// A point whose key and `recorded_at` are already stored is skipped.
    async fn append(&self, points: &[HistoryPoint]) -> Result<(), PersistenceError>;

    /// Points for `key` within `range`, ascending by `recorded_at`.
    async fn query(
        &self,
        key: &AssetKey,
        range: &HistoryRange,
    ) -> Result<Vec<HistoryPoint>, PersistenceError>;

    /// Latest snapshots of a class as last written by [`HistoryStore::put_latest`].
    async fn load_latest(&self, class: AssetClass) -> Result<Vec<AssetSnapshot>, PersistenceError>;

    /// Replaces the latest-value table of a class.
    async fn put_latest(
        &self,
        class: AssetClass,
        snapshots: &[AssetSnapshot],
    ) -> Result<(), PersistenceError>;
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    history: tokio::sync::Mutex<HashMap<AssetKey, Vec<HistoryPoint>>>,
    latest: tokio::sync::Mutex<HashMap<AssetClass, Vec<AssetSnapshot>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of points across every key.
    pub async fn len(&self) -> usize {
        self.history.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, points: &[HistoryPoint]) -> Result<(), PersistenceError> {
        if points.is_empty() {
            return Ok(());
        }
        let mut history = self.history.lock().await;
        for point in points {
            let series = history.entry(point.key.clone()).or_default();
            if series.iter().any(|p| p.recorded_at == point.recorded_at) {
                continue;
            }
            series.push(point.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        key: &AssetKey,
        range: &HistoryRange,
    ) -> Result<Vec<HistoryPoint>, PersistenceError> {
        let history = self.history.lock().await;
        let points = history.get(key).cloned().unwrap_or_default();
        Ok(range.apply(points))
    }

    async fn load_latest(&self, class: AssetClass) -> Result<Vec<AssetSnapshot>, PersistenceError> {
        let latest = self.latest.lock().await;
        Ok(latest.get(&class).cloned().unwrap_or_default())
    }

    async fn put_latest(
        &self,
        class: AssetClass,
        snapshots: &[AssetSnapshot],
    ) -> Result<(), PersistenceError> {
        let mut latest = self.latest.lock().await;
        latest.insert(class, snapshots.to_vec());
        Ok(())
    }
}
