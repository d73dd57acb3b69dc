//! In-memory snapshot cache with copy-on-write swaps per asset class.
//!
//! Each class is held as an immutable [`ClassView`] behind an `Arc`. Writers build a
//! complete new view and replace the pointer in one step; readers clone the pointer and
//! then work on data nobody will mutate. A reader therefore sees a class either entirely
//! before or entirely after a refresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{AssetClass, AssetKey, AssetSnapshot, CacheGeneration};

/// Immutable set of snapshots for one class as published by a single swap.
#[derive(Debug, Clone, Default)]
pub struct ClassView {
    snapshots: Vec<AssetSnapshot>,
    index: HashMap<String, usize>,
    generation: CacheGeneration,
    published_at: Option<DateTime<Utc>>,
}

impl ClassView {
    fn new(
        snapshots: Vec<AssetSnapshot>,
        generation: CacheGeneration,
        published_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut index = HashMap::with_capacity(snapshots.len());
        for (i, snapshot) in snapshots.iter().enumerate() {
            index.entry(snapshot.key.code.clone()).or_insert(i);
        }
        Self {
            snapshots,
            index,
            generation,
            published_at,
        }
    }

    pub fn get(&self, code: &str) -> Option<&AssetSnapshot> {
        self.index.get(code).map(|&i| &self.snapshots[i])
    }

    pub fn snapshots(&self) -> &[AssetSnapshot] {
        &self.snapshots
    }

    pub fn generation(&self) -> CacheGeneration {
        self.generation
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Newest `fetched_at` among the class's snapshots.
    pub fn latest_fetch(&self) -> Option<DateTime<Utc>> {
        self.snapshots.iter().map(|s| s.fetched_at).max()
    }

    /// Earliest staleness marker in the class, if any snapshot carries one.
    pub fn stale_since(&self) -> Option<DateTime<Utc>> {
        self.snapshots.iter().filter_map(|s| s.stale_since).min()
    }
}

struct ClassSlot {
    class: AssetClass,
    current: RwLock<Arc<ClassView>>,
}

/// Latest known value per asset, shared by every reader and the refresh coordinator.
pub struct SnapshotCache {
    slots: Vec<ClassSlot>,
    generation: AtomicU64,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            slots: AssetClass::ALL
                .iter()
                .map(|&class| ClassSlot {
                    class,
                    current: RwLock::new(Arc::new(ClassView::default())),
                })
                .collect(),
            generation: AtomicU64::new(0),
        }
    }

    fn slot(&self, class: AssetClass) -> &ClassSlot {
        self.slots
            .iter()
            .find(|slot| slot.class == class)
            .unwrap_or_else(|| unreachable!("cache has a slot for every asset class"))
    }

    /// Current immutable view of a class.
    pub fn view(&self, class: AssetClass) -> Arc<ClassView> {
        let guard = self
            .slot(class)
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn get(&self, key: &AssetKey) -> Option<AssetSnapshot> {
        let view = self.view(key.class);
        let found = view.get(&key.code).cloned();
        if found.is_none() {
            debug!(key = %key, "snapshot cache miss");
        }
        found
    }

    pub fn get_all(&self, class: AssetClass) -> Vec<AssetSnapshot> {
        self.view(class).snapshots().to_vec()
    }

    pub fn generation(&self) -> CacheGeneration {
        CacheGeneration(self.generation.load(Ordering::SeqCst))
    }

    /// Replaces every snapshot of `class` with `snapshots` in one step.
    pub fn swap(&self, class: AssetClass, snapshots: Vec<AssetSnapshot>) -> CacheGeneration {
        let generation = self.publish(class, snapshots);
        debug!(class = %class, generation = %generation, "snapshot cache swapped");
        generation
    }

    /// Publishes snapshots loaded from the history store at cold start.
    pub fn seed(&self, class: AssetClass, snapshots: Vec<AssetSnapshot>) -> CacheGeneration {
        let generation = self.publish(class, snapshots);
        debug!(class = %class, generation = %generation, "snapshot cache seeded");
        generation
    }

    /// Marks every snapshot of `class` stale without touching values or the generation.
    ///
    /// Snapshots already marked keep their original marker.
    pub fn mark_stale(&self, class: AssetClass, since: DateTime<Utc>) {
        let slot = self.slot(class);
        let mut guard = slot
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.snapshots.iter().all(|s| s.stale_since.is_some()) {
            return;
        }
        let snapshots = guard
            .snapshots
            .iter()
            .cloned()
            .map(|mut s| {
                s.stale_since.get_or_insert(since);
                s
            })
            .collect();
        *guard = Arc::new(ClassView::new(snapshots, guard.generation, guard.published_at));
        debug!(class = %class, since = %since, "snapshot cache marked stale");
    }

    fn publish(&self, class: AssetClass, snapshots: Vec<AssetSnapshot>) -> CacheGeneration {
        let published_at = snapshots.iter().map(|s| s.fetched_at).max();
        let generation = self.next_generation();
        let view = Arc::new(ClassView::new(snapshots, generation, published_at));
        self.replace(class, view);
        generation
    }

    fn next_generation(&self) -> CacheGeneration {
        CacheGeneration(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn replace(&self, class: AssetClass, view: Arc<ClassView>) {
        let mut guard = self
            .slot(class)
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = view;
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn snapshot(key: AssetKey, value: Decimal) -> AssetSnapshot {
        AssetSnapshot {
            name: key.code.clone(),
            key,
            value,
            change_percent: Decimal::ZERO,
            fetched_at: Utc::now(),
            source_succeeded: true,
            stale_since: None,
            reported_change_percent: None,
        }
    }

    #[test]
    fn get_returns_none_for_unknown_key() {
        let cache = SnapshotCache::new();
        assert!(cache.get(&AssetKey::currency("USD")).is_none());
        assert!(cache.get_all(AssetClass::Gold).is_empty());
    }

    #[test]
    fn swap_replaces_whole_class_and_bumps_generation() {
        let cache = SnapshotCache::new();
        let first = cache.swap(
            AssetClass::Currency,
            vec![
                snapshot(AssetKey::currency("USD"), dec!(32.50)),
                snapshot(AssetKey::currency("EUR"), dec!(35.10)),
            ],
        );
        let second = cache.swap(
            AssetClass::Currency,
            vec![snapshot(AssetKey::currency("GBP"), dec!(41.00))],
        );

        assert!(second > first);
        assert_eq!(cache.generation(), second);
        assert!(cache.get(&AssetKey::currency("USD")).is_none());
        let all = cache.get_all(AssetClass::Currency);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key.code, "GBP");
    }

    #[test]
    fn classes_are_independent() {
        let cache = SnapshotCache::new();
        cache.swap(
            AssetClass::Gold,
            vec![snapshot(AssetKey::gold("Gram Altın"), dec!(2950.10))],
        );
        cache.swap(AssetClass::Silver, vec![]);

        assert_eq!(cache.get_all(AssetClass::Gold).len(), 1);
        assert_eq!(cache.view(AssetClass::Gold).generation(), CacheGeneration(1));
        assert_eq!(cache.view(AssetClass::Silver).generation(), CacheGeneration(2));
    }

    #[test]
    fn held_view_is_not_affected_by_later_swap() {
        let cache = SnapshotCache::new();
        cache.swap(
            AssetClass::Currency,
            vec![snapshot(AssetKey::currency("USD"), dec!(32.50))],
        );
        let before = cache.view(AssetClass::Currency);
        cache.swap(
            AssetClass::Currency,
            vec![snapshot(AssetKey::currency("USD"), dec!(32.80))],
        );

        assert_eq!(before.get("USD").unwrap().value, dec!(32.50));
        assert_eq!(
            cache.get(&AssetKey::currency("USD")).unwrap().value,
            dec!(32.80)
        );
    }

    #[test]
    fn mark_stale_keeps_values_and_first_marker() {
        let cache = SnapshotCache::new();
        let generation = cache.swap(
            AssetClass::Silver,
            vec![snapshot(AssetKey::silver("Gümüş"), dec!(34.1234))],
        );
        let first = Utc::now();
        cache.mark_stale(AssetClass::Silver, first);
        cache.mark_stale(AssetClass::Silver, first + chrono::Duration::minutes(5));

        let silver = cache.get(&AssetKey::silver("Gümüş")).unwrap();
        assert_eq!(silver.value, dec!(34.1234));
        assert_eq!(silver.stale_since, Some(first));
        assert_eq!(cache.generation(), generation);
    }
}
