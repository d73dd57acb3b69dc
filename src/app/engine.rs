use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::ResolvedConfig;
use crate::prices::{
    HistoryStore, JsonlHistoryStore, PriceSource, RefreshCoordinator, Scheduler, SnapshotCache,
    TruncgilSource,
};

/// Cache, coordinator and scheduler wired together from a config.
pub struct Engine {
    config: ResolvedConfig,
    coordinator: Arc<RefreshCoordinator>,
    scheduler: Scheduler,
}

impl Engine {
    /// Truncgil provider plus a JSONL store under the data directory.
    pub fn from_config(config: ResolvedConfig) -> Result<Self> {
        let source = TruncgilSource::new(config.provider.clone(), config.refresh.provider_timeout)?;
        let store = JsonlHistoryStore::new(&config.data_dir);
        Ok(Self::with_parts(config, Arc::new(source), Arc::new(store)))
    }

    pub fn with_parts(
        config: ResolvedConfig,
        source: Arc<dyn PriceSource>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(source, store, Arc::new(SnapshotCache::new()))
            .with_retry_policy(config.retry.clone())
            .with_timeouts(config.refresh.timeouts())
            .with_circuit_breaker(config.circuit_breaker.clone());
        let coordinator = Arc::new(coordinator);
        let scheduler = Scheduler::new(Arc::clone(&coordinator), config.refresh.schedule());
        Self {
            config,
            coordinator,
            scheduler,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Age after which a class without a successful refresh counts as stale.
    pub fn staleness_threshold(&self) -> Duration {
        self.config
            .refresh
            .interval
            .saturating_add(self.config.refresh.cycle_timeout)
    }
}
