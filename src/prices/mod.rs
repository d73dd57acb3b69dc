//! Price refresh and cache engine.
//!
//! Data flows one way: [`Scheduler`] (or a manual trigger) asks the
//! [`RefreshCoordinator`] to refresh a class, the coordinator pulls raw readings from a
//! [`PriceSource`], appends them to the [`HistoryStore`] and then swaps the class in
//! the [`SnapshotCache`]. Readers only ever touch the cache and the store.

mod cache;
mod circuit;
mod coordinator;
mod error;
mod jsonl_store;
mod models;
pub mod parse;
mod provider;
pub mod providers;
mod retry;
mod scheduler;
mod single_flight;
mod store;

pub use cache::{ClassView, SnapshotCache};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use coordinator::{RefreshCoordinator, RefreshOutcome, RefreshStatus, RefreshTimeouts};
pub use error::{PersistenceError, RefreshError, UpstreamError};
pub use jsonl_store::JsonlHistoryStore;
pub use models::{
    AssetClass, AssetKey, AssetSnapshot, CacheGeneration, HistoryPoint, HistoryRange, RawReading,
};
pub use provider::PriceSource;
pub use providers::{TruncgilConfig, TruncgilSource};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{compute_next_delay, Schedule, Scheduler, SchedulerHandle};
pub use single_flight::{FlightAborted, SingleFlight};
pub use store::{HistoryStore, MemoryHistoryStore};
