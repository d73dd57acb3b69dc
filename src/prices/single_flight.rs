//! Deduplication of concurrent work keyed by `K`.
//!
//! The first caller for a key launches the work on its own task; callers that arrive
//! while it runs attach to the same shared handle and receive a clone of its result.
//! Dropping a caller never cancels the work.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

/// The spawned task ended without producing a value (panic or runtime shutdown).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("In-flight operation aborted: {0}")]
pub struct FlightAborted(pub String);

type Flight<V> = Shared<BoxFuture<'static, Result<V, FlightAborted>>>;
type FlightMap<K, V> = Arc<Mutex<HashMap<K, (u64, Flight<V>)>>>;

pub struct SingleFlight<K, V> {
    inflight: FlightMap<K, V>,
    next_id: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.inflight).contains_key(key)
    }

    /// Runs the future built by `make` unless one is already in flight for `key`, in
    /// which case `make` is not called and the caller waits for the running one.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<V, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let flight = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some((_, flight)) => flight.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = self.launch(key.clone(), id, make());
                    inflight.insert(key, (id, flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    fn launch<Fut>(&self, key: K, id: u64, work: Fut) -> Flight<V>
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let release = Release {
            inflight: Arc::clone(&self.inflight),
            key,
            id,
        };
        let handle = tokio::spawn(async move {
            let _release = release;
            work.await
        });
        async move { handle.await.map_err(|err| FlightAborted(err.to_string())) }
            .boxed()
            .shared()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<K, V>(map: &FlightMap<K, V>) -> MutexGuard<'_, HashMap<K, (u64, Flight<V>)>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Frees the key when the spawned task finishes, however it finishes.
struct Release<K: Eq + Hash, V> {
    inflight: FlightMap<K, V>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for Release<K, V> {
    fn drop(&mut self) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if inflight.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            inflight.remove(&self.key);
        }
    }
}
