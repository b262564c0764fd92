use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Per-key lazily populated cache with at most one in-flight fetch per key.
///
/// The map lock only guards slot lookup and is never held across a fetch, so
/// misses on different keys proceed concurrently. Concurrent misses on the same
/// key wait on the same slot and share its value. A failed fetch removes its
/// empty slot; the next caller fetches again.
#[derive(Debug)]
pub struct SingleFlightCache<K, V> {
    slots: Mutex<HashMap<K, Arc<OnceCell<Arc<V>>>>>,
}

impl<K, V> Default for SingleFlightCache<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, running `fetch` on a miss.
    pub async fn get_or_try_fetch<E, F, Fut>(&self, key: &K, fetch: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let result = slot
            .get_or_try_init(|| async { fetch().await.map(Arc::new) })
            .await
            .cloned();
        if result.is_err() {
            self.discard_empty(key, &slot);
        }
        result
    }

    /// Drop a slot left empty by a failed fetch, unless it was replaced or
    /// filled in the meantime.
    fn discard_empty(&self, key: &K, slot: &Arc<OnceCell<Arc<V>>>) {
        let mut slots = self.slots.lock().unwrap();
        let stale = slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            slots.remove(key);
        }
    }

    /// Populated value without fetching.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slots = self.slots.lock().unwrap();
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Store a value, replacing any cached or in-flight entry.
    pub fn insert(&self, key: K, value: V) {
        let slot = OnceCell::new_with(Some(Arc::new(value)));
        self.slots.lock().unwrap().insert(key, Arc::new(slot));
    }

    /// Evict one key. An in-flight fetch still completes for its waiters but
    /// is not retained.
    pub fn invalidate(&self, key: &K) {
        self.slots.lock().unwrap().remove(key);
    }

    /// Evict every key matching `predicate`.
    pub fn invalidate_where(&self, predicate: impl Fn(&K) -> bool) {
        self.slots.lock().unwrap().retain(|k, _| !predicate(k));
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
