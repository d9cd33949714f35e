use crate::error::SeriesError;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

// ===== BOUNDED CACHE =====

/// Least-recently-used map. Insertion order of the underlying `IndexMap` is the
/// recency order, so the front entry is always the next eviction candidate.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: IndexMap<K, V>,
    capacity: Option<usize>,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// `None` keeps every entry for the lifetime of the cache.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity: capacity.map(|capacity| capacity.max(1)),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Returns the entry and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.entries.shift_remove_entry(key)?;
        let (key, value) = value;
        self.entries.insert(key, value.clone());
        Some(value)
    }

    /// Returns the entry without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Inserts or replaces an entry, returning whatever had to be evicted.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);

        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                match self.entries.shift_remove_index(0) {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }
        evicted
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }
}

// ===== FETCH-ONCE CACHE =====

type SharedFetch<V> = Shared<BoxFuture<'static, Result<Arc<V>, SeriesError>>>;

struct FetchState<K, V> {
    resident: BoundedCache<K, Arc<V>>,
    in_flight: HashMap<K, SharedFetch<V>>,
}

/// Immutable values fetched at most once per key while resident.
///
/// Concurrent requests for a key share a single pending fetch. Each waiter only
/// races its own cancellation token, so one caller giving up never aborts the
/// fetch for the others. Completed values enter the resident cache in the order
/// their fetches finish.
pub struct FetchCache<K, V> {
    label: &'static str,
    state: Arc<Mutex<FetchState<K, V>>>,
}

impl<K, V> FetchCache<K, V>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(label: &'static str, capacity: Option<usize>) -> Self {
        Self {
            label,
            state: Arc::new(Mutex::new(FetchState {
                resident: BoundedCache::new(capacity),
                in_flight: HashMap::new(),
            })),
        }
    }

    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: K,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Arc<V>, SeriesError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SeriesError>> + Send + 'static,
    {
        let pending = {
            let mut state = lock(&self.state);
            if let Some(value) = state.resident.get(&key) {
                log::debug!("{} cache hit for {:?}", self.label, key);
                return Ok(value);
            }
            match state.in_flight.get(&key) {
                Some(pending) => {
                    log::debug!("{} joining pending fetch for {:?}", self.label, key);
                    pending.clone()
                }
                None => {
                    log::debug!("{} cache miss for {:?}", self.label, key);
                    let pending = self.start_fetch(key.clone(), fetch());
                    state.in_flight.insert(key, pending.clone());
                    pending
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SeriesError::Canceled),
            result = pending => result,
        }
    }

    fn start_fetch<Fut>(&self, key: K, fetch: Fut) -> SharedFetch<V>
    where
        Fut: Future<Output = Result<V, SeriesError>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let label = self.label;
        async move {
            let result = fetch.await.map(Arc::new);
            {
                let mut state = lock(&state);
                state.in_flight.remove(&key);
                if let Ok(value) = &result {
                    for (evicted, _) in state.resident.insert(key, Arc::clone(value)) {
                        log::debug!("{} evicted {:?}", label, evicted);
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Resident value for `key`, if any. Does not touch recency.
    pub fn get_resident(&self, key: &K) -> Option<Arc<V>> {
        lock(&self.state).resident.peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.state).resident.contains(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        lock(&self.state).resident.capacity()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
