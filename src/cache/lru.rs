use crate::cache::{CacheStatistics, CacheStrategy, SizeEstimator};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use tokio::sync::Mutex;
use tracing::debug;

struct LruEntry<V> {
    value: V,
    /// Position in the access order; larger is more recent
    tick: u64,
    size: usize,
}

struct LruState<K, V> {
    entries: HashMap<K, LruEntry<V>>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
    memory_usage: usize,
    statistics: CacheStatistics,
}

impl<K: Eq + Hash + Clone, V> LruState<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
            self.next_tick += 1;
        }
    }

    fn remove(&mut self, key: &K) -> Option<LruEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.memory_usage -= entry.size;
        Some(entry)
    }

    fn evict_least_recent(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.memory_usage -= entry.size;
        }
        self.statistics.evictions += 1;
        true
    }
}

/// Least-recently-used cache bounded by entry count and optionally memory
pub struct LruCache<K, V> {
    state: Mutex<LruState<K, V>>,
    max_size: usize,
    max_memory_bytes: Option<usize>,
    estimator: SizeEstimator<V>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        max_size: usize,
        max_memory_bytes: Option<usize>,
        estimator: SizeEstimator<V>,
    ) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                memory_usage: 0,
                statistics: CacheStatistics::default(),
            }),
            max_size: max_size.max(1),
            max_memory_bytes,
            estimator,
        }
    }

    /// Keys from least to most recently used
    pub async fn keys(&self) -> Vec<K> {
        self.state.lock().await.order.values().cloned().collect()
    }

    fn over_capacity(&self, state: &LruState<K, V>) -> bool {
        state.entries.len() > self.max_size
            || self
                .max_memory_bytes
                .is_some_and(|limit| state.memory_usage > limit && state.entries.len() > 1)
    }

    fn evict_locked(&self, state: &mut LruState<K, V>) -> usize {
        let mut evicted = 0;
        while self.over_capacity(state) && state.evict_least_recent() {
            evicted += 1;
        }
        if evicted > 0 {
            debug!("LRU cache evicted {} entries", evicted);
        }
        evicted
    }
}

#[async_trait]
impl<K, V> CacheStrategy<K, V> for LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().await;
        let value = state.entries.get(key).map(|entry| entry.value.clone());
        match value {
            Some(value) => {
                state.touch(key);
                state.statistics.record_hit();
                Some(value)
            }
            None => {
                state.statistics.record_miss();
                None
            }
        }
    }

    async fn set(&self, key: K, value: V) {
        let size = (self.estimator)(&value);
        let mut state = self.state.lock().await;
        state.remove(&key);

        let tick = state.next_tick;
        state.next_tick += 1;
        state.order.insert(tick, key.clone());
        state.entries.insert(key, LruEntry { value, tick, size });
        state.memory_usage += size;

        self.evict_locked(&mut state);
    }

    async fn delete(&self, key: &K) -> bool {
        self.state.lock().await.remove(key).is_some()
    }

    async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.order.clear();
        state.memory_usage = 0;
    }

    async fn size(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    async fn statistics(&self) -> CacheStatistics {
        let state = self.state.lock().await;
        CacheStatistics {
            size: state.entries.len(),
            memory_usage: state.memory_usage,
            ..state.statistics.clone()
        }
    }

    async fn evict(&self) -> usize {
        let mut state = self.state.lock().await;
        self.evict_locked(&mut state)
    }
}
