use crate::cache::{CacheStatistics, CacheStrategy, SizeEstimator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
    /// Insertion order, breaks ties between equal expiry instants
    sequence: u64,
    size: usize,
}

struct TtlState<K, V> {
    entries: HashMap<K, TtlEntry<V>>,
    max_entries: Option<usize>,
    next_sequence: u64,
    memory_usage: usize,
    statistics: CacheStatistics,
}

impl<K: Eq + Hash, V> TtlState<K, V> {
    fn remove(&mut self, key: &K) -> Option<TtlEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.memory_usage -= entry.size;
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let live = entry.expires_at > now;
            if !live {
                freed += entry.size;
            }
            live
        });
        let purged = before - self.entries.len();
        self.memory_usage -= freed;
        self.statistics.evictions += purged as u64;
        purged
    }

    /// Drop the entries closest to expiry until the entry bound holds
    fn enforce_capacity(&mut self) -> usize
    where
        K: Clone,
    {
        let Some(max_entries) = self.max_entries else {
            return 0;
        };
        let mut dropped = 0;
        while self.entries.len() > max_entries {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.expires_at, entry.sequence))
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.remove(&oldest);
            self.statistics.evictions += 1;
            dropped += 1;
        }
        dropped
    }
}

/// Cache whose entries expire a fixed time after insertion
///
/// Expired entries are purged lazily on access and by a background sweep
/// running every half lifetime. The sweep holds only a weak reference and
/// stops once the cache is dropped. An optional entry bound drops the
/// entries closest to expiry first.
pub struct TtlCache<K, V> {
    state: Mutex<TtlState<K, V>>,
    ttl: Duration,
    estimator: SizeEstimator<V>,
    sweeper: Option<JoinHandle<()>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl_ms: u64, estimator: SizeEstimator<V>) -> Arc<Self> {
        Self::with_capacity(ttl_ms, None, estimator)
    }

    pub fn with_capacity(
        ttl_ms: u64,
        max_entries: Option<usize>,
        estimator: SizeEstimator<V>,
    ) -> Arc<Self> {
        let ttl = Duration::from_millis(ttl_ms.max(1));
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let sweeper = match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(sweep_loop(weak.clone(), ttl / 2))),
                Err(_) => {
                    warn!("No tokio runtime; TTL cache will only purge on access");
                    None
                }
            };
            Self {
                state: Mutex::new(TtlState {
                    entries: HashMap::new(),
                    max_entries,
                    next_sequence: 0,
                    memory_usage: 0,
                    statistics: CacheStatistics::default(),
                }),
                ttl,
                estimator,
                sweeper,
            }
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

async fn sweep_loop<K, V>(cache: Weak<TtlCache<K, V>>, period: Duration)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        let purged = cache.evict().await;
        if purged > 0 {
            debug!("TTL sweep purged {} expired entries", purged);
        }
    }
}

impl<K, V> Drop for TtlCache<K, V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl<K, V> CacheStrategy<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let lookup = state
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => {
                state.statistics.record_hit();
                Some(value)
            }
            Some(None) => {
                state.remove(key);
                state.statistics.evictions += 1;
                state.statistics.record_miss();
                None
            }
            None => {
                state.statistics.record_miss();
                None
            }
        }
    }

    async fn set(&self, key: K, value: V) {
        let size = (self.estimator)(&value);
        let expires_at = Instant::now() + self.ttl;
        let mut state = self.state.lock().await;
        state.remove(&key);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.insert(
            key,
            TtlEntry {
                value,
                expires_at,
                sequence,
                size,
            },
        );
        state.memory_usage += size;
        let dropped = state.enforce_capacity();
        if dropped > 0 {
            debug!("TTL cache over capacity, dropped {} entries", dropped);
        }
    }

    async fn delete(&self, key: &K) -> bool {
        self.state.lock().await.remove(key).is_some()
    }

    async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
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
        let now = Instant::now();
        self.state.lock().await.purge_expired(now)
    }
}
