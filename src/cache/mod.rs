//! Pluggable eviction layer for expensive shared objects.
//!
//! Three strategies implement [`CacheStrategy`]: [`LruCache`] bounds the entry
//! count by access order, [`TtlCache`] expires entries a fixed time after
//! insertion, and [`HybridCache`] layers the two. Each guards its own state, so
//! a cache can be shared freely between tasks.

pub mod generator_cache;
pub mod hybrid;
pub mod lru;
pub mod ttl;


pub use generator_cache::GeneratorCache;
pub use hybrid::HybridCache;
pub use lru::LruCache;
pub use ttl::TtlCache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Estimates the memory footprint of a cached value in bytes
pub type SizeEstimator<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// Estimator that charges every value its inline size
pub fn default_size_estimator<V: 'static>() -> SizeEstimator<V> {
    Arc::new(|_: &V| std::mem::size_of::<V>())
}

#[async_trait]
pub trait CacheStrategy<K, V>: Send + Sync
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V>;

    async fn set(&self, key: K, value: V);

    /// Remove `key`; returns whether it was present
    async fn delete(&self, key: &K) -> bool;

    async fn clear(&self);

    async fn size(&self) -> usize;

    async fn statistics(&self) -> CacheStatistics;

    /// Drop entries the policy no longer retains; returns how many were dropped
    async fn evict(&self) -> usize;

    /// Preload entries, e.g. from a previous run
    async fn warmup(&self, entries: Vec<(K, V)>) {
        for (key, value) in entries {
            self.set(key, value).await;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub size: usize,
    /// Sum of estimated value sizes in bytes
    pub memory_usage: usize,
}

impl CacheStatistics {
    pub(crate) fn record_hit(&mut self) {
        self.hits += 1;
        self.total_requests += 1;
        self.update_hit_rate();
    }

    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
        self.total_requests += 1;
        self.update_hit_rate();
    }

    /// Field-wise sum, with the hit rate recomputed over the combined requests
    pub fn combined(&self, other: &CacheStatistics) -> CacheStatistics {
        let mut combined = CacheStatistics {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            total_requests: self.total_requests + other.total_requests,
            hit_rate: 0.0,
            evictions: self.evictions + other.evictions,
            size: self.size + other.size,
            memory_usage: self.memory_usage + other.memory_usage,
        };
        combined.update_hit_rate();
        combined
    }

    fn update_hit_rate(&mut self) {
        self.hit_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_requests as f64
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategyKind {
    Lru,
    Ttl,
    Hybrid,
}

impl fmt::Display for CacheStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategyKind::Lru => f.write_str("lru"),
            CacheStrategyKind::Ttl => f.write_str("ttl"),
            CacheStrategyKind::Hybrid => f.write_str("hybrid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub strategy: CacheStrategyKind,
    /// Entry bound of the LRU layer
    pub max_size: usize,
    /// Lifetime of TTL entries
    pub ttl_ms: u64,
    /// Optional memory bound of the LRU layer, in estimated bytes
    pub max_memory_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategyKind::Hybrid,
            max_size: 64,
            ttl_ms: 300_000, // 5 minutes
            max_memory_bytes: None,
        }
    }
}

/// Build the strategy selected by `config`
///
/// TTL-based strategies start their background sweep on the current tokio
/// runtime when there is one.
pub fn build_cache<K, V>(
    config: &CacheConfig,
    estimator: SizeEstimator<V>,
) -> Arc<dyn CacheStrategy<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    match config.strategy {
        CacheStrategyKind::Lru => Arc::new(LruCache::new(
            config.max_size,
            config.max_memory_bytes,
            estimator,
        )),
        CacheStrategyKind::Ttl => {
            let cache: Arc<dyn CacheStrategy<K, V>> = TtlCache::new(config.ttl_ms, estimator);
            cache
        }
        CacheStrategyKind::Hybrid => Arc::new(HybridCache::new(config, estimator)),
    }
}
