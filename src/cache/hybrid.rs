use crate::cache::{
    CacheConfig, CacheStatistics, CacheStrategy, LruCache, SizeEstimator, TtlCache,
};
use async_trait::async_trait;
use std::hash::Hash;
use std::sync::Arc;

/// TTL layer for freshness in front of an LRU layer for capacity
///
/// Writes, deletes and clears go to both layers. Reads consult the TTL layer
/// first and fall back to the LRU layer; statistics are the sum of both.
/// Both layers share the entry bound, so the TTL layer never outgrows the
/// LRU layer.
pub struct HybridCache<K, V> {
    ttl: Arc<TtlCache<K, V>>,
    lru: LruCache<K, V>,
}

impl<K, V> HybridCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &CacheConfig, estimator: SizeEstimator<V>) -> Self {
        Self {
            ttl: TtlCache::with_capacity(
                config.ttl_ms,
                Some(config.max_size.max(1)),
                estimator.clone(),
            ),
            lru: LruCache::new(config.max_size, config.max_memory_bytes, estimator),
        }
    }

    pub fn ttl_layer(&self) -> &TtlCache<K, V> {
        &self.ttl
    }

    pub fn lru_layer(&self) -> &LruCache<K, V> {
        &self.lru
    }
}

#[async_trait]
impl<K, V> CacheStrategy<K, V> for HybridCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        if let Some(value) = self.ttl.get(key).await {
            return Some(value);
        }
        self.lru.get(key).await
    }

    async fn set(&self, key: K, value: V) {
        self.ttl.set(key.clone(), value.clone()).await;
        self.lru.set(key, value).await;
    }

    async fn delete(&self, key: &K) -> bool {
        let in_ttl = self.ttl.delete(key).await;
        let in_lru = self.lru.delete(key).await;
        in_ttl || in_lru
    }

    async fn clear(&self) {
        self.ttl.clear().await;
        self.lru.clear().await;
    }

    /// Entries held by the LRU layer, which bounds the cache
    async fn size(&self) -> usize {
        self.lru.size().await
    }

    async fn statistics(&self) -> CacheStatistics {
        let ttl = self.ttl.statistics().await;
        let lru = self.lru.statistics().await;
        ttl.combined(&lru)
    }

    async fn evict(&self) -> usize {
        self.ttl.evict().await + self.lru.evict().await
    }
}
