//! Reuse of chunk generators across sessions of the same world.

use crate::cache::{build_cache, CacheConfig, CacheStatistics, CacheStrategy, SizeEstimator};
use crate::session::{ChunkGenerator, WorldGeneratorId};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Cache of generator instances keyed by world generator id
#[derive(Clone)]
pub struct GeneratorCache {
    cache: Arc<dyn CacheStrategy<WorldGeneratorId, Arc<dyn ChunkGenerator>>>,
}

impl GeneratorCache {
    pub fn new(config: &CacheConfig) -> Self {
        // Generators are opaque; charge each one a flat pointer-sized cost
        let estimator: SizeEstimator<Arc<dyn ChunkGenerator>> =
            Arc::new(|_: &Arc<dyn ChunkGenerator>| std::mem::size_of::<Arc<dyn ChunkGenerator>>());
        Self {
            cache: build_cache(config, estimator),
        }
    }

    pub fn with_strategy(
        cache: Arc<dyn CacheStrategy<WorldGeneratorId, Arc<dyn ChunkGenerator>>>,
    ) -> Self {
        Self { cache }
    }

    /// Return the cached generator for `world_generator_id`, building it with
    /// `factory` on a miss
    pub async fn get_or_create<F, Fut, E>(
        &self,
        world_generator_id: &str,
        factory: F,
    ) -> Result<Arc<dyn ChunkGenerator>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ChunkGenerator>, E>>,
    {
        let key = world_generator_id.to_string();
        if let Some(generator) = self.cache.get(&key).await {
            return Ok(generator);
        }

        debug!("Building generator for world {}", world_generator_id);
        let generator = factory().await?;
        self.cache.set(key, generator.clone()).await;
        Ok(generator)
    }

    pub async fn insert(&self, generator: Arc<dyn ChunkGenerator>) {
        let key = generator.world_generator_id().to_string();
        self.cache.set(key, generator).await;
    }

    pub async fn invalidate(&self, world_generator_id: &str) -> bool {
        self.cache.delete(&world_generator_id.to_string()).await
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }

    pub async fn statistics(&self) -> CacheStatistics {
        self.cache.statistics().await
    }
}
