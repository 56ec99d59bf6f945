//! Chunk generator collaborator boundary.
//!
//! Terrain, biome and cave algorithms live behind [`ChunkGenerator`]; the
//! orchestrator only needs an async, possibly failing `generate` call.

use crate::session::types::{ChunkCoordinate, WorldGeneratorId};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Side length of a chunk in blocks
pub const CHUNK_SIZE: usize = 16;

/// Output of a successful generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    pub coordinate: ChunkCoordinate,
    pub world_generator_id: WorldGeneratorId,
    pub height_map: Vec<u16>,
    pub checksum: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("noise source failed at {coordinate}: {reason}")]
    NoiseSource {
        coordinate: ChunkCoordinate,
        reason: String,
    },
    #[error("generation of {coordinate} timed out after {timeout_ms}ms")]
    Timeout {
        coordinate: ChunkCoordinate,
        timeout_ms: u64,
    },
    #[error("generator resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("chunk storage failed: {0}")]
    Storage(String),
    #[error("invalid coordinate {coordinate}: {reason}")]
    InvalidCoordinate {
        coordinate: ChunkCoordinate,
        reason: String,
    },
    #[error("corrupted output for {coordinate}: {reason}")]
    CorruptedOutput {
        coordinate: ChunkCoordinate,
        reason: String,
    },
    #[error("internal generator error: {0}")]
    Internal(String),
}

impl GenerationError {
    pub fn coordinate(&self) -> Option<ChunkCoordinate> {
        match self {
            GenerationError::NoiseSource { coordinate, .. }
            | GenerationError::Timeout { coordinate, .. }
            | GenerationError::InvalidCoordinate { coordinate, .. }
            | GenerationError::CorruptedOutput { coordinate, .. } => Some(*coordinate),
            GenerationError::ResourceExhausted(_)
            | GenerationError::Storage(_)
            | GenerationError::Internal(_) => None,
        }
    }
}

#[async_trait]
pub trait ChunkGenerator: Send + Sync {
    fn world_generator_id(&self) -> &str;

    async fn generate(&self, coordinate: ChunkCoordinate) -> Result<ChunkData, GenerationError>;
}

/// Deterministic in-process generator with failure injection
///
/// Output depends only on `(seed, x, z)`. Failures come from the seeded random
/// failure rate or from coordinates forced to fail a fixed number of times.
pub struct SimulatedChunkGenerator {
    world_generator_id: WorldGeneratorId,
    seed: u64,
    latency: Duration,
    failure_rate: f64,
    forced_failures: HashMap<ChunkCoordinate, ForcedFailure>,
    attempts: DashMap<ChunkCoordinate, u32>,
    rng: Mutex<StdRng>,
}

#[derive(Debug, Clone)]
struct ForcedFailure {
    times: u32,
    error: GenerationError,
}

impl std::fmt::Debug for SimulatedChunkGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChunkGenerator")
            .field("world_generator_id", &self.world_generator_id)
            .field("seed", &self.seed)
            .field("latency", &self.latency)
            .field("failure_rate", &self.failure_rate)
            .finish()
    }
}

impl SimulatedChunkGenerator {
    pub fn new(world_generator_id: impl Into<WorldGeneratorId>, seed: u64) -> Self {
        Self {
            world_generator_id: world_generator_id.into(),
            seed,
            latency: Duration::ZERO,
            failure_rate: 0.0,
            forced_failures: HashMap::new(),
            attempts: DashMap::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probability in `[0, 1]` that any single generation fails transiently
    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = if failure_rate.is_finite() {
            failure_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Make `coordinate` fail with a transient noise error on its first `times` attempts
    pub fn fail_coordinate(self, coordinate: ChunkCoordinate, times: u32) -> Self {
        let error = GenerationError::NoiseSource {
            coordinate,
            reason: "injected failure".to_string(),
        };
        self.fail_coordinate_with(coordinate, times, error)
    }

    pub fn fail_coordinate_with(
        mut self,
        coordinate: ChunkCoordinate,
        times: u32,
        error: GenerationError,
    ) -> Self {
        self.forced_failures
            .insert(coordinate, ForcedFailure { times, error });
        self
    }

    /// Number of generate calls seen for `coordinate`
    pub fn attempts_for(&self, coordinate: ChunkCoordinate) -> u32 {
        self.attempts.get(&coordinate).map(|count| *count).unwrap_or(0)
    }

    fn height_map(&self, coordinate: ChunkCoordinate) -> Vec<u16> {
        let mut heights = Vec::with_capacity(CHUNK_SIZE * CHUNK_SIZE);
        for local_z in 0..CHUNK_SIZE as i64 {
            for local_x in 0..CHUNK_SIZE as i64 {
                let world_x = i64::from(coordinate.x) * CHUNK_SIZE as i64 + local_x;
                let world_z = i64::from(coordinate.z) * CHUNK_SIZE as i64 + local_z;
                let noise =
                    mix(self.seed ^ mix(world_x as u64) ^ mix(world_z as u64).rotate_left(17));
                heights.push(48 + (noise % 64) as u16);
            }
        }
        heights
    }
}

#[async_trait]
impl ChunkGenerator for SimulatedChunkGenerator {
    fn world_generator_id(&self) -> &str {
        &self.world_generator_id
    }

    async fn generate(&self, coordinate: ChunkCoordinate) -> Result<ChunkData, GenerationError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let attempt = {
            let mut count = self.attempts.entry(coordinate).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(forced) = self.forced_failures.get(&coordinate) {
            if attempt <= forced.times {
                return Err(forced.error.clone());
            }
        }

        if self.failure_rate > 0.0 {
            let failed = self
                .rng
                .lock()
                .map(|mut rng| rng.random_bool(self.failure_rate))
                .unwrap_or(false);
            if failed {
                return Err(GenerationError::NoiseSource {
                    coordinate,
                    reason: format!("simulated noise failure on attempt {}", attempt),
                });
            }
        }

        let height_map = self.height_map(coordinate);
        let checksum = height_map
            .iter()
            .fold(self.seed, |acc, height| mix(acc ^ u64::from(*height)));

        Ok(ChunkData {
            coordinate,
            world_generator_id: self.world_generator_id.clone(),
            height_map,
            checksum,
        })
    }
}

/// splitmix64 finalizer
fn mix(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    value ^ (value >> 31)
}
