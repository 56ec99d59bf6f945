//! # Chunkgen
//!
//! Session orchestration for long-running procedural chunk generation. A
//! generation session takes a set of chunk coordinates for one world
//! generator, splits them into batches and drives them to completion through
//! a state machine with retries, progress estimation, checkpoints and
//! recovery.
//!
//! ## Architecture Overview
//!
//! - **[`session`]**: the `GenerationSession` aggregate, its state machine,
//!   progress tracking, retry policy, events, recovery and the
//!   `SessionManager` that serializes operations and drives sessions
//! - **[`repository`]**: the session repository contract, the in-memory
//!   implementation with checkpoints and history, and snapshot persistence
//! - **[`cache`]**: LRU, TTL and hybrid caches, and the world generator cache
//! - **[`config`]**: TOML configuration and file discovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chunkgen::repository::MemoryGenerationSessionRepository;
//! use chunkgen::session::{
//!     ChunkCoordinate, GenerationRequest, SessionEventBus, SessionManager,
//!     SimulatedChunkGenerator,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repository = Arc::new(MemoryGenerationSessionRepository::default());
//!     let manager = SessionManager::new(repository, Arc::new(SessionEventBus::new()));
//!
//!     let coordinates = (0..100).map(|i| ChunkCoordinate::new(i % 10, i / 10)).collect();
//!     let session = manager
//!         .create_session("overworld", GenerationRequest::new(coordinates, 5), None)
//!         .await?;
//!     manager.start_session(session.id).await?;
//!
//!     let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 42));
//!     let report = manager.run_session(session.id, generator).await?;
//!     println!("{} chunks generated", report.chunks_generated);
//!     Ok(())
//! }
//! ```

/// Generation sessions and the services around them.
pub mod session;

/// Session storage, checkpoints, history and statistics.
pub mod repository;

/// Pluggable caching strategies.
pub mod cache;

/// Configuration loading and discovery.
pub mod config;

/// Error taxonomy shared by the aggregate, repository and recovery.
pub mod error;

/// Environment constants and path utilities.
pub mod env;

/// Command line front end.
pub mod cli;

pub use cache::{CacheConfig, CacheStatistics, CacheStrategy, GeneratorCache};
pub use config::{ConfigDiscovery, OrchestratorConfig};
pub use error::{OrchestratorError, RepositoryError, SessionError};
pub use repository::{GenerationSessionRepository, MemoryGenerationSessionRepository};
pub use session::{
    ChunkGenerator, GenerationSession, SessionEventBus, SessionManager, SessionManagerConfig,
    SessionRecovery, SessionStatus,
};
