//! Session persistence: the repository contract and its memory implementation.

pub mod memory;
pub mod persistence;
pub mod query;
pub mod traits;
pub mod types;

pub use memory::{MemoryGenerationSessionRepository, MemoryStore};
pub use persistence::{SnapshotConfig, SnapshotResult, SnapshotStore};
pub use query::{
    Pagination, SessionFilter, SessionPage, SessionQuery, SortDirection, SortField, SortOrder,
};
pub use traits::{GenerationSessionRepository, RepositoryResult};
pub use types::*;
