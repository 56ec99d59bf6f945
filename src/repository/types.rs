use crate::session::types::{
    CheckpointId, ChunkCoordinate, GenerationSessionId, SessionStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Status of a single tracked chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-coordinate bookkeeping inside a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub id: Uuid,
    pub session_id: GenerationSessionId,
    pub coordinate: ChunkCoordinate,
    pub status: ChunkTaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkTask {
    pub fn new(
        session_id: GenerationSessionId,
        coordinate: ChunkCoordinate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::task_id(session_id, coordinate),
            session_id,
            coordinate,
            status: ChunkTaskStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stable id derived from the session and coordinate
    pub fn task_id(session_id: GenerationSessionId, coordinate: ChunkCoordinate) -> Uuid {
        let name = format!("{}:{}", coordinate.x, coordinate.z);
        Uuid::new_v5(&session_id, name.as_bytes())
    }
}

/// Partial update applied by `update_chunk_task`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkTaskUpdate {
    pub status: Option<ChunkTaskStatus>,
    /// Failed attempts to add to the running count
    pub add_attempts: u32,
    pub last_error: Option<String>,
}

impl ChunkTaskUpdate {
    pub fn status(status: ChunkTaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed_attempt(status: ChunkTaskStatus, error: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            add_attempts: 1,
            last_error: Some(error.into()),
        }
    }
}

/// Checkpoint metadata, listed without the snapshot payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: CheckpointId,
    pub session_id: GenerationSessionId,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub chunk_count: u32,
    pub session_version: u64,
    pub session_status: SessionStatus,
}

/// Immutable snapshot of a whole session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub info: CheckpointInfo,
    /// Serialized `GenerationSession`
    pub session_snapshot: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Updated,
    StateChanged,
    ProgressUpdated,
    Paused,
    Resumed,
    Cancelled,
    CheckpointCreated,
    CheckpointRestored,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HistoryAction::Created => "created",
            HistoryAction::Updated => "updated",
            HistoryAction::StateChanged => "state_changed",
            HistoryAction::ProgressUpdated => "progress_updated",
            HistoryAction::Paused => "paused",
            HistoryAction::Resumed => "resumed",
            HistoryAction::Cancelled => "cancelled",
            HistoryAction::CheckpointCreated => "checkpoint_created",
            HistoryAction::CheckpointRestored => "checkpoint_restored",
        };
        f.write_str(name)
    }
}

/// One audit log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: HistoryAction,
    pub details: String,
    pub actor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStatistics {
    pub total_sessions: usize,
    pub sessions_by_status: BTreeMap<SessionStatus, usize>,
    pub active_sessions: usize,
    /// Mean of `completed_at - started_at` over sessions with both set
    pub average_completion_time_ms: Option<f64>,
    pub total_chunks_generated: u64,
    /// Chunks generated per second across timed sessions
    pub average_throughput: f64,
    /// Failed sessions over all sessions
    pub failure_rate: f64,
    pub total_checkpoints: usize,
}

/// Outcome of a partial-failure tolerant bulk delete
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDeleteResult {
    pub successful: Vec<GenerationSessionId>,
    pub failed: Vec<(GenerationSessionId, String)>,
    pub total_processed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    pub max_history_entries: usize,
    pub max_checkpoints_per_session: usize,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_history_entries: 1_000,
            max_checkpoints_per_session: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub cleanup: CleanupPolicy,
    /// Actor recorded in history entries
    pub actor: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cleanup: CleanupPolicy::default(),
            actor: "system".to_string(),
        }
    }
}
