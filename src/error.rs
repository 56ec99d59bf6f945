//! Error taxonomy for session orchestration.
//!
//! Validation failures never mutate state, illegal transitions leave the session
//! untouched, and repository failures always carry the operation that produced
//! them.

use crate::session::types::{
    BatchId, BatchStatus, CheckpointId, ChunkCoordinate, GenerationSessionId, SessionStatus,
};
use uuid::Uuid;

/// Bad request or configuration detected at creation time. Fatal, never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("generation request contains no coordinates")]
    EmptyRequest,
    #[error("generation request has {count} coordinates, maximum is {max}")]
    TooManyCoordinates { count: usize, max: usize },
    #[error("generation request contains duplicate coordinates: {duplicates:?}")]
    DuplicateCoordinates { duplicates: Vec<ChunkCoordinate> },
    #[error("priority {priority} outside of range {min}..={max}")]
    PriorityOutOfRange { priority: u8, min: u8, max: u8 },
    #[error("invalid configuration `{field}`: {reason}")]
    InvalidConfiguration { field: &'static str, reason: String },
    #[error("world generator id must not be empty")]
    EmptyWorldGeneratorId,
}

/// Validation failures collected while creating a session
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to create session {session_id}: {}", describe_all(.errors))]
pub struct CreationError {
    pub session_id: GenerationSessionId,
    pub errors: Vec<ValidationError>,
}

impl CreationError {
    pub fn has_duplicate_coordinates(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateCoordinates { .. }))
    }
}

fn describe_all(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Illegal state transition. Fatal to the call, the session is unaffected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot {operation} session {session_id} while {status}")]
    InvalidTransition {
        session_id: GenerationSessionId,
        operation: &'static str,
        status: SessionStatus,
    },
    #[error("session {session_id} is {status}; no further batch transitions are accepted")]
    SessionTerminal {
        session_id: GenerationSessionId,
        status: SessionStatus,
    },
    #[error("batch {batch_id} not found in session {session_id}")]
    BatchNotFound {
        session_id: GenerationSessionId,
        batch_id: BatchId,
    },
    #[error("cannot {operation} batch {batch_id} while {status}")]
    InvalidBatchTransition {
        batch_id: BatchId,
        operation: &'static str,
        status: BatchStatus,
    },
    #[error("progress update of {requested} chunks exceeds {pending} pending chunks")]
    ProgressOverflow { requested: u32, pending: u32 },
    #[error("progress counters do not add up: {completed} + {failed} + {pending} != {total}")]
    InconsistentProgress {
        total: u32,
        completed: u32,
        failed: u32,
        pending: u32,
    },
}

/// Repository lookup miss
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("generation session {session_id} not found")]
pub struct GenerationSessionNotFoundError {
    pub session_id: GenerationSessionId,
}

/// Underlying reason of a repository failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryFailure {
    #[error(transparent)]
    NotFound(#[from] GenerationSessionNotFoundError),
    #[error("session {0} already exists")]
    AlreadyExists(GenerationSessionId),
    #[error("stale write for session {session_id}: expected version {expected}, got {actual}")]
    VersionConflict {
        session_id: GenerationSessionId,
        expected: u64,
        actual: u64,
    },
    #[error("checkpoint {checkpoint_id} not found for session {session_id}")]
    CheckpointNotFound {
        session_id: GenerationSessionId,
        checkpoint_id: CheckpointId,
    },
    #[error("chunk task {task_id} not found in session {session_id}")]
    ChunkTaskNotFound {
        session_id: GenerationSessionId,
        task_id: Uuid,
    },
    #[error("chunk task {task_id} already exists in session {session_id}")]
    ChunkTaskExists {
        session_id: GenerationSessionId,
        task_id: Uuid,
    },
    #[error(transparent)]
    InvalidTransition(#[from] SessionError),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Uniform repository error carrying the originating operation and its cause
#[derive(Debug, Clone, thiserror::Error)]
#[error("repository operation `{operation}` failed: {cause}")]
pub struct RepositoryError {
    pub operation: &'static str,
    #[source]
    pub cause: RepositoryFailure,
}

impl RepositoryError {
    pub fn new(operation: &'static str, cause: impl Into<RepositoryFailure>) -> Self {
        Self {
            operation,
            cause: cause.into(),
        }
    }

    pub fn not_found(operation: &'static str, session_id: GenerationSessionId) -> Self {
        Self::new(operation, GenerationSessionNotFoundError { session_id })
    }

    pub fn storage(operation: &'static str, error: impl std::fmt::Display) -> Self {
        Self::new(operation, RepositoryFailure::Storage(error.to_string()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.cause, RepositoryFailure::NotFound(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self.cause, RepositoryFailure::VersionConflict { .. })
    }

    /// The transition error when the repository rejected an illegal state change
    pub fn session_error(&self) -> Option<&SessionError> {
        match &self.cause {
            RepositoryFailure::InvalidTransition(error) => Some(error),
            _ => None,
        }
    }
}

/// Recovery attempted on a non-recoverable session, or recovery itself failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionRecoveryError {
    #[error("session {session_id} cannot be recovered from status {status}")]
    NotRecoverable {
        session_id: GenerationSessionId,
        status: SessionStatus,
    },
    #[error("recovery of session {session_id} failed: {reason}")]
    ExecutionFailed {
        session_id: GenerationSessionId,
        reason: String,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors surfaced by [`SessionManager`](crate::session::SessionManager) operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Creation(#[from] CreationError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Recovery(#[from] SessionRecoveryError),
    #[error("session {session_id} update lost {attempts} version races in a row")]
    TransactionConflict {
        session_id: GenerationSessionId,
        attempts: u32,
    },
}

impl OrchestratorError {
    /// The transition error, whether raised by the aggregate or relayed by the repository
    pub fn session_error(&self) -> Option<&SessionError> {
        match self {
            OrchestratorError::Session(error) => Some(error),
            OrchestratorError::Repository(error) => error.session_error(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::Repository(error) if error.is_not_found())
    }
}
