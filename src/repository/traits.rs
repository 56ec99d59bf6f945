use crate::error::RepositoryError;
use crate::repository::query::{SessionPage, SessionQuery};
use crate::repository::types::{
    BatchDeleteResult, CheckpointInfo, ChunkTask, ChunkTaskUpdate, HistoryEntry,
    RepositoryStatistics,
};
use crate::session::aggregate::{GenerationSession, SessionTransition};
use crate::session::progress::ProgressData;
use crate::session::state::{CancelReason, SessionState};
use crate::session::types::{CheckpointId, GenerationSessionId};
use async_trait::async_trait;
use uuid::Uuid;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Storage contract for generation sessions
///
/// Every operation on an unknown session fails with a not-found cause. Writes
/// through [`update_session`](Self::update_session) are version-checked: the
/// stored version must be exactly one below the incoming one.
#[async_trait]
pub trait GenerationSessionRepository: Send + Sync {
    async fn create_session(
        &self,
        session: GenerationSession,
    ) -> RepositoryResult<GenerationSession>;

    async fn find_by_id(&self, id: GenerationSessionId) -> RepositoryResult<GenerationSession>;

    /// Sessions for the ids that exist, in the order requested
    async fn find_many_by_ids(
        &self,
        ids: &[GenerationSessionId],
    ) -> RepositoryResult<Vec<GenerationSession>>;

    async fn find_by_world_id(
        &self,
        world_generator_id: &str,
    ) -> RepositoryResult<Vec<GenerationSession>>;

    async fn find_by_query(&self, query: &SessionQuery) -> RepositoryResult<SessionPage>;

    /// Running or paused sessions
    async fn find_active_sessions(&self) -> RepositoryResult<Vec<GenerationSession>>;

    async fn update_session(
        &self,
        session: GenerationSession,
    ) -> RepositoryResult<GenerationSession>;

    async fn delete_session(&self, id: GenerationSessionId) -> RepositoryResult<()>;

    /// Delete each id, continuing past individual failures
    async fn delete_sessions(
        &self,
        ids: &[GenerationSessionId],
    ) -> RepositoryResult<BatchDeleteResult>;

    /// Replace the state machine of a session
    async fn update_session_state(
        &self,
        id: GenerationSessionId,
        state: SessionState,
    ) -> RepositoryResult<GenerationSession>;

    async fn update_progress(
        &self,
        id: GenerationSessionId,
        progress: ProgressData,
    ) -> RepositoryResult<GenerationSession>;

    async fn pause_session(
        &self,
        id: GenerationSessionId,
        reason: &str,
    ) -> RepositoryResult<SessionTransition>;

    async fn resume_session(&self, id: GenerationSessionId) -> RepositoryResult<SessionTransition>;

    async fn cancel_session(
        &self,
        id: GenerationSessionId,
        reason: CancelReason,
    ) -> RepositoryResult<SessionTransition>;

    async fn add_chunk_task(&self, task: ChunkTask) -> RepositoryResult<()>;

    async fn update_chunk_task(
        &self,
        session_id: GenerationSessionId,
        task_id: Uuid,
        update: ChunkTaskUpdate,
    ) -> RepositoryResult<ChunkTask>;

    async fn get_completed_chunks(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<ChunkTask>>;

    async fn get_failed_chunks(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<ChunkTask>>;

    async fn get_pending_chunks(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<ChunkTask>>;

    async fn create_checkpoint(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<CheckpointId>;

    /// Replace the stored session with a checkpoint's snapshot
    async fn restore_from_checkpoint(
        &self,
        session_id: GenerationSessionId,
        checkpoint_id: &str,
    ) -> RepositoryResult<GenerationSession>;

    async fn list_checkpoints(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<CheckpointInfo>>;

    async fn get_statistics(&self) -> RepositoryResult<RepositoryStatistics>;

    async fn get_session_history(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<HistoryEntry>>;
}
