//! Memory-backed repository.
//!
//! Sessions, checkpoints, history and chunk tasks live in one [`MemoryStore`]
//! behind a single lock, so repository operations are serialized relative to
//! each other.

use crate::env;
use crate::error::{RepositoryError, RepositoryFailure, SessionError};
use crate::repository::query::{SessionPage, SessionQuery};
use crate::repository::traits::{GenerationSessionRepository, RepositoryResult};
use crate::repository::types::{
    BatchDeleteResult, Checkpoint, CheckpointInfo, ChunkTask, ChunkTaskStatus, ChunkTaskUpdate,
    HistoryAction, HistoryEntry, RepositoryConfig, RepositoryStatistics,
};
use crate::session::aggregate::{GenerationSession, SessionTransition};
use crate::session::progress::ProgressData;
use crate::session::state::{CancelReason, SessionState};
use crate::session::types::{CheckpointId, ChunkCoordinate, GenerationSessionId, SessionStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the memory repository holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStore {
    pub sessions: HashMap<GenerationSessionId, GenerationSession>,
    pub checkpoints: HashMap<GenerationSessionId, Vec<Checkpoint>>,
    pub history: HashMap<GenerationSessionId, VecDeque<HistoryEntry>>,
    pub chunk_tasks: HashMap<GenerationSessionId, BTreeMap<Uuid, ChunkTask>>,
}

impl MemoryStore {
    fn session(
        &self,
        operation: &'static str,
        id: GenerationSessionId,
    ) -> RepositoryResult<&GenerationSession> {
        self.sessions
            .get(&id)
            .ok_or_else(|| RepositoryError::not_found(operation, id))
    }

    fn chunk_tasks_with_status(
        &self,
        operation: &'static str,
        session_id: GenerationSessionId,
        status: ChunkTaskStatus,
    ) -> RepositoryResult<Vec<ChunkTask>> {
        self.session(operation, session_id)?;
        Ok(self
            .chunk_tasks
            .get(&session_id)
            .map(|tasks| {
                tasks
                    .values()
                    .filter(|task| task.status == status)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub struct MemoryGenerationSessionRepository {
    store: RwLock<MemoryStore>,
    config: RepositoryConfig,
}

impl MemoryGenerationSessionRepository {
    pub fn new(config: RepositoryConfig) -> Self {
        Self::from_store(MemoryStore::default(), config)
    }

    /// Start from a previously exported store
    pub fn from_store(store: MemoryStore, config: RepositoryConfig) -> Self {
        Self {
            store: RwLock::new(store),
            config,
        }
    }

    pub async fn export_store(&self) -> MemoryStore {
        self.store.read().await.clone()
    }

    pub async fn session_count(&self) -> usize {
        self.store.read().await.sessions.len()
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    fn record(
        &self,
        store: &mut MemoryStore,
        session_id: GenerationSessionId,
        action: HistoryAction,
        details: String,
    ) {
        let history = store.history.entry(session_id).or_default();
        history.push_back(HistoryEntry {
            timestamp: Utc::now(),
            action,
            details,
            actor: self.config.actor.clone(),
        });
        while history.len() > self.config.cleanup.max_history_entries {
            history.pop_front();
        }
    }

    /// Store a transition produced against the current value and log it
    fn commit_transition(
        &self,
        store: &mut MemoryStore,
        transition: &SessionTransition,
        action: HistoryAction,
    ) {
        let session = &transition.session;
        store.sessions.insert(session.id, session.clone());
        self.record(
            store,
            session.id,
            action,
            format!("status {} at version {}", session.status(), session.version),
        );
    }
}

impl Default for MemoryGenerationSessionRepository {
    fn default() -> Self {
        Self::new(RepositoryConfig::default())
    }
}

/// Whether the batches of `state` partition the request exactly
fn partitions_request(state: &SessionState, requested: &[ChunkCoordinate]) -> bool {
    if state.batches.is_empty() {
        return true;
    }
    let mut batched: Vec<ChunkCoordinate> = state
        .batches
        .iter()
        .flat_map(|batch| batch.coordinates.iter().copied())
        .collect();
    let mut requested = requested.to_vec();
    batched.sort();
    requested.sort();
    batched == requested
}

#[async_trait]
impl GenerationSessionRepository for MemoryGenerationSessionRepository {
    async fn create_session(
        &self,
        session: GenerationSession,
    ) -> RepositoryResult<GenerationSession> {
        let mut store = self.store.write().await;
        if store.sessions.contains_key(&session.id) {
            return Err(RepositoryError::new(
                "create_session",
                RepositoryFailure::AlreadyExists(session.id),
            ));
        }

        store.sessions.insert(session.id, session.clone());
        self.record(
            &mut store,
            session.id,
            HistoryAction::Created,
            format!(
                "world {} with {} chunks",
                session.world_generator_id, session.progress.total_chunks
            ),
        );
        debug!("Stored session {}", session.id);
        Ok(session)
    }

    async fn find_by_id(&self, id: GenerationSessionId) -> RepositoryResult<GenerationSession> {
        let store = self.store.read().await;
        store.session("find_by_id", id).cloned()
    }

    async fn find_many_by_ids(
        &self,
        ids: &[GenerationSessionId],
    ) -> RepositoryResult<Vec<GenerationSession>> {
        let store = self.store.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| store.sessions.get(id).cloned())
            .collect())
    }

    async fn find_by_world_id(
        &self,
        world_generator_id: &str,
    ) -> RepositoryResult<Vec<GenerationSession>> {
        let store = self.store.read().await;
        let mut sessions: Vec<GenerationSession> = store
            .sessions
            .values()
            .filter(|session| session.world_generator_id == world_generator_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn find_by_query(&self, query: &SessionQuery) -> RepositoryResult<SessionPage> {
        let store = self.store.read().await;
        Ok(query.apply(store.sessions.values()))
    }

    async fn find_active_sessions(&self) -> RepositoryResult<Vec<GenerationSession>> {
        let store = self.store.read().await;
        let mut sessions: Vec<GenerationSession> = store
            .sessions
            .values()
            .filter(|session| session.status().is_active())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn update_session(
        &self,
        session: GenerationSession,
    ) -> RepositoryResult<GenerationSession> {
        let mut store = self.store.write().await;
        let stored = store.session("update_session", session.id)?;

        let expected = stored.version + 1;
        if session.version != expected {
            warn!(
                "Rejected stale write for session {}: expected version {}, got {}",
                session.id, expected, session.version
            );
            return Err(RepositoryError::new(
                "update_session",
                RepositoryFailure::VersionConflict {
                    session_id: session.id,
                    expected,
                    actual: session.version,
                },
            ));
        }

        let mut session = session;
        session.last_activity = session.last_activity.max(stored.last_activity);
        store.sessions.insert(session.id, session.clone());
        self.record(
            &mut store,
            session.id,
            HistoryAction::Updated,
            format!("status {} at version {}", session.status(), session.version),
        );
        Ok(session)
    }

    async fn delete_session(&self, id: GenerationSessionId) -> RepositoryResult<()> {
        let mut store = self.store.write().await;
        if store.sessions.remove(&id).is_none() {
            return Err(RepositoryError::not_found("delete_session", id));
        }
        store.checkpoints.remove(&id);
        store.history.remove(&id);
        store.chunk_tasks.remove(&id);
        info!("Deleted session {}", id);
        Ok(())
    }

    async fn delete_sessions(
        &self,
        ids: &[GenerationSessionId],
    ) -> RepositoryResult<BatchDeleteResult> {
        let mut result = BatchDeleteResult::default();
        for id in ids {
            result.total_processed += 1;
            match self.delete_session(*id).await {
                Ok(()) => result.successful.push(*id),
                Err(e) => {
                    warn!("Failed to delete session {}: {}", id, e);
                    result.failed.push((*id, e.to_string()));
                }
            }
        }
        Ok(result)
    }

    async fn update_session_state(
        &self,
        id: GenerationSessionId,
        state: SessionState,
    ) -> RepositoryResult<GenerationSession> {
        let mut store = self.store.write().await;
        let current = store.session("update_session_state", id)?;

        if !partitions_request(&state, &current.request.coordinates) {
            return Err(RepositoryError::new(
                "update_session_state",
                RepositoryFailure::InvalidData(
                    "batches do not partition the requested coordinates".to_string(),
                ),
            ));
        }

        let mut next = current.advance(Utc::now());
        let status = state.status;
        next.state = state;
        store.sessions.insert(id, next.clone());
        self.record(
            &mut store,
            id,
            HistoryAction::StateChanged,
            format!("status {} at version {}", status, next.version),
        );
        Ok(next)
    }

    async fn update_progress(
        &self,
        id: GenerationSessionId,
        progress: ProgressData,
    ) -> RepositoryResult<GenerationSession> {
        let mut store = self.store.write().await;
        let current = store.session("update_progress", id)?;

        let settled = progress.completed_chunks + progress.failed_chunks + progress.pending_chunks;
        if progress.total_chunks != current.progress.total_chunks
            || settled != progress.total_chunks
        {
            return Err(RepositoryError::new(
                "update_progress",
                SessionError::InconsistentProgress {
                    total: current.progress.total_chunks,
                    completed: progress.completed_chunks,
                    failed: progress.failed_chunks,
                    pending: progress.pending_chunks,
                },
            ));
        }

        let mut next = current.advance(Utc::now());
        next.progress = progress;
        store.sessions.insert(id, next.clone());
        self.record(
            &mut store,
            id,
            HistoryAction::ProgressUpdated,
            format!(
                "{:.1}% at version {}",
                next.progress.overall_progress * 100.0,
                next.version
            ),
        );
        Ok(next)
    }

    async fn pause_session(
        &self,
        id: GenerationSessionId,
        reason: &str,
    ) -> RepositoryResult<SessionTransition> {
        let mut store = self.store.write().await;
        let transition = store
            .session("pause_session", id)?
            .pause(reason, Utc::now())
            .map_err(|e| RepositoryError::new("pause_session", e))?;
        self.commit_transition(&mut store, &transition, HistoryAction::Paused);
        Ok(transition)
    }

    async fn resume_session(&self, id: GenerationSessionId) -> RepositoryResult<SessionTransition> {
        let mut store = self.store.write().await;
        let transition = store
            .session("resume_session", id)?
            .resume(Utc::now())
            .map_err(|e| RepositoryError::new("resume_session", e))?;
        self.commit_transition(&mut store, &transition, HistoryAction::Resumed);
        Ok(transition)
    }

    async fn cancel_session(
        &self,
        id: GenerationSessionId,
        reason: CancelReason,
    ) -> RepositoryResult<SessionTransition> {
        let mut store = self.store.write().await;
        let transition = store
            .session("cancel_session", id)?
            .cancel(reason, Utc::now())
            .map_err(|e| RepositoryError::new("cancel_session", e))?;
        self.commit_transition(&mut store, &transition, HistoryAction::Cancelled);
        Ok(transition)
    }

    async fn add_chunk_task(&self, task: ChunkTask) -> RepositoryResult<()> {
        let mut store = self.store.write().await;
        store.session("add_chunk_task", task.session_id)?;

        let tasks = store.chunk_tasks.entry(task.session_id).or_default();
        if tasks.contains_key(&task.id) {
            return Err(RepositoryError::new(
                "add_chunk_task",
                RepositoryFailure::ChunkTaskExists {
                    session_id: task.session_id,
                    task_id: task.id,
                },
            ));
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    async fn update_chunk_task(
        &self,
        session_id: GenerationSessionId,
        task_id: Uuid,
        update: ChunkTaskUpdate,
    ) -> RepositoryResult<ChunkTask> {
        let mut store = self.store.write().await;
        store.session("update_chunk_task", session_id)?;

        let task = store
            .chunk_tasks
            .get_mut(&session_id)
            .and_then(|tasks| tasks.get_mut(&task_id))
            .ok_or_else(|| {
                RepositoryError::new(
                    "update_chunk_task",
                    RepositoryFailure::ChunkTaskNotFound {
                        session_id,
                        task_id,
                    },
                )
            })?;

        if let Some(status) = update.status {
            task.status = status;
        }
        task.attempts += update.add_attempts;
        if update.last_error.is_some() {
            task.last_error = update.last_error;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn get_completed_chunks(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<ChunkTask>> {
        let store = self.store.read().await;
        store.chunk_tasks_with_status(
            "get_completed_chunks",
            session_id,
            ChunkTaskStatus::Completed,
        )
    }

    async fn get_failed_chunks(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<ChunkTask>> {
        let store = self.store.read().await;
        store.chunk_tasks_with_status("get_failed_chunks", session_id, ChunkTaskStatus::Failed)
    }

    async fn get_pending_chunks(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<ChunkTask>> {
        let store = self.store.read().await;
        store.chunk_tasks_with_status("get_pending_chunks", session_id, ChunkTaskStatus::Pending)
    }

    async fn create_checkpoint(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<CheckpointId> {
        let mut store = self.store.write().await;
        let session = store.session("create_checkpoint", session_id)?;

        let session_snapshot = serde_json::to_string(session)
            .map_err(|e| RepositoryError::storage("create_checkpoint", e))?;
        let info = CheckpointInfo {
            id: format!("{}{}", env::snapshot::CHECKPOINT_ID_PREFIX, Uuid::new_v4()),
            session_id,
            created_at: Utc::now(),
            size_bytes: session_snapshot.len() as u64,
            chunk_count: session.progress.total_chunks,
            session_version: session.version,
            session_status: session.status(),
        };
        let checkpoint_id = info.id.clone();

        let checkpoints = store.checkpoints.entry(session_id).or_default();
        checkpoints.push(Checkpoint {
            info,
            session_snapshot,
        });
        let max_checkpoints = self.config.cleanup.max_checkpoints_per_session.max(1);
        if checkpoints.len() > max_checkpoints {
            let excess = checkpoints.len() - max_checkpoints;
            checkpoints.drain(..excess);
            debug!("Dropped {} old checkpoints of session {}", excess, session_id);
        }

        self.record(
            &mut store,
            session_id,
            HistoryAction::CheckpointCreated,
            checkpoint_id.clone(),
        );
        info!("Created checkpoint {} for session {}", checkpoint_id, session_id);
        Ok(checkpoint_id)
    }

    async fn restore_from_checkpoint(
        &self,
        session_id: GenerationSessionId,
        checkpoint_id: &str,
    ) -> RepositoryResult<GenerationSession> {
        let mut store = self.store.write().await;
        let current = store.session("restore_from_checkpoint", session_id)?;
        let (version, last_activity) = (current.version, current.last_activity);

        let checkpoint = store
            .checkpoints
            .get(&session_id)
            .and_then(|checkpoints| checkpoints.iter().find(|c| c.info.id == checkpoint_id))
            .ok_or_else(|| {
                RepositoryError::new(
                    "restore_from_checkpoint",
                    RepositoryFailure::CheckpointNotFound {
                        session_id,
                        checkpoint_id: checkpoint_id.to_string(),
                    },
                )
            })?;

        let mut restored: GenerationSession = serde_json::from_str(&checkpoint.session_snapshot)
            .map_err(|e| {
                RepositoryError::new(
                    "restore_from_checkpoint",
                    RepositoryFailure::InvalidData(e.to_string()),
                )
            })?;

        // The restored value is a new write: versions keep increasing
        restored.version = version + 1;
        restored.last_activity = last_activity.max(Utc::now());
        store.sessions.insert(session_id, restored.clone());
        self.record(
            &mut store,
            session_id,
            HistoryAction::CheckpointRestored,
            format!("{} at version {}", checkpoint_id, restored.version),
        );

        info!("Restored session {} from checkpoint {}", session_id, checkpoint_id);
        Ok(restored)
    }

    async fn list_checkpoints(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<CheckpointInfo>> {
        let store = self.store.read().await;
        store.session("list_checkpoints", session_id)?;
        Ok(store
            .checkpoints
            .get(&session_id)
            .map(|checkpoints| checkpoints.iter().map(|c| c.info.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_statistics(&self) -> RepositoryResult<RepositoryStatistics> {
        let store = self.store.read().await;
        let mut statistics = RepositoryStatistics {
            total_sessions: store.sessions.len(),
            total_checkpoints: store.checkpoints.values().map(Vec::len).sum(),
            ..Default::default()
        };

        let mut timed_sessions = 0u64;
        let mut total_session_time_ms = 0u64;
        let mut failed_sessions = 0usize;

        for session in store.sessions.values() {
            *statistics
                .sessions_by_status
                .entry(session.status())
                .or_insert(0) += 1;
            if session.status().is_active() {
                statistics.active_sessions += 1;
            }
            if session.status() == SessionStatus::Failed {
                failed_sessions += 1;
            }
            statistics.total_chunks_generated += u64::from(session.progress.completed_chunks);

            if let (Some(started), Some(completed)) = (session.started_at, session.completed_at) {
                timed_sessions += 1;
                total_session_time_ms +=
                    completed.signed_duration_since(started).num_milliseconds().max(0) as u64;
            }
        }

        if timed_sessions > 0 {
            statistics.average_completion_time_ms =
                Some(total_session_time_ms as f64 / timed_sessions as f64);
        }
        if total_session_time_ms > 0 {
            statistics.average_throughput =
                statistics.total_chunks_generated as f64 * 1000.0 / total_session_time_ms as f64;
        }
        if statistics.total_sessions > 0 {
            statistics.failure_rate = failed_sessions as f64 / statistics.total_sessions as f64;
        }

        Ok(statistics)
    }

    async fn get_session_history(
        &self,
        session_id: GenerationSessionId,
    ) -> RepositoryResult<Vec<HistoryEntry>> {
        let store = self.store.read().await;
        store.session("get_session_history", session_id)?;
        Ok(store
            .history
            .get(&session_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default())
    }
}
