//! Session status machine and batch sub-machines.
//!
//! ```text
//! created -> running <-> paused
//! running | paused -> completed | failed | cancelled
//! created -> cancelled | failed
//!
//! batch: pending -> running -> completed | failed | retrying -> pending
//! ```
//!
//! Every transition is a pure function returning a new [`SessionState`].

use crate::error::SessionError;
use crate::session::types::{
    BatchId, BatchStatus, ChunkBatch, ChunkCoordinate, GenerationSessionId, PriorityPolicy,
    SessionStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Why a session was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    SessionTimeout,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserRequested => f.write_str("user requested"),
            CancelReason::SessionTimeout => f.write_str("session timeout"),
            CancelReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    Failed { reason: String },
    Cancelled { reason: CancelReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub pause_reason: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
    /// Batches waiting for their backoff to elapse, in failure order
    pub retry_queue: Vec<BatchId>,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub batches: Vec<ChunkBatch>,
    pub execution_context: ExecutionContext,
}

/// Partition `coordinates` into batches of at most `batch_size`
///
/// Batches keep request order. A request carries a single priority, so there
/// is nothing to reorder by even when priority queuing is enabled.
pub fn create_chunk_batches(
    coordinates: &[ChunkCoordinate],
    batch_size: u32,
    priority: u8,
    priority_policy: &PriorityPolicy,
    now: DateTime<Utc>,
) -> Vec<ChunkBatch> {
    if priority_policy.enable_priority_queuing && priority >= priority_policy.priority_threshold {
        debug!(
            "High priority request ({} >= {}), batches keep request order",
            priority, priority_policy.priority_threshold
        );
    }

    coordinates
        .chunks(batch_size.max(1) as usize)
        .map(|chunk| ChunkBatch::new(chunk.to_vec(), priority, now))
        .collect()
}

impl SessionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: SessionStatus::Created,
            batches: Vec::new(),
            execution_context: ExecutionContext {
                pause_reason: None,
                paused_at: None,
                termination_reason: None,
                retry_queue: Vec::new(),
                last_transition_at: now,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start(
        &self,
        session_id: GenerationSessionId,
        batches: Vec<ChunkBatch>,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require(session_id, "start", &[SessionStatus::Created])?;

        let mut next = self.clone();
        next.status = SessionStatus::Running;
        next.batches = batches;
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    pub fn pause(
        &self,
        session_id: GenerationSessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require(session_id, "pause", &[SessionStatus::Running])?;

        let mut next = self.clone();
        next.status = SessionStatus::Paused;
        next.execution_context.pause_reason = Some(reason.to_string());
        next.execution_context.paused_at = Some(now);
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    pub fn resume(
        &self,
        session_id: GenerationSessionId,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require(session_id, "resume", &[SessionStatus::Paused])?;

        let mut next = self.clone();
        next.status = SessionStatus::Running;
        next.execution_context.pause_reason = None;
        next.execution_context.paused_at = None;
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    /// Finalize a session whose batches have all settled
    pub fn complete(
        &self,
        session_id: GenerationSessionId,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require(
            session_id,
            "complete",
            &[SessionStatus::Running, SessionStatus::Paused],
        )?;
        if !self.all_batches_terminal() {
            return Err(SessionError::InvalidTransition {
                session_id,
                operation: "complete with unsettled batches",
                status: self.status,
            });
        }

        Ok(self.terminate(SessionStatus::Completed, TerminationReason::Completed, now))
    }

    pub fn fail(
        &self,
        session_id: GenerationSessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        if self.is_terminal() {
            return Err(SessionError::InvalidTransition {
                session_id,
                operation: "fail",
                status: self.status,
            });
        }

        Ok(self.terminate(
            SessionStatus::Failed,
            TerminationReason::Failed {
                reason: reason.to_string(),
            },
            now,
        ))
    }

    pub fn cancel(
        &self,
        session_id: GenerationSessionId,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require(
            session_id,
            "cancel",
            &[
                SessionStatus::Created,
                SessionStatus::Running,
                SessionStatus::Paused,
            ],
        )?;

        Ok(self.terminate(
            SessionStatus::Cancelled,
            TerminationReason::Cancelled { reason },
            now,
        ))
    }

    /// Hand a pending batch to a worker
    pub fn begin_batch(
        &self,
        session_id: GenerationSessionId,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require_accepting_batches(session_id)?;
        self.require(session_id, "begin batch in", &[SessionStatus::Running])?;

        let mut next = self.clone();
        let batch = next.batch_mut(session_id, batch_id)?;
        if batch.status != BatchStatus::Pending {
            return Err(SessionError::InvalidBatchTransition {
                batch_id,
                operation: "begin",
                status: batch.status,
            });
        }
        batch.status = BatchStatus::Running;
        batch.started_at = Some(now);
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    pub fn complete_batch(
        &self,
        session_id: GenerationSessionId,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require_accepting_batches(session_id)?;

        let mut next = self.clone();
        let batch = next.batch_mut(session_id, batch_id)?;
        if batch.status.is_terminal() {
            return Err(SessionError::InvalidBatchTransition {
                batch_id,
                operation: "complete",
                status: batch.status,
            });
        }
        batch.status = BatchStatus::Completed;
        batch.finished_at = Some(now);
        batch.last_error = None;
        next.execution_context
            .retry_queue
            .retain(|queued| *queued != batch_id);
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    /// Record a failed attempt; `will_retry` selects retrying over failed
    pub fn fail_batch(
        &self,
        session_id: GenerationSessionId,
        batch_id: BatchId,
        will_retry: bool,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require_accepting_batches(session_id)?;

        let mut next = self.clone();
        let batch = next.batch_mut(session_id, batch_id)?;
        if batch.status.is_terminal() {
            return Err(SessionError::InvalidBatchTransition {
                batch_id,
                operation: "fail",
                status: batch.status,
            });
        }
        batch.attempts += 1;
        batch.last_error = Some(cause.to_string());
        if will_retry {
            batch.status = BatchStatus::Retrying;
            if !next.execution_context.retry_queue.contains(&batch_id) {
                next.execution_context.retry_queue.push(batch_id);
            }
        } else {
            batch.status = BatchStatus::Failed;
            batch.finished_at = Some(now);
            next.execution_context
                .retry_queue
                .retain(|queued| *queued != batch_id);
        }
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    /// Return a retrying batch to the pending pool
    pub fn requeue_batch(
        &self,
        session_id: GenerationSessionId,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        self.require_accepting_batches(session_id)?;

        let mut next = self.clone();
        let batch = next.batch_mut(session_id, batch_id)?;
        if batch.status != BatchStatus::Retrying {
            return Err(SessionError::InvalidBatchTransition {
                batch_id,
                operation: "requeue",
                status: batch.status,
            });
        }
        batch.status = BatchStatus::Pending;
        batch.started_at = None;
        next.execution_context
            .retry_queue
            .retain(|queued| *queued != batch_id);
        next.execution_context.last_transition_at = now;
        Ok(next)
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<&ChunkBatch> {
        self.batches.iter().find(|batch| batch.id == batch_id)
    }

    pub fn batches_with_status(&self, status: BatchStatus) -> impl Iterator<Item = &ChunkBatch> {
        self.batches
            .iter()
            .filter(move |batch| batch.status == status)
    }

    /// Ids of batches ready to be handed to a worker, in order
    pub fn pending_batch_ids(&self) -> Vec<BatchId> {
        self.batches_with_status(BatchStatus::Pending)
            .map(|batch| batch.id)
            .collect()
    }

    pub fn count_with_status(&self, status: BatchStatus) -> usize {
        self.batches_with_status(status).count()
    }

    pub fn all_batches_terminal(&self) -> bool {
        self.batches.iter().all(|batch| batch.status.is_terminal())
    }

    /// Coordinates of every batch in `status`
    pub fn coordinates_with_status(&self, status: BatchStatus) -> Vec<ChunkCoordinate> {
        self.batches_with_status(status)
            .flat_map(|batch| batch.coordinates.iter().copied())
            .collect()
    }

    pub fn chunk_count_with_status(&self, status: BatchStatus) -> u32 {
        self.batches_with_status(status)
            .map(ChunkBatch::chunk_count)
            .sum()
    }

    fn terminate(
        &self,
        status: SessionStatus,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.execution_context.termination_reason = Some(reason);
        next.execution_context.retry_queue.clear();
        next.execution_context.last_transition_at = now;
        next
    }

    fn require(
        &self,
        session_id: GenerationSessionId,
        operation: &'static str,
        allowed: &[SessionStatus],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                session_id,
                operation,
                status: self.status,
            })
        }
    }

    fn require_accepting_batches(
        &self,
        session_id: GenerationSessionId,
    ) -> Result<(), SessionError> {
        if self.is_terminal() {
            return Err(SessionError::SessionTerminal {
                session_id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn batch_mut(
        &mut self,
        session_id: GenerationSessionId,
        batch_id: BatchId,
    ) -> Result<&mut ChunkBatch, SessionError> {
        self.batches
            .iter_mut()
            .find(|batch| batch.id == batch_id)
            .ok_or(SessionError::BatchNotFound {
                session_id,
                batch_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(n: i32) -> Vec<ChunkCoordinate> {
        (0..n).map(|i| ChunkCoordinate::new(i, -i)).collect()
    }

    #[test]
    fn test_create_chunk_batches_partitions_in_order() {
        let coordinates = coords(100);
        let batches =
            create_chunk_batches(&coordinates, 16, 5, &PriorityPolicy::default(), Utc::now());

        assert_eq!(batches.len(), 7);
        assert!(batches[..6].iter().all(|b| b.chunk_count() == 16));
        assert_eq!(batches[6].chunk_count(), 4);

        let flattened: Vec<_> = batches
            .iter()
            .flat_map(|b| b.coordinates.iter().copied())
            .collect();
        assert_eq!(flattened, coordinates);
    }

    #[test]
    fn test_batch_sub_machine() {
        let id = GenerationSessionId::new_v4();
        let now = Utc::now();
        let batches = create_chunk_batches(&coords(4), 2, 5, &PriorityPolicy::default(), now);
        let batch_id = batches[0].id;

        let state = SessionState::new(now).start(id, batches, now).unwrap();
        let state = state.begin_batch(id, batch_id, now).unwrap();
        assert_eq!(state.batch(batch_id).unwrap().status, BatchStatus::Running);

        let state = state.fail_batch(id, batch_id, true, "noise", now).unwrap();
        let batch = state.batch(batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Retrying);
        assert_eq!(batch.attempts, 1);
        assert_eq!(state.execution_context.retry_queue, vec![batch_id]);

        // Retrying batches cannot be started before being requeued
        assert!(matches!(
            state.begin_batch(id, batch_id, now),
            Err(SessionError::InvalidBatchTransition { .. })
        ));

        let state = state.requeue_batch(id, batch_id, now).unwrap();
        assert_eq!(state.batch(batch_id).unwrap().status, BatchStatus::Pending);
        assert!(state.execution_context.retry_queue.is_empty());

        let state = state.complete_batch(id, batch_id, now).unwrap();
        assert!(matches!(
            state.complete_batch(id, batch_id, now),
            Err(SessionError::InvalidBatchTransition { .. })
        ));
    }

    #[test]
    fn test_terminal_state_rejects_batch_transitions() {
        let id = GenerationSessionId::new_v4();
        let now = Utc::now();
        let batches = create_chunk_batches(&coords(2), 1, 5, &PriorityPolicy::default(), now);
        let batch_id = batches[0].id;

        let state = SessionState::new(now)
            .start(id, batches, now)
            .unwrap()
            .cancel(id, CancelReason::UserRequested, now)
            .unwrap();

        assert_eq!(state.status, SessionStatus::Cancelled);
        assert!(matches!(
            state.complete_batch(id, batch_id, now),
            Err(SessionError::SessionTerminal { .. })
        ));
        assert!(state.resume(id, now).is_err());
        assert!(state.cancel(id, CancelReason::Shutdown, now).is_err());
    }

    #[test]
    fn test_complete_requires_settled_batches() {
        let id = GenerationSessionId::new_v4();
        let now = Utc::now();
        let batches = create_chunk_batches(&coords(2), 1, 5, &PriorityPolicy::default(), now);

        let state = SessionState::new(now).start(id, batches, now).unwrap();
        assert!(state.complete(id, now).is_err());
    }
}
