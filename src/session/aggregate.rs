//! The `GenerationSession` aggregate root.
//!
//! All mutation goes through the operations below. Each one is pure: it takes
//! the current value and returns a [`SessionTransition`] holding the next value
//! plus the events to publish, or a typed error leaving the input untouched.
//! Every successful operation bumps `version` by exactly one and never moves
//! `last_activity` backwards.

use crate::error::{CreationError, SessionError, ValidationError};
use crate::session::error_handling::{
    SessionErrorRecord, calculate_retry_delay, should_retry_batch,
};
use crate::session::events::{CompletionStatistics, SessionEvent};
use crate::session::generator::GenerationError;
use crate::session::progress::{GenerationStage, ProgressData};
use crate::session::state::{CancelReason, SessionState, create_chunk_batches};
use crate::session::types::{
    BatchId, BatchStatus, ChunkBatch, GenerationRequest, GenerationSessionId, RetryPolicy,
    SessionConfiguration, SessionConfigurationOverrides, SessionStatus, WorldGeneratorId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: GenerationSessionId,
    pub world_generator_id: WorldGeneratorId,
    pub configuration: SessionConfiguration,
    pub request: GenerationRequest,
    pub state: SessionState,
    pub progress: ProgressData,
    pub error_history: Vec<SessionErrorRecord>,
    /// Optimistic-concurrency token
    pub version: u64,
    /// Generation attempt, bumped each time recovery reopens the session
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

/// Result of a successful aggregate operation
#[derive(Debug, Clone)]
pub struct SessionTransition {
    pub session: GenerationSession,
    pub events: Vec<SessionEvent>,
}

impl SessionTransition {
    fn new(session: GenerationSession, events: Vec<SessionEvent>) -> Self {
        Self { session, events }
    }
}

/// Which batches a recovery attempt re-runs and how
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub requeue: HashSet<BatchId>,
    pub retry_policy: RetryPolicy,
}

impl GenerationSession {
    /// Validate `request` and build a session in `created` status
    pub fn create(
        id: GenerationSessionId,
        world_generator_id: impl Into<WorldGeneratorId>,
        request: GenerationRequest,
        overrides: Option<&SessionConfigurationOverrides>,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, CreationError> {
        Self::create_with_defaults(
            id,
            world_generator_id,
            request,
            &SessionConfiguration::default(),
            overrides,
            now,
        )
    }

    /// Like [`GenerationSession::create`] with `overrides` merged over `defaults`
    pub fn create_with_defaults(
        id: GenerationSessionId,
        world_generator_id: impl Into<WorldGeneratorId>,
        request: GenerationRequest,
        defaults: &SessionConfiguration,
        overrides: Option<&SessionConfigurationOverrides>,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, CreationError> {
        let world_generator_id = world_generator_id.into();
        let configuration = match overrides {
            Some(overrides) => defaults.merged(overrides),
            None => defaults.clone(),
        };

        let mut errors = Vec::new();
        if world_generator_id.trim().is_empty() {
            errors.push(ValidationError::EmptyWorldGeneratorId);
        }
        errors.extend(request.validate());
        errors.extend(configuration.validate());
        if !errors.is_empty() {
            warn!("Rejected session {}: {} validation errors", id, errors.len());
            return Err(CreationError {
                session_id: id,
                errors,
            });
        }

        let total_chunks = request.coordinates.len() as u32;
        let events = vec![SessionEvent::SessionCreated {
            world_generator_id: world_generator_id.clone(),
            total_chunks,
            priority: request.priority,
        }];

        let session = GenerationSession {
            id,
            world_generator_id,
            configuration,
            request,
            state: SessionState::new(now),
            progress: ProgressData::new(total_chunks, now),
            error_history: Vec::new(),
            version: 1,
            attempt: 1,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_activity: now,
        };

        info!(
            "Created session {} for world {} with {} chunks",
            session.id, session.world_generator_id, total_chunks
        );
        Ok(SessionTransition::new(session, events))
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Partition coordinates into batches and begin running
    pub fn start(&self, now: DateTime<Utc>) -> Result<SessionTransition, SessionError> {
        let batches = create_chunk_batches(
            &self.request.coordinates,
            self.configuration.chunk_batch_size,
            self.request.priority,
            &self.configuration.priority_policy,
            now,
        );
        let batch_count = batches.len();

        let mut next = self.advance(now);
        next.state = self.state.start(self.id, batches, now)?;
        next.progress = self.progress.start_tracking(now);
        next.progress.statistics.total_batches = batch_count as u32;
        next.started_at = Some(now);

        info!("Started session {} with {} batches", self.id, batch_count);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::SessionStarted {
                batch_count,
                total_chunks: self.progress.total_chunks,
            }],
        ))
    }

    pub fn begin_batch(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let mut next = self.advance(now);
        next.state = self.state.begin_batch(self.id, batch_id, now)?;

        let chunk_count = next
            .state
            .batch(batch_id)
            .map(|batch| batch.chunk_count())
            .unwrap_or(0);
        debug!("Session {} began batch {}", self.id, batch_id);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::BatchStarted {
                batch_id,
                chunk_count,
            }],
        ))
    }

    /// Settle a batch with `chunks_generated` successes
    ///
    /// Chunks of the batch that produced no result are counted as failed so a
    /// completed batch always settles all of its coordinates.
    pub fn complete_batch(
        &self,
        batch_id: BatchId,
        chunks_generated: u32,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let batch = self.find_batch(batch_id)?;
        let chunk_count = batch.chunk_count();
        if chunks_generated > chunk_count {
            return Err(SessionError::ProgressOverflow {
                requested: chunks_generated,
                pending: chunk_count,
            });
        }

        let mut next = self.advance(now);
        next.state = self.state.complete_batch(self.id, batch_id, now)?;
        next.progress = self.progress.update_progress(
            chunks_generated,
            chunk_count - chunks_generated,
            now,
        )?;
        next.progress.statistics.completed_batches += 1;

        let duration_ms = next.state.batch(batch_id).and_then(|batch| batch.duration_ms());
        let mut events = vec![SessionEvent::BatchCompleted {
            batch_id,
            chunk_count: chunks_generated,
            duration_ms,
        }];

        debug!(
            "Session {} completed batch {} ({}/{} chunks)",
            self.id, batch_id, next.progress.completed_chunks, next.progress.total_chunks
        );

        if next.progress.is_completed() {
            events.push(next.finalize(now)?);
        } else {
            events.push(SessionEvent::ProgressUpdated {
                progress: next.progress.snapshot(),
            });
        }
        Ok(SessionTransition::new(next, events))
    }

    /// Record a failed batch attempt and decide whether it is retried
    pub fn fail_batch(
        &self,
        batch_id: BatchId,
        error: &GenerationError,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let batch = self.find_batch(batch_id)?;
        let chunk_count = batch.chunk_count();
        let retry_count = batch.attempts + 1;

        let record = SessionErrorRecord::from_generation_error(batch_id, error, retry_count, now);
        let policy = &self.configuration.retry_policy;
        let will_retry = should_retry_batch(policy, &record);
        let retry_delay_ms = will_retry.then(|| calculate_retry_delay(policy, retry_count));

        let mut next = self.advance(now);
        next.state = self
            .state
            .fail_batch(self.id, batch_id, will_retry, &record.cause, now)?;
        next.error_history.push(record.clone());

        if will_retry {
            next.progress.statistics.retried_batches += 1;
            info!(
                "Session {} batch {} failed ({}), retry {} in {}ms",
                self.id,
                batch_id,
                record.category,
                retry_count,
                retry_delay_ms.unwrap_or(0)
            );
        } else {
            next.progress = self.progress.update_progress(0, chunk_count, now)?;
            next.progress.statistics.failed_batches += 1;
            warn!(
                "Session {} batch {} permanently failed after {} attempts: {}",
                self.id, batch_id, retry_count, record.cause
            );
        }

        let mut events = vec![SessionEvent::BatchFailed {
            batch_id,
            error: record,
            will_retry,
            retry_delay_ms,
        }];

        if !will_retry {
            if next.progress.is_completed() {
                events.push(next.finalize(now)?);
            } else {
                events.push(SessionEvent::ProgressUpdated {
                    progress: next.progress.snapshot(),
                });
            }
        }
        Ok(SessionTransition::new(next, events))
    }

    /// Move a retrying batch back to pending once its backoff has elapsed
    pub fn requeue_batch(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let mut next = self.advance(now);
        next.state = self.state.requeue_batch(self.id, batch_id, now)?;

        let attempt = next
            .state
            .batch(batch_id)
            .map(|batch| batch.attempts + 1)
            .unwrap_or(1);
        debug!("Session {} requeued batch {} for attempt {}", self.id, batch_id, attempt);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::BatchRetried { batch_id, attempt }],
        ))
    }

    pub fn pause(
        &self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let reason = reason.into();
        let mut next = self.advance(now);
        next.state = self.state.pause(self.id, &reason, now)?;
        next.progress = self.progress.pause_tracking(now);

        info!("Paused session {}: {}", self.id, reason);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::SessionPaused { reason }],
        ))
    }

    pub fn resume(&self, now: DateTime<Utc>) -> Result<SessionTransition, SessionError> {
        let mut next = self.advance(now);
        next.state = self.state.resume(self.id, now)?;
        let (progress, paused_duration_ms) = self.progress.resume_tracking(now);
        next.progress = progress;

        info!("Resumed session {} after {}ms", self.id, paused_duration_ms);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::SessionResumed { paused_duration_ms }],
        ))
    }

    pub fn cancel(
        &self,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let mut next = self.advance(now);
        next.state = self.state.cancel(self.id, reason, now)?;
        next.progress = self.progress.pause_tracking(now);

        info!("Cancelled session {}: {}", self.id, reason);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::SessionCancelled { reason }],
        ))
    }

    pub fn fail(
        &self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        let reason = reason.into();
        let mut next = self.advance(now);
        next.state = self.state.fail(self.id, &reason, now)?;
        next.progress = self.progress.pause_tracking(now);

        warn!("Session {} failed: {}", self.id, reason);
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::SessionFailed { reason }],
        ))
    }

    /// Explicitly finalize a session whose chunks have all settled
    pub fn complete(&self, now: DateTime<Utc>) -> Result<SessionTransition, SessionError> {
        if !self.progress.is_completed() {
            return Err(SessionError::InvalidTransition {
                session_id: self.id,
                operation: "complete with pending chunks",
                status: self.state.status,
            });
        }

        let mut next = self.advance(now);
        let event = next.finalize(now)?;
        Ok(SessionTransition::new(next, vec![event]))
    }

    /// Build the next generation attempt of a failed or cancelled session
    ///
    /// Batches in `plan.requeue` go back to pending with a fresh attempt count.
    /// Every other unsettled batch is given up as failed. The result is paused
    /// so the caller decides when to resume it.
    pub fn reopen_for_recovery(
        &self,
        plan: &RecoveryPlan,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionTransition, SessionError> {
        if !matches!(
            self.state.status,
            SessionStatus::Failed | SessionStatus::Cancelled
        ) {
            return Err(SessionError::InvalidTransition {
                session_id: self.id,
                operation: "recover",
                status: self.state.status,
            });
        }

        let mut next = self.advance(now);
        next.attempt = self.attempt + 1;
        next.completed_at = None;
        next.configuration.retry_policy = plan.retry_policy.clone();

        let mut requeued = 0;
        let mut skipped = 0;
        for batch in next.state.batches.iter_mut() {
            if plan.requeue.contains(&batch.id) && batch.status != BatchStatus::Completed {
                batch.status = BatchStatus::Pending;
                batch.attempts = 0;
                batch.started_at = None;
                batch.finished_at = None;
                requeued += 1;
            } else if !batch.status.is_terminal() {
                batch.status = BatchStatus::Failed;
                batch.finished_at = Some(now);
                skipped += 1;
            } else if batch.status == BatchStatus::Failed {
                skipped += 1;
            }
        }

        next.state.status = SessionStatus::Paused;
        next.state.execution_context.termination_reason = None;
        next.state.execution_context.retry_queue.clear();
        next.state.execution_context.pause_reason = Some(reason.to_string());
        next.state.execution_context.paused_at = Some(now);
        next.state.execution_context.last_transition_at = now;

        // Completed chunks stay completed; everything not requeued is given up
        let completed = self.progress.completed_chunks;
        let pending = next.state.chunk_count_with_status(BatchStatus::Pending);
        let failed = self.progress.total_chunks.saturating_sub(completed + pending);
        let mut progress = self
            .progress
            .pause_tracking(now)
            .from_counts(completed, failed, pending)?;
        progress.timing.paused_at = Some(now);
        progress.statistics.completed_batches =
            next.state.count_with_status(BatchStatus::Completed) as u32;
        progress.statistics.failed_batches =
            next.state.count_with_status(BatchStatus::Failed) as u32;
        progress.estimated_time_remaining_ms = None;
        next.progress = progress.with_stage(GenerationStage::Generating, now);

        info!(
            "Reopened session {} as attempt {}: {} batches requeued, {} skipped",
            self.id, next.attempt, requeued, skipped
        );
        Ok(SessionTransition::new(
            next,
            vec![SessionEvent::SessionRecovered {
                attempt: self.attempt + 1,
                requeued_batches: requeued,
                skipped_batches: skipped,
            }],
        ))
    }

    /// Equality ignoring the concurrency token and activity timestamp
    pub fn same_state_as(&self, other: &GenerationSession) -> bool {
        let mut left = self.clone();
        left.version = other.version;
        left.last_activity = other.last_activity;
        left == *other
    }

    fn find_batch(&self, batch_id: BatchId) -> Result<&ChunkBatch, SessionError> {
        self.state.batch(batch_id).ok_or(SessionError::BatchNotFound {
            session_id: self.id,
            batch_id,
        })
    }

    /// Copy with the next version and a non-decreasing activity timestamp
    pub(crate) fn advance(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.last_activity = self.last_activity.max(now);
        next
    }

    /// Transition to completed and build the completion event
    fn finalize(&mut self, now: DateTime<Utc>) -> Result<SessionEvent, SessionError> {
        self.state = self.state.complete(self.id, now)?;
        self.progress = self
            .progress
            .pause_tracking(now)
            .with_stage(GenerationStage::Finalizing, now)
            .with_stage(GenerationStage::Completed, now);
        self.completed_at = Some(now);

        let total_duration_ms = self
            .started_at
            .map(|started| now.signed_duration_since(started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let active_ms = self.progress.timing.accumulated_active_ms;
        let average_chunks_per_second = if active_ms > 0 {
            self.progress.completed_chunks as f64 * 1000.0 / active_ms as f64
        } else {
            0.0
        };

        let statistics = CompletionStatistics {
            total_chunks: self.progress.total_chunks,
            completed_chunks: self.progress.completed_chunks,
            failed_chunks: self.progress.failed_chunks,
            total_batches: self.progress.statistics.total_batches,
            failed_batches: self.progress.statistics.failed_batches,
            retried_batches: self.progress.statistics.retried_batches,
            error_count: self.error_history.len(),
            total_duration_ms,
            average_chunks_per_second,
        };

        info!(
            "Session {} completed: {}/{} chunks generated, {} failed",
            self.id, statistics.completed_chunks, statistics.total_chunks, statistics.failed_chunks
        );
        Ok(SessionEvent::SessionCompleted { statistics })
    }
}
