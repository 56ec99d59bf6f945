use crate::error::{OrchestratorError, SessionError};
use crate::repository::{ChunkTask, ChunkTaskStatus, ChunkTaskUpdate, GenerationSessionRepository};
use crate::session::aggregate::{GenerationSession, SessionTransition};
use crate::session::error_handling::calculate_retry_delay;
use crate::session::events::SessionEventBus;
use crate::session::generator::{ChunkGenerator, GenerationError};
use crate::session::recovery::{
    RecoveryAnalysis, RecoveryConfig, RecoveryOptions, RecoveryResult, SessionRecovery,
};
use crate::session::state::CancelReason;
use crate::session::types::{
    BatchId, BatchStatus, CheckpointId, ChunkCoordinate, GenerationRequest, GenerationSessionId,
    SessionConfiguration, SessionConfigurationOverrides, SessionStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for session manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// Attempts at a transaction that keeps losing version races
    pub max_transaction_retries: u32,
    /// Idle wait of the driver when nothing is runnable
    pub driver_poll_interval_ms: u64,
    /// Keep per-coordinate chunk tasks in the repository
    pub track_chunk_tasks: bool,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_transaction_retries: 5,
            driver_poll_interval_ms: 50,
            track_chunk_tasks: false,
        }
    }
}

/// What a `run_session` call did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRunReport {
    pub session_id: GenerationSessionId,
    pub final_status: SessionStatus,
    pub batches_completed: u32,
    pub batches_failed: u32,
    pub retries_scheduled: u32,
    pub chunks_generated: u32,
    /// Outcomes that arrived after the session stopped accepting them
    pub discarded_outcomes: u32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

enum BatchOutcome {
    Generated { batch_id: BatchId, chunks: u32 },
    Failed { batch_id: BatchId, error: GenerationError },
    RetryDue { batch_id: BatchId },
}

/// Coordinates sessions: serialized transactions, events and execution
///
/// Every mutating operation runs under a per-session lock, re-reads the
/// stored session, applies the aggregate operation and writes it back with a
/// version check. Events are published in order before the lock is released.
pub struct SessionManager {
    repository: Arc<dyn GenerationSessionRepository>,
    events: Arc<SessionEventBus>,
    recovery: SessionRecovery,
    config: SessionManagerConfig,
    session_defaults: SessionConfiguration,
    session_locks: DashMap<GenerationSessionId, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        repository: Arc<dyn GenerationSessionRepository>,
        events: Arc<SessionEventBus>,
    ) -> Self {
        let recovery =
            SessionRecovery::new(RecoveryConfig::default()).with_repository(repository.clone());
        Self {
            repository,
            events,
            recovery,
            config: SessionManagerConfig::default(),
            session_defaults: SessionConfiguration::default(),
            session_locks: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: SessionManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Base configuration that per-session overrides are merged over
    pub fn with_session_defaults(mut self, defaults: SessionConfiguration) -> Self {
        self.session_defaults = defaults;
        self
    }

    pub fn with_recovery_config(mut self, config: RecoveryConfig) -> Self {
        self.recovery = SessionRecovery::new(config).with_repository(self.repository.clone());
        self
    }

    pub fn repository(&self) -> &Arc<dyn GenerationSessionRepository> {
        &self.repository
    }

    pub fn events(&self) -> &Arc<SessionEventBus> {
        &self.events
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub async fn create_session(
        &self,
        world_generator_id: &str,
        request: GenerationRequest,
        overrides: Option<&SessionConfigurationOverrides>,
    ) -> Result<GenerationSession, OrchestratorError> {
        let transition = GenerationSession::create_with_defaults(
            Uuid::new_v4(),
            world_generator_id,
            request,
            &self.session_defaults,
            overrides,
            Utc::now(),
        )?;

        let lock = self.session_lock(transition.session.id);
        let _guard = lock.lock().await;

        let session = self.repository.create_session(transition.session).await?;
        if self.config.track_chunk_tasks {
            let now = Utc::now();
            for coordinate in &session.request.coordinates {
                self.repository
                    .add_chunk_task(ChunkTask::new(session.id, *coordinate, now))
                    .await?;
            }
        }
        self.events.publish_all(session.id, transition.events);
        Ok(session)
    }

    pub async fn get_session(
        &self,
        id: GenerationSessionId,
    ) -> Result<GenerationSession, OrchestratorError> {
        Ok(self.repository.find_by_id(id).await?)
    }

    pub async fn start_session(
        &self,
        id: GenerationSessionId,
    ) -> Result<GenerationSession, OrchestratorError> {
        let transition = self.transact(id, |session| session.start(Utc::now())).await?;
        Ok(transition.session)
    }

    pub async fn begin_batch(
        &self,
        id: GenerationSessionId,
        batch_id: BatchId,
    ) -> Result<SessionTransition, OrchestratorError> {
        let transition = self
            .transact(id, |session| session.begin_batch(batch_id, Utc::now()))
            .await?;
        self.track_batch(
            &transition.session,
            batch_id,
            ChunkTaskUpdate::status(ChunkTaskStatus::Running),
        )
        .await?;
        Ok(transition)
    }

    pub async fn complete_batch(
        &self,
        id: GenerationSessionId,
        batch_id: BatchId,
        chunks_generated: u32,
    ) -> Result<SessionTransition, OrchestratorError> {
        let transition = self
            .transact(id, |session| {
                session.complete_batch(batch_id, chunks_generated, Utc::now())
            })
            .await?;
        self.track_batch(
            &transition.session,
            batch_id,
            ChunkTaskUpdate::status(ChunkTaskStatus::Completed),
        )
        .await?;
        Ok(transition)
    }

    pub async fn fail_batch(
        &self,
        id: GenerationSessionId,
        batch_id: BatchId,
        error: &GenerationError,
    ) -> Result<SessionTransition, OrchestratorError> {
        let transition = self
            .transact(id, |session| session.fail_batch(batch_id, error, Utc::now()))
            .await?;

        let permanently_failed = transition
            .session
            .state
            .batch(batch_id)
            .is_some_and(|batch| batch.status == BatchStatus::Failed);
        let status = if permanently_failed {
            ChunkTaskStatus::Failed
        } else {
            ChunkTaskStatus::Pending
        };
        self.track_batch(
            &transition.session,
            batch_id,
            ChunkTaskUpdate::failed_attempt(status, error.to_string()),
        )
        .await?;
        Ok(transition)
    }

    pub async fn requeue_batch(
        &self,
        id: GenerationSessionId,
        batch_id: BatchId,
    ) -> Result<SessionTransition, OrchestratorError> {
        self.transact(id, |session| session.requeue_batch(batch_id, Utc::now()))
            .await
    }

    pub async fn pause_session(
        &self,
        id: GenerationSessionId,
        reason: &str,
    ) -> Result<GenerationSession, OrchestratorError> {
        let transition = self
            .transact(id, |session| session.pause(reason, Utc::now()))
            .await?;
        Ok(transition.session)
    }

    pub async fn resume_session(
        &self,
        id: GenerationSessionId,
    ) -> Result<GenerationSession, OrchestratorError> {
        let transition = self.transact(id, |session| session.resume(Utc::now())).await?;
        Ok(transition.session)
    }

    pub async fn cancel_session(
        &self,
        id: GenerationSessionId,
        reason: CancelReason,
    ) -> Result<GenerationSession, OrchestratorError> {
        let transition = self
            .transact(id, |session| session.cancel(reason, Utc::now()))
            .await?;
        Ok(transition.session)
    }

    pub async fn fail_session(
        &self,
        id: GenerationSessionId,
        reason: &str,
    ) -> Result<GenerationSession, OrchestratorError> {
        let transition = self
            .transact(id, |session| session.fail(reason, Utc::now()))
            .await?;
        Ok(transition.session)
    }

    pub async fn delete_session(&self, id: GenerationSessionId) -> Result<(), OrchestratorError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        self.repository.delete_session(id).await?;
        self.session_locks.remove(&id);
        Ok(())
    }

    pub async fn create_checkpoint(
        &self,
        id: GenerationSessionId,
    ) -> Result<CheckpointId, OrchestratorError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        Ok(self.repository.create_checkpoint(id).await?)
    }

    pub async fn restore_checkpoint(
        &self,
        id: GenerationSessionId,
        checkpoint_id: &str,
    ) -> Result<GenerationSession, OrchestratorError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        Ok(self.repository.restore_from_checkpoint(id, checkpoint_id).await?)
    }

    pub async fn analyze_recovery(
        &self,
        id: GenerationSessionId,
    ) -> Result<RecoveryAnalysis, OrchestratorError> {
        let session = self.repository.find_by_id(id).await?;
        Ok(self.recovery.analyze_session_recovery(&session))
    }

    /// Reopen a failed or cancelled session as a paused new attempt
    pub async fn recover_session(
        &self,
        id: GenerationSessionId,
        options: &RecoveryOptions,
    ) -> Result<RecoveryResult, OrchestratorError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self.repository.find_by_id(id).await?;
        let mut result = self.recovery.execute_session_recovery(&session, options).await?;

        // A backup checkpoint is not a session write, so the version still lines up
        let stored = self
            .repository
            .update_session(result.recovered_session.clone())
            .await?;
        self.events.publish_all(id, result.events.clone());
        result.recovered_session = stored;
        Ok(result)
    }

    /// Drive a running session to completion with `generator`
    ///
    /// Runs until the session leaves `running` or its timeout expires. On
    /// timeout no new work is issued, in-flight batches get the graceful
    /// shutdown window to report, and the session is cancelled.
    pub async fn run_session(
        &self,
        id: GenerationSessionId,
        generator: Arc<dyn ChunkGenerator>,
    ) -> Result<SessionRunReport, OrchestratorError> {
        let started = Instant::now();
        let session = self.repository.find_by_id(id).await?;
        let configuration = session.configuration.clone();
        let timeouts = configuration.timeout_policy.clone();

        let max_in_flight = configuration.max_concurrent_chunks.max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(max_in_flight));
        let chunk_timeout = Duration::from_millis(timeouts.chunk_timeout_ms);
        let poll_interval = Duration::from_millis(self.config.driver_poll_interval_ms.max(1));
        let active_ms = session.progress.timing.active_elapsed_ms(Utc::now());
        let deadline =
            started + Duration::from_millis(timeouts.session_timeout_ms.saturating_sub(active_ms));

        let mut report = SessionRunReport {
            session_id: id,
            final_status: session.status(),
            batches_completed: 0,
            batches_failed: 0,
            retries_scheduled: 0,
            chunks_generated: 0,
            discarded_outcomes: 0,
            timed_out: false,
            duration_ms: 0,
        };
        let mut in_flight: FuturesUnordered<BoxFuture<'static, BatchOutcome>> =
            FuturesUnordered::new();
        let mut running: HashSet<BatchId> = HashSet::new();
        let mut waiting_retry: HashSet<BatchId> = HashSet::new();

        info!(
            "Driving session {} with {} generator",
            id,
            generator.world_generator_id()
        );

        loop {
            let session = self.repository.find_by_id(id).await?;
            if session.status() != SessionStatus::Running {
                debug!("Session {} is {}, driver stopping", id, session.status());
                break;
            }

            for batch in session.state.batches_with_status(BatchStatus::Retrying) {
                if waiting_retry.insert(batch.id) {
                    let delay =
                        calculate_retry_delay(&configuration.retry_policy, batch.attempts);
                    let batch_id = batch.id;
                    report.retries_scheduled += 1;
                    in_flight.push(
                        async move {
                            sleep(Duration::from_millis(delay)).await;
                            BatchOutcome::RetryDue { batch_id }
                        }
                        .boxed(),
                    );
                }
            }

            for batch_id in session.state.pending_batch_ids() {
                if running.len() >= max_in_flight {
                    break;
                }
                match self.begin_batch(id, batch_id).await {
                    Ok(transition) => {
                        let coordinates = transition
                            .session
                            .state
                            .batch(batch_id)
                            .map(|batch| batch.coordinates.clone())
                            .unwrap_or_default();
                        running.insert(batch_id);
                        in_flight.push(
                            generate_batch(
                                generator.clone(),
                                semaphore.clone(),
                                batch_id,
                                coordinates,
                                chunk_timeout,
                            )
                            .boxed(),
                        );
                    }
                    Err(e) if e.session_error().is_some() => {
                        debug!("Session {} stopped accepting batches: {}", id, e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if in_flight.is_empty() {
                let session = self.repository.find_by_id(id).await?;
                if session.status() != SessionStatus::Running
                    || session.state.all_batches_terminal()
                {
                    break;
                }
                // Batches begun elsewhere are still running; keep honoring the deadline
                if Instant::now() >= deadline {
                    warn!("Session {} exceeded its {}ms timeout", id, timeouts.session_timeout_ms);
                    report.timed_out = true;
                    break;
                }
                tokio::select! {
                    _ = sleep(poll_interval) => {}
                    _ = sleep_until(deadline) => {}
                }
                continue;
            }

            tokio::select! {
                outcome = in_flight.next() => {
                    if let Some(outcome) = outcome {
                        self.apply_outcome(
                            id,
                            outcome,
                            &mut running,
                            &mut waiting_retry,
                            &mut report,
                        )
                        .await?;
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!("Session {} exceeded its {}ms timeout", id, timeouts.session_timeout_ms);
                    report.timed_out = true;
                    break;
                }
            }
        }

        // In-flight batches may still report; on timeout only within the grace window
        let grace_deadline = report
            .timed_out
            .then(|| Instant::now() + Duration::from_millis(timeouts.graceful_shutdown_ms));
        while !running.is_empty() {
            let outcome = match grace_deadline {
                Some(grace_deadline) => tokio::select! {
                    outcome = in_flight.next() => outcome,
                    _ = sleep_until(grace_deadline) => {
                        warn!(
                            "Session {} abandoned {} in-flight batches after the grace window",
                            id,
                            running.len()
                        );
                        None
                    }
                },
                None => in_flight.next().await,
            };
            match outcome {
                Some(BatchOutcome::RetryDue { .. }) => continue,
                Some(outcome) => {
                    self.apply_outcome(id, outcome, &mut running, &mut waiting_retry, &mut report)
                        .await?
                }
                None => break,
            }
        }
        drop(in_flight);

        if report.timed_out {
            match self.cancel_session(id, CancelReason::SessionTimeout).await {
                Ok(_) => {}
                Err(e) if e.session_error().is_some() => {
                    debug!("Session {} already settled before timeout cancel: {}", id, e)
                }
                Err(e) => return Err(e),
            }
        }

        report.final_status = self.repository.find_by_id(id).await?.status();
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Driver finished session {} as {}: {} batches completed, {} failed",
            id, report.final_status, report.batches_completed, report.batches_failed
        );
        Ok(report)
    }

    async fn apply_outcome(
        &self,
        id: GenerationSessionId,
        outcome: BatchOutcome,
        running: &mut HashSet<BatchId>,
        waiting_retry: &mut HashSet<BatchId>,
        report: &mut SessionRunReport,
    ) -> Result<(), OrchestratorError> {
        let result = match outcome {
            BatchOutcome::Generated { batch_id, chunks } => {
                running.remove(&batch_id);
                self.complete_batch(id, batch_id, chunks).await.map(|_| {
                    report.batches_completed += 1;
                    report.chunks_generated += chunks;
                })
            }
            BatchOutcome::Failed { batch_id, error } => {
                running.remove(&batch_id);
                self.fail_batch(id, batch_id, &error).await.map(|transition| {
                    let failed = transition
                        .session
                        .state
                        .batch(batch_id)
                        .is_some_and(|batch| batch.status == BatchStatus::Failed);
                    if failed {
                        report.batches_failed += 1;
                    }
                })
            }
            BatchOutcome::RetryDue { batch_id } => {
                waiting_retry.remove(&batch_id);
                self.requeue_batch(id, batch_id).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => Ok(()),
            // The session moved on (paused, cancelled, finished) underneath the worker
            Err(e) if e.session_error().is_some() => {
                debug!("Discarded outcome for session {}: {}", id, e);
                report.discarded_outcomes += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `operation` to the stored session as one serialized transaction
    async fn transact<F>(
        &self,
        id: GenerationSessionId,
        operation: F,
    ) -> Result<SessionTransition, OrchestratorError>
    where
        F: Fn(&GenerationSession) -> Result<SessionTransition, SessionError> + Send,
    {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let max_attempts = self.config.max_transaction_retries.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self.repository.find_by_id(id).await?;
            let transition = operation(&current)?;

            match self.repository.update_session(transition.session.clone()).await {
                Ok(stored) => {
                    self.events.publish_all(id, transition.events.clone());
                    if stored.is_terminal() {
                        self.release_idle_lock(id, &lock);
                    }
                    return Ok(SessionTransition {
                        session: stored,
                        events: transition.events,
                    });
                }
                Err(e) if e.is_version_conflict() && attempts < max_attempts => {
                    debug!("Session {} transaction lost a version race, retrying", id);
                }
                Err(e) if e.is_version_conflict() => {
                    warn!("Session {} transaction gave up after {} attempts", id, attempts);
                    return Err(OrchestratorError::TransactionConflict {
                        session_id: id,
                        attempts,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn track_batch(
        &self,
        session: &GenerationSession,
        batch_id: BatchId,
        update: ChunkTaskUpdate,
    ) -> Result<(), OrchestratorError> {
        if !self.config.track_chunk_tasks {
            return Ok(());
        }
        let coordinates: Vec<ChunkCoordinate> = session
            .state
            .batch(batch_id)
            .map(|batch| batch.coordinates.clone())
            .unwrap_or_default();
        for coordinate in coordinates {
            self.repository
                .update_chunk_task(
                    session.id,
                    ChunkTask::task_id(session.id, coordinate),
                    update.clone(),
                )
                .await?;
        }
        Ok(())
    }

    fn session_lock(&self, id: GenerationSessionId) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock of a session that reached a terminal state
    ///
    /// Only the table and the caller may hold the lock; a waiting transaction
    /// keeps the entry alive. Recovery of the session later allocates a fresh
    /// lock.
    fn release_idle_lock(&self, id: GenerationSessionId, lock: &Arc<Mutex<()>>) {
        self.session_locks
            .remove_if(&id, |_, entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) == 2);
    }

    pub(crate) fn tracked_lock_count(&self) -> usize {
        self.session_locks.len()
    }
}

async fn generate_batch(
    generator: Arc<dyn ChunkGenerator>,
    semaphore: Arc<Semaphore>,
    batch_id: BatchId,
    coordinates: Vec<ChunkCoordinate>,
    chunk_timeout: Duration,
) -> BatchOutcome {
    let generations = coordinates.into_iter().map(|coordinate| {
        let generator = generator.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| GenerationError::Internal("generator pool closed".to_string()))?;
            match timeout(chunk_timeout, generator.generate(coordinate)).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout {
                    coordinate,
                    timeout_ms: chunk_timeout.as_millis() as u64,
                }),
            }
        }
    });

    match try_join_all(generations).await {
        Ok(chunks) => BatchOutcome::Generated {
            batch_id,
            chunks: chunks.len() as u32,
        },
        Err(error) => BatchOutcome::Failed { batch_id, error },
    }
}
