use crate::error::SessionRecoveryError;
use crate::repository::GenerationSessionRepository;
use crate::session::aggregate::{GenerationSession, RecoveryPlan};
use crate::session::error_handling::{ErrorAnalysis, analyze_errors, suggest_recovery_strategy};
use crate::session::events::SessionEvent;
use crate::session::types::{
    BatchId, BatchStatus, CheckpointId, ChunkBatch, GenerationSessionId, RetryPolicy,
    SessionStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// How much of a failed session a recovery attempt re-runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Re-run only batches that still have attempts left
    Conservative,
    /// Re-run every unsettled batch, corrupted ones included
    Aggressive,
    /// Scale ambition down as the corruption risk goes up
    Smart,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::Conservative => f.write_str("conservative"),
            RecoveryStrategy::Aggressive => f.write_str("aggressive"),
            RecoveryStrategy::Smart => f.write_str("smart"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Risk from the share of corrupted chunks
    pub fn from_corruption_ratio(ratio: f64) -> Self {
        if ratio < 0.10 {
            RiskLevel::Low
        } else if ratio < 0.30 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => f.write_str("low"),
            RiskLevel::Medium => f.write_str("medium"),
            RiskLevel::High => f.write_str("high"),
        }
    }
}

/// Configuration for recovery operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Throughput assumed when the session never measured one
    pub default_chunks_per_second: f64,
    /// Sessions reopened this many times are no longer recoverable
    pub max_recovery_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_chunks_per_second: 10.0,
            max_recovery_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOptions {
    pub strategy: RecoveryStrategy,
    pub skip_corrupted: bool,
    /// Attempt budget for every re-run batch
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub validate_integrity: bool,
    pub create_backup: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::Smart,
            skip_corrupted: false,
            max_retries: 3,
            retry_delay_ms: 1_000,
            validate_integrity: true,
            create_backup: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAnalysis {
    pub session_id: GenerationSessionId,
    pub can_recover: bool,
    pub total_chunks: u32,
    /// Chunks of batches that failed with their attempts exhausted
    pub corrupted_chunks: u32,
    /// Completed chunks plus chunks that can still be re-run
    pub recoverable_chunks: u32,
    /// Chunks of batches left pending, running or retrying
    pub interrupted_chunks: u32,
    pub estimated_recovery_time_ms: u64,
    pub risk_level: RiskLevel,
    pub suggested_strategy: RecoveryStrategy,
    pub error_analysis: ErrorAnalysis,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryValidation {
    pub is_valid: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub session_id: GenerationSessionId,
    pub successful: bool,
    pub strategy: RecoveryStrategy,
    pub recovered_chunks: u32,
    pub skipped_chunks: u32,
    pub corrupted_chunks: u32,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub backup_checkpoint: Option<CheckpointId>,
    pub validation: Option<RecoveryValidation>,
    /// The reopened session, paused and ready to be stored
    pub recovered_session: GenerationSession,
    pub events: Vec<SessionEvent>,
}

/// Analyzes failed sessions and builds their next generation attempt
pub struct SessionRecovery {
    config: RecoveryConfig,
    repository: Option<Arc<dyn GenerationSessionRepository>>,
}

/// Batch classification shared by analysis and execution
struct BatchBreakdown<'a> {
    completed: Vec<&'a ChunkBatch>,
    failed_recoverable: Vec<&'a ChunkBatch>,
    interrupted: Vec<&'a ChunkBatch>,
    corrupted: Vec<&'a ChunkBatch>,
}

impl<'a> BatchBreakdown<'a> {
    fn of(session: &'a GenerationSession) -> Self {
        let max_attempts = session.configuration.retry_policy.max_attempts;
        let mut breakdown = BatchBreakdown {
            completed: Vec::new(),
            failed_recoverable: Vec::new(),
            interrupted: Vec::new(),
            corrupted: Vec::new(),
        };

        for batch in &session.state.batches {
            match batch.status {
                BatchStatus::Completed => breakdown.completed.push(batch),
                BatchStatus::Failed if batch.attempts >= max_attempts => {
                    breakdown.corrupted.push(batch)
                }
                BatchStatus::Failed => breakdown.failed_recoverable.push(batch),
                BatchStatus::Pending | BatchStatus::Running | BatchStatus::Retrying => {
                    breakdown.interrupted.push(batch)
                }
            }
        }
        breakdown
    }

    /// Batches that can be re-run without touching corrupted ones
    fn rerunnable(&self) -> impl Iterator<Item = &'a ChunkBatch> {
        self.failed_recoverable
            .iter()
            .chain(self.interrupted.iter())
            .copied()
    }
}

fn chunk_sum<'a>(batches: impl IntoIterator<Item = &'a ChunkBatch>) -> u32 {
    batches.into_iter().map(ChunkBatch::chunk_count).sum()
}

impl SessionRecovery {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            repository: None,
        }
    }

    /// Attach a repository used to checkpoint sessions before recovery
    pub fn with_repository(mut self, repository: Arc<dyn GenerationSessionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn analyze_session_recovery(&self, session: &GenerationSession) -> RecoveryAnalysis {
        let breakdown = BatchBreakdown::of(session);
        let total_chunks = session.progress.total_chunks;

        let corrupted_chunks = chunk_sum(breakdown.corrupted.iter().copied());
        let interrupted_chunks = chunk_sum(breakdown.interrupted.iter().copied());
        let rerunnable_chunks = chunk_sum(breakdown.rerunnable());
        let recoverable_chunks = chunk_sum(breakdown.completed.iter().copied())
            + chunk_sum(breakdown.failed_recoverable.iter().copied());

        let corruption_ratio = if total_chunks == 0 {
            0.0
        } else {
            corrupted_chunks as f64 / total_chunks as f64
        };
        let risk_level = RiskLevel::from_corruption_ratio(corruption_ratio);

        let recoverable_status = matches!(
            session.status(),
            SessionStatus::Failed | SessionStatus::Cancelled
        );
        let attempts_left = session.attempt <= self.config.max_recovery_attempts;
        let can_recover = recoverable_status && attempts_left;

        let rate = if session.progress.chunks_per_second > 0.0 {
            session.progress.chunks_per_second
        } else {
            self.config.default_chunks_per_second.max(f64::EPSILON)
        };
        let estimated_recovery_time_ms =
            ((rerunnable_chunks + corrupted_chunks) as f64 / rate * 1000.0) as u64;

        let error_analysis = analyze_errors(&session.error_history);
        let suggested_strategy = match risk_level {
            RiskLevel::High => RecoveryStrategy::Conservative,
            _ => suggest_recovery_strategy(&error_analysis),
        };

        let mut recommendations = Vec::new();
        if !recoverable_status {
            recommendations.push(format!(
                "Session is {}; only failed or cancelled sessions can be recovered",
                session.status()
            ));
        }
        if !attempts_left {
            recommendations.push(format!(
                "Session has already been reopened {} times; start a new session instead",
                session.attempt - 1
            ));
        }
        match risk_level {
            RiskLevel::Low => recommendations
                .push("Low corruption; re-running every unsettled batch is safe".to_string()),
            RiskLevel::Medium => recommendations.push(
                "Moderate corruption; retry part of the corrupted batches and monitor failures"
                    .to_string(),
            ),
            RiskLevel::High => recommendations.push(
                "High corruption; skip corrupted batches and inspect the generator".to_string(),
            ),
        }
        if let Some(category) = error_analysis.most_common_category {
            if !category.is_transient() {
                recommendations.push(format!(
                    "Most failures are {} errors, which retries will not fix",
                    category
                ));
            }
        }
        if interrupted_chunks > 0 {
            recommendations.push(format!(
                "{} chunks were interrupted before settling",
                interrupted_chunks
            ));
        }

        RecoveryAnalysis {
            session_id: session.id,
            can_recover,
            total_chunks,
            corrupted_chunks,
            recoverable_chunks,
            interrupted_chunks,
            estimated_recovery_time_ms,
            risk_level,
            suggested_strategy,
            error_analysis,
            recommendations,
        }
    }

    pub async fn execute_session_recovery(
        &self,
        session: &GenerationSession,
        options: &RecoveryOptions,
    ) -> Result<RecoveryResult, SessionRecoveryError> {
        let started = Utc::now();
        let analysis = self.analyze_session_recovery(session);
        if !analysis.can_recover {
            return Err(SessionRecoveryError::NotRecoverable {
                session_id: session.id,
                status: session.status(),
            });
        }

        info!(
            "Recovering session {} with {} strategy (risk {})",
            session.id, options.strategy, analysis.risk_level
        );

        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let backup_checkpoint = if options.create_backup {
            match &self.repository {
                Some(repository) => Some(repository.create_checkpoint(session.id).await?),
                None => {
                    warnings.push("No repository attached, backup checkpoint skipped".to_string());
                    None
                }
            }
        } else {
            None
        };

        let requeue = self.select_batches(session, options, analysis.risk_level);
        let plan = RecoveryPlan {
            requeue: requeue.clone(),
            retry_policy: RetryPolicy {
                max_attempts: options.max_retries.max(1),
                base_delay_ms: options
                    .retry_delay_ms
                    .min(session.configuration.retry_policy.max_delay_ms),
                ..session.configuration.retry_policy.clone()
            },
        };

        let reason = format!("recovered with {} strategy", options.strategy);
        let transition = session
            .reopen_for_recovery(&plan, &reason, Utc::now())
            .map_err(|e| SessionRecoveryError::ExecutionFailed {
                session_id: session.id,
                reason: e.to_string(),
            })?;

        let breakdown = BatchBreakdown::of(session);
        let recovered_chunks = chunk_sum(
            session
                .state
                .batches
                .iter()
                .filter(|batch| requeue.contains(&batch.id)),
        );
        let skipped_chunks = chunk_sum(
            session
                .state
                .batches
                .iter()
                .filter(|batch| batch.status != BatchStatus::Completed)
                .filter(|batch| !requeue.contains(&batch.id)),
        );
        let skipped_corrupted = breakdown
            .corrupted
            .iter()
            .filter(|batch| !requeue.contains(&batch.id))
            .count();
        if skipped_corrupted > 0 {
            warnings.push(format!(
                "Skipped {} corrupted batches ({} chunks)",
                skipped_corrupted,
                chunk_sum(
                    breakdown
                        .corrupted
                        .iter()
                        .copied()
                        .filter(|batch| !requeue.contains(&batch.id))
                )
            ));
        }

        let validation = if options.validate_integrity {
            let validation = self.validate_recovered_session(session, &transition.session);
            if !validation.is_valid {
                errors.extend(validation.issues.iter().cloned());
                warn!(
                    "Recovered session {} failed validation (confidence {:.2})",
                    session.id, validation.confidence
                );
                return Err(SessionRecoveryError::ExecutionFailed {
                    session_id: session.id,
                    reason: errors.join("; "),
                });
            }
            Some(validation)
        } else {
            None
        };

        let duration_ms = Utc::now()
            .signed_duration_since(started)
            .num_milliseconds()
            .max(0) as u64;

        info!(
            "Session {} recovery prepared: {} chunks requeued, {} skipped",
            session.id, recovered_chunks, skipped_chunks
        );

        Ok(RecoveryResult {
            session_id: session.id,
            successful: true,
            strategy: options.strategy,
            recovered_chunks,
            skipped_chunks,
            corrupted_chunks: analysis.corrupted_chunks,
            duration_ms,
            errors,
            warnings,
            backup_checkpoint,
            validation,
            recovered_session: transition.session,
            events: transition.events,
        })
    }

    /// Score how faithfully `recovered` preserves `original`
    pub fn validate_recovered_session(
        &self,
        original: &GenerationSession,
        recovered: &GenerationSession,
    ) -> RecoveryValidation {
        let mut confidence: f64 = 1.0;
        let mut issues = Vec::new();

        if original.id != recovered.id {
            confidence -= 0.5;
            issues.push(format!(
                "Session id changed from {} to {}",
                original.id, recovered.id
            ));
        }
        if original.world_generator_id != recovered.world_generator_id {
            confidence -= 0.5;
            issues.push(format!(
                "World generator changed from {} to {}",
                original.world_generator_id, recovered.world_generator_id
            ));
        }

        let original_chunks = original.progress.total_chunks;
        if original_chunks > 0 {
            let chunk_ratio = recovered.progress.total_chunks as f64 / original_chunks as f64;
            if chunk_ratio < 0.8 {
                confidence -= 0.3;
                issues.push(format!(
                    "Chunk count regressed to {:.0}% of the original",
                    chunk_ratio * 100.0
                ));
            }
        }

        let original_completion = original.progress.completion_ratio();
        if original_completion > 0.0 {
            let progress_ratio = recovered.progress.completion_ratio() / original_completion;
            if progress_ratio < 0.9 {
                confidence -= 0.2;
                issues.push(format!(
                    "Completed progress regressed to {:.0}% of the original",
                    progress_ratio * 100.0
                ));
            }
        }

        let confidence = confidence.clamp(0.0, 1.0);
        RecoveryValidation {
            is_valid: confidence > 0.5,
            confidence,
            issues,
        }
    }

    fn select_batches(
        &self,
        session: &GenerationSession,
        options: &RecoveryOptions,
        risk_level: RiskLevel,
    ) -> HashSet<BatchId> {
        let breakdown = BatchBreakdown::of(session);
        let rerunnable: Vec<BatchId> = breakdown.rerunnable().map(|batch| batch.id).collect();
        let corrupted: Vec<BatchId> = breakdown.corrupted.iter().map(|batch| batch.id).collect();

        let (rerun_count, corrupted_count) = match options.strategy {
            RecoveryStrategy::Conservative => (rerunnable.len(), 0),
            RecoveryStrategy::Aggressive => (rerunnable.len(), corrupted.len()),
            RecoveryStrategy::Smart => match risk_level {
                RiskLevel::Low => (rerunnable.len(), corrupted.len()),
                RiskLevel::Medium => (rerunnable.len(), corrupted.len() / 2),
                RiskLevel::High => ((rerunnable.len() * 4) / 5, 0),
            },
        };
        let corrupted_count = if options.skip_corrupted {
            0
        } else {
            corrupted_count
        };

        rerunnable
            .into_iter()
            .take(rerun_count)
            .chain(corrupted.into_iter().take(corrupted_count))
            .collect()
    }
}
