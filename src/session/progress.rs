use crate::env;
use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smoothing factor for the chunk-rate moving average
const RATE_SMOOTHING: f64 = 0.3;

/// Coarse phase of a generation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStage {
    Initializing,
    Generating,
    Finalizing,
    Completed,
}

/// Wall-clock bounds of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: GenerationStage,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Batch-level counters kept alongside the chunk counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressStatistics {
    pub total_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
    pub retried_batches: u32,
    pub success_rate: f64,
    pub peak_chunks_per_second: f64,
}

/// Derived progress of a session
///
/// `completed_chunks + failed_chunks + pending_chunks == total_chunks` holds for
/// every value produced by this module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub pending_chunks: u32,
    pub current_stage: GenerationStage,
    pub overall_progress: f64,
    pub estimated_time_remaining_ms: Option<u64>,
    pub chunks_per_second: f64,
    pub stage_timing: Vec<StageTiming>,
    pub statistics: ProgressStatistics,
    pub timing: TrackingClock,
}

/// Pause-aware elapsed-time accumulator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingClock {
    pub started_at: Option<DateTime<Utc>>,
    /// Start of the current active interval; `None` while paused or not started
    pub active_since: Option<DateTime<Utc>>,
    /// Active time accumulated before `active_since`
    pub accumulated_active_ms: u64,
    pub paused_at: Option<DateTime<Utc>>,
    pub total_paused_ms: u64,
    /// Active elapsed time at the previous counter update
    pub last_update_active_ms: u64,
}

impl TrackingClock {
    pub fn is_running(&self) -> bool {
        self.active_since.is_some()
    }

    /// Active (unpaused) time since tracking started
    pub fn active_elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let current = self
            .active_since
            .map(|since| now.signed_duration_since(since).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.accumulated_active_ms + current
    }
}

impl ProgressData {
    /// Zero progress for a session of `total_chunks`
    pub fn new(total_chunks: u32, now: DateTime<Utc>) -> Self {
        Self {
            total_chunks,
            completed_chunks: 0,
            failed_chunks: 0,
            pending_chunks: total_chunks,
            current_stage: GenerationStage::Initializing,
            overall_progress: 0.0,
            estimated_time_remaining_ms: None,
            chunks_per_second: 0.0,
            stage_timing: vec![StageTiming {
                stage: GenerationStage::Initializing,
                started_at: now,
                completed_at: None,
                duration_ms: None,
            }],
            statistics: ProgressStatistics::default(),
            timing: TrackingClock::default(),
        }
    }

    /// Rebuild counters from explicit chunk totals, e.g. after a recovery
    pub fn from_counts(
        &self,
        completed: u32,
        failed: u32,
        pending: u32,
    ) -> Result<Self, SessionError> {
        let total = completed + failed + pending;
        if total != self.total_chunks {
            return Err(SessionError::InconsistentProgress {
                total: self.total_chunks,
                completed,
                failed,
                pending,
            });
        }

        let mut next = self.clone();
        next.completed_chunks = completed;
        next.failed_chunks = failed;
        next.pending_chunks = pending;
        next.overall_progress = ratio(completed + failed, total);
        Ok(next)
    }

    /// Begin the active clock and enter the generating stage
    pub fn start_tracking(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.timing.started_at = Some(now);
        next.timing.active_since = Some(now);
        next.timing.paused_at = None;
        next.with_stage(GenerationStage::Generating, now)
    }

    /// Freeze the active clock so paused time does not inflate the rate
    pub fn pause_tracking(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if let Some(since) = next.timing.active_since.take() {
            next.timing.accumulated_active_ms +=
                now.signed_duration_since(since).num_milliseconds().max(0) as u64;
            next.timing.paused_at = Some(now);
        }
        next
    }

    /// Restart the active clock; returns the new value and how long it was paused
    pub fn resume_tracking(&self, now: DateTime<Utc>) -> (Self, u64) {
        let mut next = self.clone();
        let paused_for = next
            .timing
            .paused_at
            .take()
            .map(|at| now.signed_duration_since(at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        next.timing.total_paused_ms += paused_for;
        if next.timing.active_since.is_none() {
            next.timing.active_since = Some(now);
        }
        (next, paused_for)
    }

    /// Record `successes` completed and `failures` failed chunks
    pub fn update_progress(
        &self,
        successes: u32,
        failures: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        let requested = successes + failures;
        if requested > self.pending_chunks {
            return Err(SessionError::ProgressOverflow {
                requested,
                pending: self.pending_chunks,
            });
        }

        let mut next = self.clone();
        next.completed_chunks += successes;
        next.failed_chunks += failures;
        next.pending_chunks -= requested;
        next.overall_progress =
            ratio(next.completed_chunks + next.failed_chunks, next.total_chunks);

        let active_ms = next.timing.active_elapsed_ms(now);
        let processed = next.completed_chunks + next.failed_chunks;
        let interval_ms = active_ms.saturating_sub(next.timing.last_update_active_ms);

        if active_ms > 0 {
            let cumulative = processed as f64 * 1000.0 / active_ms as f64;
            next.chunks_per_second = if next.chunks_per_second == 0.0 || interval_ms == 0 {
                cumulative
            } else {
                let instant = requested as f64 * 1000.0 / interval_ms as f64;
                RATE_SMOOTHING * instant + (1.0 - RATE_SMOOTHING) * next.chunks_per_second
            };
        }
        next.timing.last_update_active_ms = active_ms;

        if next.chunks_per_second > next.statistics.peak_chunks_per_second {
            next.statistics.peak_chunks_per_second = next.chunks_per_second;
        }
        if processed > 0 {
            next.statistics.success_rate = next.completed_chunks as f64 / processed as f64;
        }

        let rate = next
            .chunks_per_second
            .max(env::limits::MIN_CHUNKS_PER_SECOND);
        next.estimated_time_remaining_ms =
            Some((next.pending_chunks as f64 / rate * 1000.0).min(u64::MAX as f64) as u64);

        Ok(next)
    }

    /// Close the current stage's timing and open `stage`
    pub fn with_stage(&self, stage: GenerationStage, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        if next.current_stage == stage {
            return next;
        }

        if let Some(current) = next
            .stage_timing
            .iter_mut()
            .rev()
            .find(|timing| timing.completed_at.is_none())
        {
            current.completed_at = Some(now);
            current.duration_ms = Some(
                now.signed_duration_since(current.started_at)
                    .num_milliseconds()
                    .max(0) as u64,
            );
        }

        let finished = stage == GenerationStage::Completed;
        next.stage_timing.push(StageTiming {
            stage,
            started_at: now,
            completed_at: finished.then_some(now),
            duration_ms: finished.then_some(0),
        });
        next.current_stage = stage;
        next
    }

    pub fn is_completed(&self) -> bool {
        self.pending_chunks == 0
    }

    /// Fraction of chunks that completed successfully
    pub fn completion_ratio(&self) -> f64 {
        ratio(self.completed_chunks, self.total_chunks)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_chunks: self.total_chunks,
            completed_chunks: self.completed_chunks,
            failed_chunks: self.failed_chunks,
            pending_chunks: self.pending_chunks,
            overall_progress: self.overall_progress,
            chunks_per_second: self.chunks_per_second,
            estimated_time_remaining_ms: self.estimated_time_remaining_ms,
        }
    }
}

/// Compact progress view carried by `ProgressUpdated` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub pending_chunks: u32,
    pub overall_progress: f64,
    pub chunks_per_second: f64,
    pub estimated_time_remaining_ms: Option<u64>,
}

fn ratio(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
