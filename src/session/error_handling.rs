//! Failure classification, retry eligibility and backoff schedules.

use crate::session::generator::GenerationError;
use crate::session::recovery::RecoveryStrategy;
use crate::session::types::{BackoffStrategy, BatchId, ChunkCoordinate, RetryPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Broad class of a batch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Generation,
    Timeout,
    Resource,
    Storage,
    Validation,
    Corruption,
    Internal,
}

impl ErrorCategory {
    /// Transient categories may succeed on a later attempt
    pub fn is_transient(self) -> bool {
        match self {
            ErrorCategory::Generation => true,
            ErrorCategory::Timeout => true,
            ErrorCategory::Resource => true,
            ErrorCategory::Storage => true,
            ErrorCategory::Validation => false,
            ErrorCategory::Corruption => false,
            ErrorCategory::Internal => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Generation => "generation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Corruption => "corruption",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One batch failure, appended to a session's error history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionErrorRecord {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub source_batch_id: BatchId,
    pub coordinate: Option<ChunkCoordinate>,
    pub cause: String,
    pub timestamp: DateTime<Utc>,
    /// Failed attempts of the source batch including this one
    pub retry_count: u32,
}

impl SessionErrorRecord {
    pub fn from_generation_error(
        batch_id: BatchId,
        error: &GenerationError,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (category, severity) = classify(error);
        Self {
            id: Uuid::new_v4(),
            category,
            severity,
            source_batch_id: batch_id,
            coordinate: error.coordinate(),
            cause: error.to_string(),
            timestamp,
            retry_count,
        }
    }
}

/// Map a generator failure onto a category and severity
pub fn classify(error: &GenerationError) -> (ErrorCategory, ErrorSeverity) {
    match error {
        GenerationError::NoiseSource { .. } => (ErrorCategory::Generation, ErrorSeverity::Medium),
        GenerationError::Timeout { .. } => (ErrorCategory::Timeout, ErrorSeverity::Medium),
        GenerationError::ResourceExhausted(_) => (ErrorCategory::Resource, ErrorSeverity::High),
        GenerationError::Storage(_) => (ErrorCategory::Storage, ErrorSeverity::High),
        GenerationError::InvalidCoordinate { .. } => {
            (ErrorCategory::Validation, ErrorSeverity::High)
        }
        GenerationError::CorruptedOutput { .. } => {
            (ErrorCategory::Corruption, ErrorSeverity::Critical)
        }
        GenerationError::Internal(_) => (ErrorCategory::Internal, ErrorSeverity::Critical),
    }
}

/// Whether the failed batch gets another attempt
pub fn should_retry_batch(policy: &RetryPolicy, error: &SessionErrorRecord) -> bool {
    error.retry_count < policy.max_attempts && error.category.is_transient()
}

/// Delay in milliseconds before retry `attempt` (1-based)
pub fn calculate_retry_delay(policy: &RetryPolicy, attempt: u32) -> u64 {
    let attempt = attempt.max(1);
    let delay = match policy.backoff_strategy {
        BackoffStrategy::Constant => return policy.base_delay_ms,
        BackoffStrategy::Linear => policy.base_delay_ms.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => 1u64
            .checked_shl(attempt - 1)
            .and_then(|factor| policy.base_delay_ms.checked_mul(factor))
            .unwrap_or(u64::MAX),
    };
    delay.min(policy.max_delay_ms)
}

/// Aggregated view over an error history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub total_errors: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    pub transient_errors: usize,
    pub fatal_errors: usize,
    pub affected_batches: usize,
    pub most_common_category: Option<ErrorCategory>,
    pub first_error_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ErrorAnalysis {
    /// Share of errors in non-transient categories
    pub fn fatal_ratio(&self) -> f64 {
        if self.total_errors == 0 {
            0.0
        } else {
            self.fatal_errors as f64 / self.total_errors as f64
        }
    }
}

pub fn analyze_errors(history: &[SessionErrorRecord]) -> ErrorAnalysis {
    let mut analysis = ErrorAnalysis {
        total_errors: history.len(),
        ..Default::default()
    };
    let mut batches = HashSet::new();

    for record in history {
        *analysis.by_category.entry(record.category).or_insert(0) += 1;
        *analysis.by_severity.entry(record.severity).or_insert(0) += 1;
        if record.category.is_transient() {
            analysis.transient_errors += 1;
        } else {
            analysis.fatal_errors += 1;
        }
        batches.insert(record.source_batch_id);

        analysis.first_error_at = Some(match analysis.first_error_at {
            Some(first) => first.min(record.timestamp),
            None => record.timestamp,
        });
        analysis.last_error_at = Some(match analysis.last_error_at {
            Some(last) => last.max(record.timestamp),
            None => record.timestamp,
        });
    }

    analysis.affected_batches = batches.len();
    // Ties resolve to the lowest category so the result is stable
    analysis.most_common_category = analysis
        .by_category
        .iter()
        .max_by(|(a_cat, a_count), (b_cat, b_count)| {
            a_count.cmp(b_count).then_with(|| b_cat.cmp(a_cat))
        })
        .map(|(category, _)| *category);

    analysis
}

/// Pick a recovery strategy from the shape of the failures
///
/// Mostly fatal failures will fail again, so only the known-good work is
/// retried. Purely transient failures are worth retrying wholesale.
pub fn suggest_recovery_strategy(analysis: &ErrorAnalysis) -> RecoveryStrategy {
    if analysis.total_errors == 0 || analysis.fatal_errors == 0 {
        return RecoveryStrategy::Aggressive;
    }

    let critical = analysis
        .by_severity
        .get(&ErrorSeverity::Critical)
        .copied()
        .unwrap_or(0);

    if analysis.fatal_ratio() > 0.5 || critical * 2 > analysis.total_errors {
        RecoveryStrategy::Conservative
    } else {
        RecoveryStrategy::Smart
    }
}
