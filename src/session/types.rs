use crate::env;
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for generation sessions
pub type GenerationSessionId = Uuid;

/// Unique identifier for chunk batches
pub type BatchId = Uuid;

/// Identifier of the world generator a session produces chunks for
pub type WorldGeneratorId = String;

/// Identifier of a checkpoint, `checkpoint_<uuid>`
pub type CheckpointId = String;

/// Horizontal chunk coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoordinate {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoordinate {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

impl fmt::Display for ChunkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

impl From<(i32, i32)> for ChunkCoordinate {
    fn from((x, z): (i32, i32)) -> Self {
        Self { x, z }
    }
}

/// A caller's request to generate a set of chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub coordinates: Vec<ChunkCoordinate>,
    pub priority: u8,
    /// Opaque generator hints, passed through untouched
    pub options: Option<serde_json::Value>,
    pub metadata: Option<HashMap<String, String>>,
}

impl GenerationRequest {
    pub fn new(coordinates: Vec<ChunkCoordinate>, priority: u8) -> Self {
        Self {
            coordinates,
            priority,
            options: None,
            metadata: None,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Collect every validation problem with this request
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.coordinates.is_empty() {
            errors.push(ValidationError::EmptyRequest);
        }

        if self.coordinates.len() > env::limits::MAX_COORDINATES_PER_REQUEST {
            errors.push(ValidationError::TooManyCoordinates {
                count: self.coordinates.len(),
                max: env::limits::MAX_COORDINATES_PER_REQUEST,
            });
        }

        let mut seen = HashSet::with_capacity(self.coordinates.len());
        let mut duplicates = Vec::new();
        for coordinate in &self.coordinates {
            if !seen.insert(*coordinate) && !duplicates.contains(coordinate) {
                duplicates.push(*coordinate);
            }
        }
        if !duplicates.is_empty() {
            errors.push(ValidationError::DuplicateCoordinates { duplicates });
        }

        if !(env::limits::MIN_PRIORITY..=env::limits::MAX_PRIORITY).contains(&self.priority) {
            errors.push(ValidationError::PriorityOutOfRange {
                priority: self.priority,
                min: env::limits::MIN_PRIORITY,
                max: env::limits::MAX_PRIORITY,
            });
        }

        errors
    }
}

/// Backoff schedule applied between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub chunk_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub graceful_shutdown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPolicy {
    pub enable_priority_queuing: bool,
    pub priority_threshold: u8,
    pub high_priority_weight: f64,
}

/// Per-session execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    pub max_concurrent_chunks: u32,
    pub chunk_batch_size: u32,
    pub retry_policy: RetryPolicy,
    pub timeout_policy: TimeoutPolicy,
    pub priority_policy: PriorityPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            chunk_timeout_ms: 30_000,
            session_timeout_ms: 3_600_000, // 1 hour
            graceful_shutdown_ms: 5_000,
        }
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            enable_priority_queuing: false,
            priority_threshold: 7,
            high_priority_weight: 2.0,
        }
    }
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 8,
            chunk_batch_size: 16,
            retry_policy: RetryPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            priority_policy: PriorityPolicy::default(),
        }
    }
}

impl SessionConfiguration {
    /// Apply caller overrides on top of this configuration
    pub fn merged(&self, overrides: &SessionConfigurationOverrides) -> Self {
        let mut merged = self.clone();

        if let Some(value) = overrides.max_concurrent_chunks {
            merged.max_concurrent_chunks = value;
        }
        if let Some(value) = overrides.chunk_batch_size {
            merged.chunk_batch_size = value;
        }

        if let Some(retry) = &overrides.retry_policy {
            if let Some(value) = retry.max_attempts {
                merged.retry_policy.max_attempts = value;
            }
            if let Some(value) = retry.backoff_strategy {
                merged.retry_policy.backoff_strategy = value;
            }
            if let Some(value) = retry.base_delay_ms {
                merged.retry_policy.base_delay_ms = value;
            }
            if let Some(value) = retry.max_delay_ms {
                merged.retry_policy.max_delay_ms = value;
            }
        }

        if let Some(timeout) = &overrides.timeout_policy {
            if let Some(value) = timeout.chunk_timeout_ms {
                merged.timeout_policy.chunk_timeout_ms = value;
            }
            if let Some(value) = timeout.session_timeout_ms {
                merged.timeout_policy.session_timeout_ms = value;
            }
            if let Some(value) = timeout.graceful_shutdown_ms {
                merged.timeout_policy.graceful_shutdown_ms = value;
            }
        }

        if let Some(priority) = &overrides.priority_policy {
            if let Some(value) = priority.enable_priority_queuing {
                merged.priority_policy.enable_priority_queuing = value;
            }
            if let Some(value) = priority.priority_threshold {
                merged.priority_policy.priority_threshold = value;
            }
            if let Some(value) = priority.high_priority_weight {
                merged.priority_policy.high_priority_weight = value;
            }
        }

        merged
    }

    /// Check field ranges and the delay/timeout orderings
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut invalid = |field: &'static str, reason: String| {
            errors.push(ValidationError::InvalidConfiguration { field, reason });
        };

        if self.max_concurrent_chunks == 0 {
            invalid("max_concurrent_chunks", "must be at least 1".to_string());
        }
        if self.chunk_batch_size == 0 {
            invalid("chunk_batch_size", "must be at least 1".to_string());
        }
        if self.retry_policy.max_attempts == 0 {
            invalid("retry_policy.max_attempts", "must be at least 1".to_string());
        }
        if self.retry_policy.base_delay_ms > self.retry_policy.max_delay_ms {
            invalid(
                "retry_policy.base_delay_ms",
                format!(
                    "base delay {}ms exceeds max delay {}ms",
                    self.retry_policy.base_delay_ms, self.retry_policy.max_delay_ms
                ),
            );
        }
        if self.timeout_policy.chunk_timeout_ms == 0 {
            invalid("timeout_policy.chunk_timeout_ms", "must be positive".to_string());
        }
        if self.timeout_policy.chunk_timeout_ms > self.timeout_policy.session_timeout_ms {
            invalid(
                "timeout_policy.chunk_timeout_ms",
                format!(
                    "chunk timeout {}ms exceeds session timeout {}ms",
                    self.timeout_policy.chunk_timeout_ms, self.timeout_policy.session_timeout_ms
                ),
            );
        }
        if !self.priority_policy.high_priority_weight.is_finite()
            || self.priority_policy.high_priority_weight <= 0.0
        {
            invalid(
                "priority_policy.high_priority_weight",
                "must be a positive number".to_string(),
            );
        }

        errors
    }
}

/// Partial configuration merged over defaults when a session is created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfigurationOverrides {
    pub max_concurrent_chunks: Option<u32>,
    pub chunk_batch_size: Option<u32>,
    pub retry_policy: Option<RetryPolicyOverrides>,
    pub timeout_policy: Option<TimeoutPolicyOverrides>,
    pub priority_policy: Option<PriorityPolicyOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyOverrides {
    pub max_attempts: Option<u32>,
    pub backoff_strategy: Option<BackoffStrategy>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicyOverrides {
    pub chunk_timeout_ms: Option<u64>,
    pub session_timeout_ms: Option<u64>,
    pub graceful_shutdown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPolicyOverrides {
    pub enable_priority_queuing: Option<bool>,
    pub priority_threshold: Option<u8>,
    pub high_priority_weight: Option<f64>,
}

impl SessionConfigurationOverrides {
    pub fn with_batch_size(mut self, chunk_batch_size: u32) -> Self {
        self.chunk_batch_size = Some(chunk_batch_size);
        self
    }

    pub fn with_max_concurrent_chunks(mut self, max_concurrent_chunks: u32) -> Self {
        self.max_concurrent_chunks = Some(max_concurrent_chunks);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicyOverrides) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn with_timeout_policy(mut self, timeout_policy: TimeoutPolicyOverrides) -> Self {
        self.timeout_policy = Some(timeout_policy);
        self
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Running or paused, i.e. work is in flight or resumable
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single chunk batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded subset of a session's coordinates, processed and retried as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkBatch {
    pub id: BatchId,
    pub coordinates: Vec<ChunkCoordinate>,
    pub priority: u8,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    /// Number of failed execution attempts so far
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ChunkBatch {
    pub fn new(coordinates: Vec<ChunkCoordinate>, priority: u8, created_at: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::new_v4(),
            coordinates,
            priority,
            status: BatchStatus::Pending,
            created_at,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.coordinates.len() as u32
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}
