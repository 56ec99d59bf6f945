//! In-process publish/subscribe for session lifecycle notifications.
//!
//! Publication fans out synchronously to handler subscribers and through a
//! bounded queue to channel subscribers. A handler that errors or panics, or a
//! channel that is full, never blocks or fails delivery to anyone else.

use crate::session::error_handling::SessionErrorRecord;
use crate::session::progress::ProgressSnapshot;
use crate::session::state::CancelReason;
use crate::session::types::{BatchId, GenerationSessionId, WorldGeneratorId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Final numbers reported when a session completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStatistics {
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub total_batches: u32,
    pub failed_batches: u32,
    pub retried_batches: u32,
    pub error_count: usize,
    pub total_duration_ms: u64,
    pub average_chunks_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        world_generator_id: WorldGeneratorId,
        total_chunks: u32,
        priority: u8,
    },
    SessionStarted {
        batch_count: usize,
        total_chunks: u32,
    },
    SessionPaused {
        reason: String,
    },
    SessionResumed {
        paused_duration_ms: u64,
    },
    SessionCompleted {
        statistics: CompletionStatistics,
    },
    SessionFailed {
        reason: String,
    },
    SessionCancelled {
        reason: CancelReason,
    },
    SessionRecovered {
        attempt: u32,
        requeued_batches: usize,
        skipped_batches: usize,
    },
    BatchStarted {
        batch_id: BatchId,
        chunk_count: u32,
    },
    BatchCompleted {
        batch_id: BatchId,
        chunk_count: u32,
        duration_ms: Option<u64>,
    },
    BatchFailed {
        batch_id: BatchId,
        error: SessionErrorRecord,
        will_retry: bool,
        retry_delay_ms: Option<u64>,
    },
    BatchRetried {
        batch_id: BatchId,
        attempt: u32,
    },
    ProgressUpdated {
        progress: ProgressSnapshot,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session_created",
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::SessionPaused { .. } => "session_paused",
            SessionEvent::SessionResumed { .. } => "session_resumed",
            SessionEvent::SessionCompleted { .. } => "session_completed",
            SessionEvent::SessionFailed { .. } => "session_failed",
            SessionEvent::SessionCancelled { .. } => "session_cancelled",
            SessionEvent::SessionRecovered { .. } => "session_recovered",
            SessionEvent::BatchStarted { .. } => "batch_started",
            SessionEvent::BatchCompleted { .. } => "batch_completed",
            SessionEvent::BatchFailed { .. } => "batch_failed",
            SessionEvent::BatchRetried { .. } => "batch_retried",
            SessionEvent::ProgressUpdated { .. } => "progress_updated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::SessionCompleted { .. }
                | SessionEvent::SessionFailed { .. }
                | SessionEvent::SessionCancelled { .. }
        )
    }
}

/// An event stamped with its session and a bus-wide sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventEnvelope {
    pub sequence: u64,
    pub session_id: GenerationSessionId,
    pub published_at: DateTime<Utc>,
    pub event: SessionEvent,
}

/// Synchronous subscriber; errors are logged and otherwise ignored
pub trait SessionEventHandler: Send + Sync {
    fn handle_event(&self, event: &SessionEventEnvelope) -> anyhow::Result<()>;
}

/// Handler that writes every event to the tracing log
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

impl SessionEventHandler for LoggingEventHandler {
    fn handle_event(&self, envelope: &SessionEventEnvelope) -> anyhow::Result<()> {
        match &envelope.event {
            SessionEvent::ProgressUpdated { progress } => debug!(
                "Session {} progress {:.1}% ({} done, {} failed, {} pending)",
                envelope.session_id,
                progress.overall_progress * 100.0,
                progress.completed_chunks,
                progress.failed_chunks,
                progress.pending_chunks
            ),
            event => debug!("Session {} event: {}", envelope.session_id, event.kind()),
        }
        Ok(())
    }
}

pub type SubscriptionId = u64;

#[derive(Clone)]
enum Subscriber {
    Handler(Arc<dyn SessionEventHandler>),
    Channel(mpsc::Sender<SessionEventEnvelope>),
}

pub struct SessionEventBus {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    sequence: AtomicU64,
    dropped_events: AtomicU64,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventBus")
            .field("subscribers", &self.subscriber_count())
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn SessionEventHandler>) -> SubscriptionId {
        self.add_subscriber(Subscriber::Handler(handler))
    }

    /// Subscribe through a bounded queue of `capacity` events
    ///
    /// When the receiver falls behind, events for it are dropped and counted.
    pub fn subscribe_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<SessionEventEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.add_subscriber(Subscriber::Channel(sender));
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(subscription, _)| *subscription != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Events that could not be queued for a lagging channel subscriber
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn publish(
        &self,
        session_id: GenerationSessionId,
        event: SessionEvent,
    ) -> SessionEventEnvelope {
        let envelope = SessionEventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            session_id,
            published_at: Utc::now(),
            event,
        };

        // Deliver from a snapshot so handlers may (un)subscribe without deadlocking
        let snapshot: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut closed = Vec::new();
        for (id, subscriber) in snapshot {
            match subscriber {
                Subscriber::Handler(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler.handle_event(&envelope))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            "Event handler {} failed on {} for session {}: {}",
                            id,
                            envelope.event.kind(),
                            session_id,
                            e
                        ),
                        Err(_) => error!(
                            "Event handler {} panicked on {} for session {}",
                            id,
                            envelope.event.kind(),
                            session_id
                        ),
                    }
                }
                Subscriber::Channel(sender) => match sender.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped_events.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Event channel {} is full, dropped {} for session {}",
                            id,
                            envelope.event.kind(),
                            session_id
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
                },
            }
        }

        for id in closed {
            debug!("Removing closed event channel {}", id);
            self.unsubscribe(id);
        }

        envelope
    }

    /// Publish `events` in order
    pub fn publish_all(
        &self,
        session_id: GenerationSessionId,
        events: Vec<SessionEvent>,
    ) -> Vec<SessionEventEnvelope> {
        events
            .into_iter()
            .map(|event| self.publish(session_id, event))
            .collect()
    }

    fn add_subscriber(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, subscriber));
        id
    }
}
