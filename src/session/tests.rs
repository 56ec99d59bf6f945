use crate::error::{SessionError, SessionRecoveryError, ValidationError};
use crate::repository::{
    ChunkTaskStatus, GenerationSessionRepository, MemoryGenerationSessionRepository,
};
use crate::session::*;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn coordinates(count: i32) -> Vec<ChunkCoordinate> {
    (0..count).map(|i| ChunkCoordinate::new(i % 10, i / 10)).collect()
}

fn create_session(
    count: i32,
    overrides: Option<&SessionConfigurationOverrides>,
) -> GenerationSession {
    GenerationSession::create(
        Uuid::new_v4(),
        "overworld",
        GenerationRequest::new(coordinates(count), 5),
        overrides,
        Utc::now(),
    )
    .expect("valid request")
    .session
}

fn started_session(
    count: i32,
    overrides: Option<&SessionConfigurationOverrides>,
) -> GenerationSession {
    create_session(count, overrides)
        .start(Utc::now())
        .unwrap()
        .session
}

fn noise_error(coordinate: ChunkCoordinate) -> GenerationError {
    GenerationError::NoiseSource {
        coordinate,
        reason: "test".to_string(),
    }
}

#[test]
fn test_create_rejects_invalid_requests() {
    let duplicated = vec![
        ChunkCoordinate::new(0, 0),
        ChunkCoordinate::new(1, 0),
        ChunkCoordinate::new(0, 0),
    ];
    let error = GenerationSession::create(
        Uuid::new_v4(),
        "overworld",
        GenerationRequest::new(duplicated, 5),
        None,
        Utc::now(),
    )
    .unwrap_err();
    assert!(error.has_duplicate_coordinates());

    let error = GenerationSession::create(
        Uuid::new_v4(),
        " ",
        GenerationRequest::new(Vec::new(), 0),
        Some(&SessionConfigurationOverrides::default().with_batch_size(0)),
        Utc::now(),
    )
    .unwrap_err();
    assert!(error.errors.contains(&ValidationError::EmptyWorldGeneratorId));
    assert!(error.errors.contains(&ValidationError::EmptyRequest));
    assert!(error
        .errors
        .iter()
        .any(|e| matches!(e, ValidationError::PriorityOutOfRange { priority: 0, .. })));
    assert!(error.errors.iter().any(|e| matches!(
        e,
        ValidationError::InvalidConfiguration {
            field: "chunk_batch_size",
            ..
        }
    )));
}

#[test]
fn test_create_merges_overrides_over_defaults() {
    let overrides = SessionConfigurationOverrides::default()
        .with_batch_size(4)
        .with_retry_policy(RetryPolicyOverrides {
            max_attempts: Some(5),
            ..Default::default()
        });
    let transition = GenerationSession::create(
        Uuid::new_v4(),
        "overworld",
        GenerationRequest::new(coordinates(10), 5),
        Some(&overrides),
        Utc::now(),
    )
    .unwrap();
    let session = transition.session;

    assert_eq!(session.version, 1);
    assert_eq!(session.attempt, 1);
    assert_eq!(session.status(), SessionStatus::Created);
    assert_eq!(session.configuration.chunk_batch_size, 4);
    assert_eq!(session.configuration.retry_policy.max_attempts, 5);
    assert_eq!(session.configuration.retry_policy.base_delay_ms, 1_000);
    assert_eq!(session.progress.pending_chunks, 10);
    assert!(session.started_at.is_none());
    assert_eq!(transition.events.len(), 1);
    assert_eq!(transition.events[0].kind(), "session_created");
}

#[test]
fn test_start_partitions_into_batches() {
    let session = create_session(100, None);
    let transition = session.start(Utc::now()).unwrap();
    let started = transition.session;

    assert_eq!(started.status(), SessionStatus::Running);
    assert_eq!(started.version, 2);
    assert_eq!(started.state.batches.len(), 7);
    assert_eq!(started.progress.current_stage, GenerationStage::Generating);
    assert_eq!(started.progress.statistics.total_batches, 7);
    assert!(matches!(
        transition.events[..],
        [SessionEvent::SessionStarted {
            batch_count: 7,
            total_chunks: 100
        }]
    ));

    // Starting twice is an illegal transition and leaves the input alone
    assert!(matches!(
        started.start(Utc::now()),
        Err(SessionError::InvalidTransition { .. })
    ));
}

#[test]
fn test_happy_path_completes_session() {
    let mut session = started_session(100, None);
    let mut events = Vec::new();
    let start = Utc::now();

    for (index, batch_id) in session.state.pending_batch_ids().into_iter().enumerate() {
        let now = start + Duration::milliseconds(100 * (index as i64 + 1));
        let previous_version = session.version;
        let previous_activity = session.last_activity;

        let begun = session.begin_batch(batch_id, now).unwrap();
        assert_eq!(begun.session.version, previous_version + 1);
        let chunks = begun.session.state.batch(batch_id).unwrap().chunk_count();
        let completed = begun.session.complete_batch(batch_id, chunks, now).unwrap();
        assert_eq!(completed.session.version, previous_version + 2);
        assert!(completed.session.last_activity >= previous_activity);

        events.extend(begun.events);
        events.extend(completed.events);
        session = completed.session;
    }

    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(session.completed_at.is_some());
    assert_eq!(session.progress.completed_chunks, 100);
    assert_eq!(session.progress.pending_chunks, 0);
    assert_eq!(session.progress.current_stage, GenerationStage::Completed);

    let kinds: Vec<_> = events.iter().map(SessionEvent::kind).collect();
    assert_eq!(kinds.iter().filter(|k| **k == "batch_completed").count(), 7);
    assert_eq!(kinds.iter().filter(|k| **k == "progress_updated").count(), 6);
    match events.last() {
        Some(SessionEvent::SessionCompleted { statistics }) => {
            assert_eq!(statistics.completed_chunks, 100);
            assert_eq!(statistics.failed_chunks, 0);
            assert_eq!(statistics.total_batches, 7);
        }
        other => panic!("expected completion event, got {:?}", other),
    }
}

#[test]
fn test_complete_batch_counts_missing_results_as_failed() {
    let session = started_session(10, None);
    let batch_id = session.state.batches[0].id;
    let now = Utc::now();

    let begun = session.begin_batch(batch_id, now).unwrap().session;
    assert!(matches!(
        begun.complete_batch(batch_id, 11, now),
        Err(SessionError::ProgressOverflow { .. })
    ));

    let completed = begun.complete_batch(batch_id, 7, now).unwrap().session;
    assert_eq!(completed.progress.completed_chunks, 7);
    assert_eq!(completed.progress.failed_chunks, 3);
    assert_eq!(completed.status(), SessionStatus::Completed);
}

#[test]
fn test_fail_batch_retries_with_backoff_then_gives_up() {
    let session = started_session(8, None);
    let batch_id = session.state.batches[0].id;
    let coordinate = session.state.batches[0].coordinates[0];
    let now = Utc::now();

    let mut session = session;
    let mut delays = Vec::new();
    for attempt in 1..=2 {
        let begun = session.begin_batch(batch_id, now).unwrap().session;
        let failed = begun.fail_batch(batch_id, &noise_error(coordinate), now).unwrap();
        match &failed.events[..] {
            [SessionEvent::BatchFailed {
                will_retry: true,
                retry_delay_ms: Some(delay),
                error,
                ..
            }] => {
                assert_eq!(error.retry_count, attempt);
                assert_eq!(error.category, ErrorCategory::Generation);
                delays.push(*delay);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(
            failed.session.state.batch(batch_id).unwrap().status,
            BatchStatus::Retrying
        );

        let requeued = failed.session.requeue_batch(batch_id, now).unwrap();
        assert!(matches!(
            requeued.events[..],
            [SessionEvent::BatchRetried { attempt: next, .. }] if next == attempt + 1
        ));
        session = requeued.session;
    }
    assert_eq!(delays, vec![1_000, 2_000]);
    assert_eq!(session.progress.statistics.retried_batches, 2);

    let begun = session.begin_batch(batch_id, now).unwrap().session;
    let failed = begun
        .fail_batch(batch_id, &noise_error(coordinate), now)
        .unwrap();
    let batch = failed.session.state.batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.attempts, 3);
    assert_eq!(failed.session.progress.failed_chunks, 8);
    assert_eq!(failed.session.error_history.len(), 3);
    // Every chunk has settled, so the session finalizes
    assert_eq!(failed.session.status(), SessionStatus::Completed);
    assert!(failed.events.last().is_some_and(SessionEvent::is_terminal));
}

#[test]
fn test_fatal_errors_are_not_retried() {
    let session = started_session(20, None);
    let batch_id = session.state.batches[0].id;
    let coordinate = session.state.batches[0].coordinates[0];
    let now = Utc::now();

    let begun = session.begin_batch(batch_id, now).unwrap().session;
    let error = GenerationError::CorruptedOutput {
        coordinate,
        reason: "checksum mismatch".to_string(),
    };
    let failed = begun.fail_batch(batch_id, &error, now).unwrap();

    assert!(matches!(
        failed.events[0],
        SessionEvent::BatchFailed {
            will_retry: false,
            retry_delay_ms: None,
            ..
        }
    ));
    assert_eq!(failed.events[1].kind(), "progress_updated");
    assert_eq!(failed.session.progress.failed_chunks, 16);
    assert_eq!(failed.session.status(), SessionStatus::Running);
}

#[test]
fn test_pause_resume_and_terminal_transitions() {
    let created = create_session(10, None);
    assert!(created.pause("too early", Utc::now()).is_err());

    let start = Utc::now();
    let session = created.start(start).unwrap().session;
    let paused = session
        .pause("maintenance", start + Duration::seconds(1))
        .unwrap()
        .session;
    assert_eq!(paused.status(), SessionStatus::Paused);
    assert_eq!(
        paused.state.execution_context.pause_reason.as_deref(),
        Some("maintenance")
    );

    let resumed = paused.resume(start + Duration::seconds(4)).unwrap();
    assert!(matches!(
        resumed.events[..],
        [SessionEvent::SessionResumed {
            paused_duration_ms: 3_000
        }]
    ));

    let cancelled = resumed
        .session
        .cancel(CancelReason::UserRequested, start + Duration::seconds(5))
        .unwrap()
        .session;
    assert!(cancelled.is_terminal());
    assert_eq!(
        cancelled.state.execution_context.termination_reason,
        Some(TerminationReason::Cancelled {
            reason: CancelReason::UserRequested
        })
    );

    let batch_id = cancelled.state.batches[0].id;
    assert!(matches!(
        cancelled.begin_batch(batch_id, Utc::now()),
        Err(SessionError::SessionTerminal { .. })
    ));
    assert!(cancelled.fail("late", Utc::now()).is_err());
    assert!(cancelled.resume(Utc::now()).is_err());
}

#[test]
fn test_explicit_complete_requires_settled_chunks() {
    let session = started_session(10, None);
    assert!(session.complete(Utc::now()).is_err());
}

#[test]
fn test_progress_rate_uses_moving_average() {
    let t0 = Utc::now();
    let progress = ProgressData::new(100, t0).start_tracking(t0);

    let progress = progress
        .update_progress(10, 0, t0 + Duration::seconds(1))
        .unwrap();
    assert!((progress.chunks_per_second - 10.0).abs() < 1e-9);

    let progress = progress
        .update_progress(10, 0, t0 + Duration::seconds(3))
        .unwrap();
    assert!((progress.chunks_per_second - 8.5).abs() < 1e-9);
    assert!((progress.statistics.peak_chunks_per_second - 10.0).abs() < 1e-9);

    let eta = progress.estimated_time_remaining_ms.unwrap();
    assert!((9_410..=9_412).contains(&eta), "eta was {}", eta);
    assert!((progress.overall_progress - 0.2).abs() < 1e-9);

    assert!(matches!(
        progress.update_progress(81, 0, t0 + Duration::seconds(4)),
        Err(SessionError::ProgressOverflow {
            requested: 81,
            pending: 80
        })
    ));
}

#[test]
fn test_progress_excludes_paused_time() {
    let t0 = Utc::now();
    let progress = ProgressData::new(50, t0)
        .start_tracking(t0)
        .pause_tracking(t0 + Duration::seconds(1));
    let (progress, paused_for) = progress.resume_tracking(t0 + Duration::seconds(11));
    assert_eq!(paused_for, 10_000);

    let progress = progress
        .update_progress(10, 0, t0 + Duration::seconds(12))
        .unwrap();
    assert!((progress.chunks_per_second - 5.0).abs() < 1e-9);
    assert_eq!(progress.timing.total_paused_ms, 10_000);
}

#[test]
fn test_progress_with_no_rate_still_estimates() {
    let t0 = Utc::now();
    let progress = ProgressData::new(10, t0)
        .update_progress(0, 1, t0)
        .unwrap();
    // No active time yet: the rate floor keeps the estimate finite
    assert_eq!(progress.chunks_per_second, 0.0);
    let eta = progress.estimated_time_remaining_ms.unwrap();
    assert!((8_999_999..=9_000_000).contains(&eta), "eta was {}", eta);
}

#[test]
fn test_backoff_schedules() {
    let mut policy = RetryPolicy::default();
    let delays: Vec<u64> = (1..=6).map(|n| calculate_retry_delay(&policy, n)).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
    assert_eq!(calculate_retry_delay(&policy, 200), 30_000);

    policy.backoff_strategy = BackoffStrategy::Linear;
    let delays: Vec<u64> = (1..=3).map(|n| calculate_retry_delay(&policy, n)).collect();
    assert_eq!(delays, vec![1_000, 2_000, 3_000]);

    policy.backoff_strategy = BackoffStrategy::Constant;
    assert_eq!(calculate_retry_delay(&policy, 9), 1_000);
}

#[test]
fn test_retry_eligibility() {
    let policy = RetryPolicy::default();
    let coordinate = ChunkCoordinate::new(3, 4);
    let batch_id = Uuid::new_v4();
    let now = Utc::now();

    let transient = SessionErrorRecord::from_generation_error(
        batch_id,
        &noise_error(coordinate),
        2,
        now,
    );
    assert!(should_retry_batch(&policy, &transient));
    assert_eq!(transient.coordinate, Some(coordinate));

    let exhausted = SessionErrorRecord::from_generation_error(
        batch_id,
        &noise_error(coordinate),
        3,
        now,
    );
    assert!(!should_retry_batch(&policy, &exhausted));

    let fatal = SessionErrorRecord::from_generation_error(
        batch_id,
        &GenerationError::InvalidCoordinate {
            coordinate,
            reason: "outside world border".to_string(),
        },
        1,
        now,
    );
    assert_eq!(fatal.category, ErrorCategory::Validation);
    assert!(!should_retry_batch(&policy, &fatal));
}

#[test]
fn test_error_analysis_and_strategy() {
    let now = Utc::now();
    let first_batch = Uuid::new_v4();
    let second_batch = Uuid::new_v4();
    let coordinate = ChunkCoordinate::new(0, 0);

    let transient: Vec<_> = (0..3)
        .map(|i| {
            SessionErrorRecord::from_generation_error(
                first_batch,
                &GenerationError::Timeout {
                    coordinate,
                    timeout_ms: 100,
                },
                i + 1,
                now + Duration::seconds(i64::from(i)),
            )
        })
        .collect();
    let analysis = analyze_errors(&transient);
    assert_eq!(analysis.total_errors, 3);
    assert_eq!(analysis.affected_batches, 1);
    assert_eq!(analysis.most_common_category, Some(ErrorCategory::Timeout));
    assert_eq!(analysis.first_error_at, Some(now));
    assert_eq!(analysis.last_error_at, Some(now + Duration::seconds(2)));
    assert_eq!(suggest_recovery_strategy(&analysis), RecoveryStrategy::Aggressive);

    let mut mixed = transient.clone();
    mixed.push(SessionErrorRecord::from_generation_error(
        second_batch,
        &GenerationError::InvalidCoordinate {
            coordinate,
            reason: "bad".to_string(),
        },
        1,
        now,
    ));
    let analysis = analyze_errors(&mixed);
    assert_eq!(analysis.fatal_errors, 1);
    assert_eq!(analysis.affected_batches, 2);
    assert_eq!(suggest_recovery_strategy(&analysis), RecoveryStrategy::Smart);

    let corrupted: Vec<_> = (0..2)
        .map(|_| {
            SessionErrorRecord::from_generation_error(
                second_batch,
                &GenerationError::CorruptedOutput {
                    coordinate,
                    reason: "bad".to_string(),
                },
                1,
                now,
            )
        })
        .collect();
    let analysis = analyze_errors(&corrupted);
    assert_eq!(suggest_recovery_strategy(&analysis), RecoveryStrategy::Conservative);
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(u64, &'static str)>>,
}

impl SessionEventHandler for RecordingHandler {
    fn handle_event(&self, envelope: &SessionEventEnvelope) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((envelope.sequence, envelope.event.kind()));
        Ok(())
    }
}

struct FailingHandler;

impl SessionEventHandler for FailingHandler {
    fn handle_event(&self, _envelope: &SessionEventEnvelope) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("subscriber is broken"))
    }
}

struct PanickingHandler;

impl SessionEventHandler for PanickingHandler {
    fn handle_event(&self, _envelope: &SessionEventEnvelope) -> anyhow::Result<()> {
        panic!("subscriber panicked")
    }
}

#[test]
fn test_event_bus_isolates_subscribers() {
    let bus = SessionEventBus::new();
    let recorder = Arc::new(RecordingHandler::default());
    bus.subscribe(Arc::new(FailingHandler));
    bus.subscribe(Arc::new(PanickingHandler));
    let recorder_id = bus.subscribe(recorder.clone());
    assert_eq!(bus.subscriber_count(), 3);

    let session_id = Uuid::new_v4();
    let envelopes = bus.publish_all(
        session_id,
        vec![
            SessionEvent::SessionPaused {
                reason: "a".to_string(),
            },
            SessionEvent::SessionResumed {
                paused_duration_ms: 5,
            },
        ],
    );
    assert_eq!(envelopes.len(), 2);
    assert!(envelopes[0].sequence < envelopes[1].sequence);

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (envelopes[0].sequence, "session_paused"),
            (envelopes[1].sequence, "session_resumed"),
        ]
    );

    assert!(bus.unsubscribe(recorder_id));
    assert!(!bus.unsubscribe(recorder_id));
    bus.publish(
        session_id,
        SessionEvent::SessionFailed {
            reason: "x".to_string(),
        },
    );
    assert_eq!(recorder.seen.lock().unwrap().len(), 2);
}

#[test]
fn test_event_bus_channel_backpressure() {
    let bus = SessionEventBus::new();
    let (_, mut receiver) = bus.subscribe_channel(1);
    let (_, closed) = bus.subscribe_channel(4);
    drop(closed);

    let session_id = Uuid::new_v4();
    for reason in ["one", "two", "three"] {
        bus.publish(
            session_id,
            SessionEvent::SessionPaused {
                reason: reason.to_string(),
            },
        );
    }

    assert_eq!(bus.dropped_events(), 2);
    // The closed channel was pruned on first delivery
    assert_eq!(bus.subscriber_count(), 1);

    let first = receiver.try_recv().unwrap();
    assert!(matches!(first.event, SessionEvent::SessionPaused { ref reason } if reason == "one"));
    assert!(receiver.try_recv().is_err());
}

#[test]
fn test_event_serialization_is_tagged() {
    let event = SessionEvent::SessionCancelled {
        reason: CancelReason::SessionTimeout,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "session_cancelled");
    assert_eq!(json["reason"], "session_timeout");
    let parsed: SessionEvent = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, event);
}

#[tokio::test]
async fn test_simulated_generator_is_deterministic() {
    let coordinate = ChunkCoordinate::new(-3, 7);
    let first = SimulatedChunkGenerator::new("overworld", 42);
    let second = SimulatedChunkGenerator::new("overworld", 42);
    let other_seed = SimulatedChunkGenerator::new("overworld", 43);

    let a = first.generate(coordinate).await.unwrap();
    let b = second.generate(coordinate).await.unwrap();
    let c = other_seed.generate(coordinate).await.unwrap();
    assert_eq!(a, b);
    assert_ne!(a.checksum, c.checksum);
    assert_eq!(a.height_map.len(), CHUNK_SIZE * CHUNK_SIZE);

    let flaky = SimulatedChunkGenerator::new("overworld", 1).fail_coordinate(coordinate, 2);
    assert!(flaky.generate(coordinate).await.is_err());
    assert!(flaky.generate(coordinate).await.is_err());
    assert!(flaky.generate(coordinate).await.is_ok());
    assert_eq!(flaky.attempts_for(coordinate), 3);

    let broken = SimulatedChunkGenerator::new("overworld", 1).with_failure_rate(1.0);
    assert!(matches!(
        broken.generate(coordinate).await,
        Err(GenerationError::NoiseSource { .. })
    ));
}

/// 100 chunks in batches of 5: 10 completed, 1 exhausted, 9 never run
fn failed_session_with_one_corrupted_batch() -> GenerationSession {
    let overrides = SessionConfigurationOverrides::default()
        .with_batch_size(5)
        .with_retry_policy(RetryPolicyOverrides {
            max_attempts: Some(1),
            ..Default::default()
        });
    let mut session = started_session(100, Some(&overrides));
    let batch_ids = session.state.pending_batch_ids();
    let now = Utc::now();

    for batch_id in &batch_ids[..10] {
        let begun = session.begin_batch(*batch_id, now).unwrap().session;
        session = begun.complete_batch(*batch_id, 5, now).unwrap().session;
    }

    let corrupted = batch_ids[10];
    let coordinate = session.state.batch(corrupted).unwrap().coordinates[0];
    let begun = session.begin_batch(corrupted, now).unwrap().session;
    session = begun
        .fail_batch(corrupted, &noise_error(coordinate), now)
        .unwrap()
        .session;

    session.fail("generator crashed", now).unwrap().session
}

#[test]
fn test_risk_levels() {
    assert_eq!(RiskLevel::from_corruption_ratio(0.05), RiskLevel::Low);
    assert_eq!(RiskLevel::from_corruption_ratio(0.10), RiskLevel::Medium);
    assert_eq!(RiskLevel::from_corruption_ratio(0.29), RiskLevel::Medium);
    assert_eq!(RiskLevel::from_corruption_ratio(0.30), RiskLevel::High);
}

#[test]
fn test_recovery_analysis() {
    let session = failed_session_with_one_corrupted_batch();
    let recovery = SessionRecovery::new(RecoveryConfig::default());
    let analysis = recovery.analyze_session_recovery(&session);

    assert!(analysis.can_recover);
    assert_eq!(analysis.total_chunks, 100);
    assert_eq!(analysis.corrupted_chunks, 5);
    assert_eq!(analysis.interrupted_chunks, 45);
    assert_eq!(analysis.recoverable_chunks, 50);
    assert_eq!(analysis.risk_level, RiskLevel::Low);
    assert_eq!(analysis.error_analysis.total_errors, 1);
    assert!(!analysis.recommendations.is_empty());

    let running = started_session(10, None);
    assert!(!recovery.analyze_session_recovery(&running).can_recover);
}

#[test]
fn test_recovery_analysis_of_untouched_cancelled_session() {
    let session = started_session(40, None)
        .cancel(CancelReason::UserRequested, Utc::now())
        .unwrap()
        .session;
    let analysis =
        SessionRecovery::new(RecoveryConfig::default()).analyze_session_recovery(&session);

    assert!(analysis.can_recover);
    // Nothing settled yet: every chunk is interrupted, none recoverable
    assert_eq!(analysis.recoverable_chunks, 0);
    assert_eq!(analysis.interrupted_chunks, 40);
    assert_eq!(analysis.corrupted_chunks, 0);
    assert_eq!(analysis.risk_level, RiskLevel::Low);
    assert!(analysis.estimated_recovery_time_ms > 0);
}

#[tokio::test]
async fn test_recovery_smart_low_risk_requeues_everything() {
    let session = failed_session_with_one_corrupted_batch();
    let recovery = SessionRecovery::new(RecoveryConfig::default());

    let result = recovery
        .execute_session_recovery(&session, &RecoveryOptions::default())
        .await
        .unwrap();
    assert!(result.successful);
    assert_eq!(result.recovered_chunks, 50);
    assert_eq!(result.skipped_chunks, 0);
    assert_eq!(result.corrupted_chunks, 5);
    assert!(result.validation.as_ref().is_some_and(|v| v.is_valid));

    let recovered = &result.recovered_session;
    assert_eq!(recovered.status(), SessionStatus::Paused);
    assert_eq!(recovered.attempt, 2);
    assert_eq!(recovered.version, session.version + 1);
    assert_eq!(recovered.progress.completed_chunks, 50);
    assert_eq!(recovered.progress.pending_chunks, 50);
    assert_eq!(recovered.progress.failed_chunks, 0);
    assert_eq!(recovered.state.count_with_status(BatchStatus::Pending), 10);
    assert!(matches!(
        result.events[..],
        [SessionEvent::SessionRecovered {
            attempt: 2,
            requeued_batches: 10,
            skipped_batches: 0
        }]
    ));
}

#[tokio::test]
async fn test_recovery_can_skip_corrupted_batches() {
    let session = failed_session_with_one_corrupted_batch();
    let recovery = SessionRecovery::new(RecoveryConfig::default());

    for options in [
        RecoveryOptions {
            skip_corrupted: true,
            ..Default::default()
        },
        RecoveryOptions {
            strategy: RecoveryStrategy::Conservative,
            ..Default::default()
        },
    ] {
        let result = recovery
            .execute_session_recovery(&session, &options)
            .await
            .unwrap();
        assert_eq!(result.recovered_chunks, 45);
        assert_eq!(result.skipped_chunks, 5);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.recovered_session.progress.failed_chunks, 5);
        assert_eq!(result.recovered_session.progress.pending_chunks, 45);
    }
}

#[tokio::test]
async fn test_recovery_rejects_unrecoverable_sessions() {
    let recovery = SessionRecovery::new(RecoveryConfig::default());
    let running = started_session(10, None);
    assert!(matches!(
        recovery
            .execute_session_recovery(&running, &RecoveryOptions::default())
            .await,
        Err(SessionRecoveryError::NotRecoverable { .. })
    ));

    let mut exhausted = failed_session_with_one_corrupted_batch();
    exhausted.attempt = 6;
    assert!(!recovery.analyze_session_recovery(&exhausted).can_recover);
}

#[test]
fn test_recovery_validation_penalties() {
    let session = failed_session_with_one_corrupted_batch();
    let recovery = SessionRecovery::new(RecoveryConfig::default());

    let same = recovery.validate_recovered_session(&session, &session);
    assert!(same.is_valid);
    assert_eq!(same.confidence, 1.0);

    let mut moved = session.clone();
    moved.world_generator_id = "nether".to_string();
    let validation = recovery.validate_recovered_session(&session, &moved);
    assert!(!validation.is_valid);
    assert!((validation.confidence - 0.5).abs() < 1e-9);
    assert_eq!(validation.issues.len(), 1);

    let mut regressed = session.clone();
    regressed.progress = regressed.progress.from_counts(10, 0, 90).unwrap();
    let validation = recovery.validate_recovered_session(&session, &regressed);
    assert!(validation.is_valid);
    assert!((validation.confidence - 0.8).abs() < 1e-9);
}

fn manager_with(
    config: SessionManagerConfig,
) -> (Arc<SessionManager>, Arc<MemoryGenerationSessionRepository>) {
    let repository = Arc::new(MemoryGenerationSessionRepository::default());
    let manager = SessionManager::new(repository.clone(), Arc::new(SessionEventBus::new()))
        .with_config(config);
    (Arc::new(manager), repository)
}

#[tokio::test]
async fn test_manager_runs_session_to_completion() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let (_, mut events) = manager.events().subscribe_channel(1024);

    let session = manager
        .create_session("overworld", GenerationRequest::new(coordinates(100), 5), None)
        .await
        .unwrap();
    manager.start_session(session.id).await.unwrap();

    let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 7));
    let report = manager.run_session(session.id, generator).await.unwrap();

    assert_eq!(report.final_status, SessionStatus::Completed);
    assert_eq!(report.batches_completed, 7);
    assert_eq!(report.chunks_generated, 100);
    assert!(!report.timed_out);

    let stored = manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.progress.completed_chunks, 100);
    assert!(stored.completed_at.is_some());

    let mut received = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        received.push(envelope);
    }
    assert_eq!(received.first().unwrap().event.kind(), "session_created");
    assert_eq!(received[1].event.kind(), "session_started");
    assert_eq!(received.last().unwrap().event.kind(), "session_completed");
    assert!(received.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(received.iter().all(|e| e.session_id == session.id));
}

#[tokio::test(start_paused = true)]
async fn test_manager_retries_transient_failures() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let request = GenerationRequest::new(coordinates(16), 5);
    let flaky = request.coordinates[3];

    let session = manager.create_session("overworld", request, None).await.unwrap();
    manager.start_session(session.id).await.unwrap();

    let generator =
        Arc::new(SimulatedChunkGenerator::new("overworld", 7).fail_coordinate(flaky, 2));
    let report = manager
        .run_session(session.id, generator.clone())
        .await
        .unwrap();

    assert_eq!(report.final_status, SessionStatus::Completed);
    assert_eq!(report.retries_scheduled, 2);
    assert_eq!(report.batches_completed, 1);
    assert_eq!(generator.attempts_for(flaky), 3);

    let stored = manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.progress.statistics.retried_batches, 2);
    assert_eq!(stored.error_history.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manager_gives_up_after_max_attempts() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let request = GenerationRequest::new(coordinates(32), 5);
    let broken = request.coordinates[20];

    let session = manager.create_session("overworld", request, None).await.unwrap();
    manager.start_session(session.id).await.unwrap();

    let generator =
        Arc::new(SimulatedChunkGenerator::new("overworld", 7).fail_coordinate(broken, 10));
    let report = manager
        .run_session(session.id, generator.clone())
        .await
        .unwrap();

    assert_eq!(report.final_status, SessionStatus::Completed);
    assert_eq!(report.batches_completed, 1);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(generator.attempts_for(broken), 3);

    let stored = manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.progress.completed_chunks, 16);
    assert_eq!(stored.progress.failed_chunks, 16);
}

#[tokio::test(start_paused = true)]
async fn test_manager_cancels_on_session_timeout() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let overrides = SessionConfigurationOverrides::default()
        .with_batch_size(4)
        .with_max_concurrent_chunks(1)
        .with_timeout_policy(TimeoutPolicyOverrides {
            chunk_timeout_ms: Some(15_000),
            session_timeout_ms: Some(25_000),
            graceful_shutdown_ms: Some(1_000),
        });

    let session = manager
        .create_session(
            "overworld",
            GenerationRequest::new(coordinates(8), 5),
            Some(&overrides),
        )
        .await
        .unwrap();
    manager.start_session(session.id).await.unwrap();

    let generator = Arc::new(
        SimulatedChunkGenerator::new("overworld", 7)
            .with_latency(std::time::Duration::from_secs(10)),
    );
    let report = manager.run_session(session.id, generator).await.unwrap();

    assert!(report.timed_out);
    assert_eq!(report.final_status, SessionStatus::Cancelled);
    let stored = manager.get_session(session.id).await.unwrap();
    assert_eq!(
        stored.state.execution_context.termination_reason,
        Some(TerminationReason::Cancelled {
            reason: CancelReason::SessionTimeout
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_manager_times_out_waiting_on_external_batch() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let overrides = SessionConfigurationOverrides::default()
        .with_batch_size(4)
        .with_timeout_policy(TimeoutPolicyOverrides {
            chunk_timeout_ms: Some(1_000),
            session_timeout_ms: Some(5_000),
            graceful_shutdown_ms: Some(500),
        });
    let session = manager
        .create_session(
            "overworld",
            GenerationRequest::new(coordinates(4), 5),
            Some(&overrides),
        )
        .await
        .unwrap();
    let started = manager.start_session(session.id).await.unwrap();

    // Another worker owns the only batch and never reports back
    let batch_id = started.state.batches[0].id;
    manager.begin_batch(session.id, batch_id).await.unwrap();

    let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 7));
    let report = manager.run_session(session.id, generator).await.unwrap();

    assert!(report.timed_out);
    assert_eq!(report.batches_completed, 0);
    assert_eq!(report.final_status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn test_manager_forgets_locks_of_finished_sessions() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let finished = manager
        .create_session("overworld", GenerationRequest::new(coordinates(10), 5), None)
        .await
        .unwrap();
    let idle = manager
        .create_session("overworld", GenerationRequest::new(coordinates(10), 5), None)
        .await
        .unwrap();
    assert_eq!(manager.tracked_lock_count(), 2);

    manager.start_session(finished.id).await.unwrap();
    let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 7));
    let report = manager.run_session(finished.id, generator).await.unwrap();
    assert_eq!(report.final_status, SessionStatus::Completed);
    assert_eq!(manager.tracked_lock_count(), 1);

    manager
        .cancel_session(idle.id, CancelReason::UserRequested)
        .await
        .unwrap();
    assert_eq!(manager.tracked_lock_count(), 0);
}

#[tokio::test]
async fn test_manager_driver_stops_when_paused() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let session = manager
        .create_session("overworld", GenerationRequest::new(coordinates(20), 5), None)
        .await
        .unwrap();
    manager.start_session(session.id).await.unwrap();
    manager.pause_session(session.id, "maintenance").await.unwrap();

    let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 7));
    let report = manager.run_session(session.id, generator.clone()).await.unwrap();
    assert_eq!(report.final_status, SessionStatus::Paused);
    assert_eq!(report.batches_completed, 0);

    manager.resume_session(session.id).await.unwrap();
    let report = manager.run_session(session.id, generator).await.unwrap();
    assert_eq!(report.final_status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_manager_serializes_concurrent_operations() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let session = manager
        .create_session("overworld", GenerationRequest::new(coordinates(100), 5), None)
        .await
        .unwrap();
    let started = manager.start_session(session.id).await.unwrap();

    let mut handles = Vec::new();
    for batch in started.state.batches.clone() {
        let manager = manager.clone();
        let session_id = session.id;
        handles.push(tokio::spawn(async move {
            manager.begin_batch(session_id, batch.id).await?;
            manager
                .complete_batch(session_id, batch.id, batch.chunk_count())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.status(), SessionStatus::Completed);
    // created (1) + start (1) + begin and complete per batch
    assert_eq!(stored.version, 2 + 2 * 7);
    assert_eq!(stored.progress.completed_chunks, 100);
}

#[tokio::test]
async fn test_manager_rejects_illegal_transitions() {
    let (manager, _) = manager_with(SessionManagerConfig::default());
    let session = manager
        .create_session("overworld", GenerationRequest::new(coordinates(4), 5), None)
        .await
        .unwrap();

    let error = manager.resume_session(session.id).await.unwrap_err();
    assert!(error.session_error().is_some());
    assert_eq!(manager.get_session(session.id).await.unwrap().version, 1);

    let missing = manager.start_session(Uuid::new_v4()).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn test_manager_recovers_and_finishes_session() {
    let (manager, repository) = manager_with(SessionManagerConfig::default());
    let session = manager
        .create_session("overworld", GenerationRequest::new(coordinates(40), 5), None)
        .await
        .unwrap();
    let started = manager.start_session(session.id).await.unwrap();
    let first_batch = started.state.batches[0].id;
    manager.begin_batch(session.id, first_batch).await.unwrap();
    manager
        .complete_batch(session.id, first_batch, 16)
        .await
        .unwrap();
    manager.fail_session(session.id, "worker crashed").await.unwrap();

    let analysis = manager.analyze_recovery(session.id).await.unwrap();
    assert!(analysis.can_recover);
    assert_eq!(analysis.interrupted_chunks, 24);

    let options = RecoveryOptions {
        create_backup: true,
        ..Default::default()
    };
    let result = manager.recover_session(session.id, &options).await.unwrap();
    assert!(result.backup_checkpoint.is_some());
    assert_eq!(result.recovered_session.status(), SessionStatus::Paused);
    assert_eq!(repository.list_checkpoints(session.id).await.unwrap().len(), 1);

    manager.resume_session(session.id).await.unwrap();
    let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 7));
    let report = manager.run_session(session.id, generator).await.unwrap();
    assert_eq!(report.final_status, SessionStatus::Completed);
    assert_eq!(report.batches_completed, 2);

    let stored = manager.get_session(session.id).await.unwrap();
    assert_eq!(stored.attempt, 2);
    assert_eq!(stored.progress.completed_chunks, 40);
}

#[tokio::test]
async fn test_manager_tracks_chunk_tasks() {
    let config = SessionManagerConfig {
        track_chunk_tasks: true,
        ..Default::default()
    };
    let (manager, repository) = manager_with(config);
    let session = manager
        .create_session("overworld", GenerationRequest::new(coordinates(20), 5), None)
        .await
        .unwrap();
    assert_eq!(repository.get_pending_chunks(session.id).await.unwrap().len(), 20);

    manager.start_session(session.id).await.unwrap();
    let generator = Arc::new(SimulatedChunkGenerator::new("overworld", 7));
    manager.run_session(session.id, generator).await.unwrap();

    let completed = repository.get_completed_chunks(session.id).await.unwrap();
    assert_eq!(completed.len(), 20);
    assert!(completed.iter().all(|task| task.status == ChunkTaskStatus::Completed));
    assert!(repository.get_pending_chunks(session.id).await.unwrap().is_empty());
}
