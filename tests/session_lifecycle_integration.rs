use chrono::{Duration, Utc};
use chunkgen::session::{
    BackoffStrategy, BatchStatus, ChunkCoordinate, GenerationError, GenerationRequest,
    GenerationSession, RetryPolicy, RetryPolicyOverrides, SessionConfigurationOverrides,
    SessionEvent, SessionStatus, calculate_retry_delay,
};
use uuid::Uuid;

fn grid(count: i32) -> Vec<ChunkCoordinate> {
    (0..count).map(|i| ChunkCoordinate::new(i % 10, i / 10)).collect()
}

fn created(count: i32, overrides: Option<&SessionConfigurationOverrides>) -> GenerationSession {
    GenerationSession::create(
        Uuid::new_v4(),
        "overworld",
        GenerationRequest::new(grid(count), 5),
        overrides,
        Utc::now(),
    )
    .expect("valid request")
    .session
}

#[test]
fn test_hundred_chunks_complete_in_seven_batches() {
    let mut now = Utc::now();
    let session = created(100, None);
    assert_eq!(session.status(), SessionStatus::Created);
    assert_eq!(session.progress.pending_chunks, 100);

    let mut session = session.start(now).unwrap().session;
    assert_eq!(session.state.batches.len(), 7);
    let sizes: Vec<_> = session.state.batches.iter().map(|b| b.chunk_count()).collect();
    assert_eq!(sizes, vec![16, 16, 16, 16, 16, 16, 4]);

    let mut last_progress = 0.0;
    let mut last_version = session.version;
    let mut final_events = Vec::new();
    for batch_id in session.state.pending_batch_ids() {
        now += Duration::milliseconds(250);
        session = session.begin_batch(batch_id, now).unwrap().session;
        let chunks = session.state.batch(batch_id).unwrap().chunk_count();
        let transition = session.complete_batch(batch_id, chunks, now).unwrap();
        session = transition.session;
        final_events = transition.events;

        let progress = &session.progress;
        assert_eq!(
            progress.completed_chunks + progress.failed_chunks + progress.pending_chunks,
            progress.total_chunks
        );
        assert!(progress.overall_progress >= last_progress);
        assert!(session.version > last_version);
        last_progress = progress.overall_progress;
        last_version = session.version;
    }

    assert_eq!(session.status(), SessionStatus::Completed);
    assert_eq!(session.progress.completed_chunks, 100);
    assert_eq!(session.progress.overall_progress, 1.0);
    assert!(session.completed_at.is_some());
    assert!(session.state.all_batches_terminal());
    assert!(matches!(
        final_events.last(),
        Some(SessionEvent::SessionCompleted { .. })
    ));
}

#[test]
fn test_duplicate_coordinates_are_rejected() {
    let mut coordinates = grid(10);
    coordinates.push(ChunkCoordinate::new(3, 0));

    let error = GenerationSession::create(
        Uuid::new_v4(),
        "overworld",
        GenerationRequest::new(coordinates, 5),
        None,
        Utc::now(),
    )
    .unwrap_err();
    assert!(error.has_duplicate_coordinates());
}

#[test]
fn test_exponential_backoff_schedule() {
    let policy = RetryPolicy {
        max_attempts: 10,
        backoff_strategy: BackoffStrategy::Exponential,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
    };
    let delays: Vec<_> = (1..=6).map(|n| calculate_retry_delay(&policy, n)).collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
}

#[test]
fn test_batch_attempts_never_exceed_max_attempts() {
    let overrides = SessionConfigurationOverrides::default()
        .with_batch_size(10)
        .with_retry_policy(RetryPolicyOverrides {
            max_attempts: Some(3),
            ..Default::default()
        });
    let now = Utc::now();
    let mut session = created(10, Some(&overrides)).start(now).unwrap().session;
    let batch_id = session.state.batches[0].id;
    let coordinate = session.state.batches[0].coordinates[0];
    let error = GenerationError::NoiseSource {
        coordinate,
        reason: "flaky".to_string(),
    };

    let mut retry_decisions = Vec::new();
    loop {
        session = session.begin_batch(batch_id, now).unwrap().session;
        let transition = session.fail_batch(batch_id, &error, now).unwrap();
        session = transition.session;
        let Some(SessionEvent::BatchFailed { will_retry, .. }) = transition.events.first() else {
            panic!("expected a batch failure event");
        };
        retry_decisions.push(*will_retry);
        if !will_retry {
            break;
        }
        session = session.requeue_batch(batch_id, now).unwrap().session;
    }

    assert_eq!(retry_decisions, vec![true, true, false]);
    let batch = session.state.batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.attempts, 3);
    assert_eq!(session.error_history.len(), 3);
    assert_eq!(session.status(), SessionStatus::Completed);
    assert_eq!(session.progress.failed_chunks, 10);
}

#[test]
fn test_paused_session_rejects_batch_work_until_resumed() {
    let now = Utc::now();
    let session = created(20, None).start(now).unwrap().session;
    let batch_id = session.state.batches[0].id;

    let paused = session.pause("operator", now).unwrap().session;
    assert!(paused.begin_batch(batch_id, now).is_err());
    assert!(paused.pause("again", now).is_err());

    let resumed = paused.resume(now + Duration::seconds(5)).unwrap().session;
    assert!(resumed.begin_batch(batch_id, now + Duration::seconds(5)).is_ok());
}
