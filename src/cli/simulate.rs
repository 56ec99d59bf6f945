//! `chunkgen simulate`: one session end to end against the simulated generator.

use crate::cache::{CacheStatistics, GeneratorCache};
use crate::cli::args::SimulateArgs;
use crate::config::OrchestratorConfig;
use crate::repository::{
    GenerationSessionRepository, MemoryGenerationSessionRepository, RepositoryStatistics,
    SnapshotStore,
};
use crate::session::{
    ChunkCoordinate, ChunkGenerator, GenerationRequest, LoggingEventHandler,
    SessionConfigurationOverrides, SessionEvent, SessionEventBus, SessionManager, SessionRunReport,
    SimulatedChunkGenerator,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub report: SessionRunReport,
    pub statistics: RepositoryStatistics,
    pub generator_cache: CacheStatistics,
    pub snapshot_path: Option<PathBuf>,
}

/// Row-major square of `side` x `side` chunks centred on the origin
pub fn square_region(side: u32) -> Vec<ChunkCoordinate> {
    let side = side as i32;
    let offset = side / 2;
    (0..side)
        .flat_map(|z| (0..side).map(move |x| ChunkCoordinate::new(x - offset, z - offset)))
        .collect()
}

pub async fn run_simulation(
    config: &OrchestratorConfig,
    args: &SimulateArgs,
) -> Result<SimulationSummary> {
    let repository = Arc::new(MemoryGenerationSessionRepository::new(config.repository.clone()));
    let events = Arc::new(SessionEventBus::new());
    events.subscribe(Arc::new(LoggingEventHandler));

    let manager = SessionManager::new(repository.clone(), events.clone())
        .with_config(config.manager.clone())
        .with_session_defaults(config.session.clone())
        .with_recovery_config(config.recovery.clone());

    let printer = if args.verbose {
        let (subscription, mut receiver) = events.subscribe_channel(256);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                match envelope.event {
                    SessionEvent::ProgressUpdated { progress } => println!(
                        "  {:>5.1}%  {} done, {} failed, {} pending",
                        progress.overall_progress * 100.0,
                        progress.completed_chunks,
                        progress.failed_chunks,
                        progress.pending_chunks
                    ),
                    event => println!("  {}", event.kind()),
                }
            }
        });
        Some((subscription, handle))
    } else {
        None
    };

    let generators = GeneratorCache::new(&config.cache);
    let seed = args.seed;
    let failure_rate = args.failure_rate;
    let latency = Duration::from_millis(args.latency_ms);
    let generator = generators
        .get_or_create(&args.world, || async {
            let generator: Arc<dyn ChunkGenerator> = Arc::new(
                SimulatedChunkGenerator::new(args.world.clone(), seed)
                    .with_failure_rate(failure_rate)
                    .with_latency(latency),
            );
            Ok::<_, anyhow::Error>(generator)
        })
        .await?;

    let mut overrides = SessionConfigurationOverrides::default();
    if let Some(batch_size) = args.batch_size {
        overrides = overrides.with_batch_size(batch_size);
    }
    if let Some(concurrency) = args.concurrency {
        overrides = overrides.with_max_concurrent_chunks(concurrency);
    }

    let request = GenerationRequest::new(square_region(args.region), args.priority);
    let session = manager
        .create_session(&args.world, request, Some(&overrides))
        .await
        .context("Failed to create session")?;
    info!(
        "Created session {} with {} batches of up to {} chunks",
        session.id,
        session.request.coordinates.len().div_ceil(session.configuration.chunk_batch_size as usize),
        session.configuration.chunk_batch_size
    );

    manager.start_session(session.id).await?;
    let report = manager.run_session(session.id, generator).await?;

    if let Some((subscription, handle)) = printer {
        events.unsubscribe(subscription);
        handle.await.context("Progress printer panicked")?;
    }

    let snapshot_path = match &args.snapshot_dir {
        Some(dir) => {
            let store = SnapshotStore::in_directory(dir, config.snapshot.clone());
            let result = store.save(&repository.export_store().await).await?;
            Some(result.path)
        }
        None => None,
    };

    Ok(SimulationSummary {
        report,
        statistics: repository.get_statistics().await?,
        generator_cache: generators.statistics().await,
        snapshot_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use tempfile::TempDir;

    fn simulate_args(region: u32) -> SimulateArgs {
        SimulateArgs {
            world: "overworld".to_string(),
            region,
            priority: 5,
            seed: 7,
            failure_rate: 0.0,
            latency_ms: 0,
            batch_size: Some(4),
            concurrency: Some(2),
            snapshot_dir: None,
            json: false,
            verbose: false,
        }
    }

    #[test]
    fn test_square_region() {
        let region = square_region(3);
        assert_eq!(region.len(), 9);
        assert_eq!(region[0], ChunkCoordinate::new(-1, -1));
        assert_eq!(region[8], ChunkCoordinate::new(1, 1));
    }

    #[tokio::test]
    async fn test_simulation_completes_and_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        let mut args = simulate_args(5);
        args.snapshot_dir = Some(temp_dir.path().to_path_buf());

        let summary = run_simulation(&OrchestratorConfig::default(), &args).await.unwrap();

        assert_eq!(summary.report.final_status, SessionStatus::Completed);
        assert_eq!(summary.report.chunks_generated, 25);
        assert_eq!(summary.report.batches_completed, 7);
        assert_eq!(summary.statistics.total_sessions, 1);
        assert_eq!(summary.statistics.total_chunks_generated, 25);
        assert_eq!(summary.generator_cache.hits, 0);
        assert!(summary.generator_cache.misses > 0);

        let snapshot = summary.snapshot_path.unwrap();
        assert!(snapshot.exists());
    }
}
