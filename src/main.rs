use anyhow::Result;
use chunkgen::cli::{Args, Commands, SimulateArgs, run_simulation};
use chunkgen::config::{ConfigDiscovery, OrchestratorConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match args.command {
        Commands::Simulate(simulate) => run_simulate(&config, &simulate).await,
        Commands::ShowConfig => show_config(&config),
        Commands::InitConfig { dir } => init_config(dir),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(config_override: Option<&PathBuf>) -> Result<OrchestratorConfig> {
    match config_override {
        Some(path) => OrchestratorConfig::from_toml_file(path),
        None => ConfigDiscovery::discover_config(),
    }
}

async fn run_simulate(config: &OrchestratorConfig, args: &SimulateArgs) -> Result<()> {
    info!(
        "Simulating {}x{} region of world {} (seed {})",
        args.region, args.region, args.world, args.seed
    );
    let summary = run_simulation(config, args).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let report = &summary.report;
    println!("Session {}: {}", report.session_id, report.final_status);
    println!(
        "  chunks generated: {}  batches completed: {}  batches failed: {}",
        report.chunks_generated, report.batches_completed, report.batches_failed
    );
    println!(
        "  retries scheduled: {}  timed out: {}  duration: {}ms",
        report.retries_scheduled, report.timed_out, report.duration_ms
    );
    println!(
        "  throughput: {:.1} chunks/s  failure rate: {:.2}",
        summary.statistics.average_throughput, summary.statistics.failure_rate
    );
    if let Some(path) = &summary.snapshot_path {
        println!("  snapshot: {}", path.display());
    }
    Ok(())
}

fn show_config(config: &OrchestratorConfig) -> Result<()> {
    ConfigDiscovery::show_discovery_info();
    println!();
    println!("{}", config.to_toml_string()?);
    Ok(())
}

fn init_config(dir: Option<PathBuf>) -> Result<()> {
    let path = match dir {
        Some(dir) => ConfigDiscovery::create_default_config(&dir)?,
        None => ConfigDiscovery::create_default_user_config()?,
    };
    println!("Configuration file: {}", path.display());
    Ok(())
}
