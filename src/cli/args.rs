//! Command line argument parsing
//!
//! Subcommands:
//! - `simulate`: create, start and drive a session against the simulated generator
//! - `show-config`: show configuration discovery information
//! - `init-config`: write a default configuration file

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "chunkgen")]
#[command(author = "Chunkgen Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session orchestrator for procedural chunk generation")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate a square region of chunks with the simulated generator
    Simulate(SimulateArgs),
    /// Show configuration discovery information
    ShowConfig,
    /// Write a default configuration file
    InitConfig {
        /// Directory to create `.chunkgen/config.toml` in (defaults to home)
        #[arg(short = 'd', long = "dir")]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, ClapArgs)]
pub struct SimulateArgs {
    /// World generator id
    #[arg(short = 'w', long = "world", default_value = "overworld")]
    pub world: String,

    /// Side length of the square region, in chunks
    #[arg(short = 'r', long = "region", default_value_t = 10)]
    pub region: u32,

    /// Request priority (1-10)
    #[arg(short = 'p', long = "priority", default_value_t = 5)]
    pub priority: u8,

    /// World seed
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,

    /// Probability that a single chunk generation fails
    #[arg(long = "failure-rate", default_value_t = 0.0)]
    pub failure_rate: f64,

    /// Simulated latency per chunk
    #[arg(long = "latency-ms", default_value_t = 0)]
    pub latency_ms: u64,

    /// Override the configured batch size
    #[arg(long = "batch-size")]
    pub batch_size: Option<u32>,

    /// Override the configured concurrency
    #[arg(long = "concurrency")]
    pub concurrency: Option<u32>,

    /// Save a repository snapshot under this directory when done
    #[arg(long = "snapshot-dir")]
    pub snapshot_dir: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long = "json")]
    pub json: bool,

    /// Print progress events as they arrive
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let args = Args::try_parse_from(["chunkgen", "simulate"]).unwrap();
        let Commands::Simulate(simulate) = args.command else {
            panic!("expected simulate");
        };
        assert_eq!(simulate.world, "overworld");
        assert_eq!(simulate.region, 10);
        assert_eq!(simulate.batch_size, None);
        assert!(!simulate.json);
    }

    #[test]
    fn test_simulate_overrides_and_global_config() {
        let args = Args::try_parse_from([
            "chunkgen",
            "simulate",
            "--region",
            "4",
            "--failure-rate",
            "0.25",
            "--batch-size",
            "3",
            "-c",
            "custom.toml",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("custom.toml")));
        let Commands::Simulate(simulate) = args.command else {
            panic!("expected simulate");
        };
        assert_eq!(simulate.region, 4);
        assert_eq!(simulate.failure_rate, 0.25);
        assert_eq!(simulate.batch_size, Some(3));
    }

    #[test]
    fn test_other_subcommands() {
        let args = Args::try_parse_from(["chunkgen", "show-config"]).unwrap();
        assert!(matches!(args.command, Commands::ShowConfig));

        let args = Args::try_parse_from(["chunkgen", "init-config", "--dir", "/tmp/w"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::InitConfig { dir: Some(ref dir) } if dir == &PathBuf::from("/tmp/w")
        ));
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Args::try_parse_from(["chunkgen"]).is_err());
    }
}
