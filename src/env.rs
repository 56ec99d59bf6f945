//! Environment constants and path utilities for the chunk-generation orchestrator.
//!
//! This module centralizes hardcoded limits, directory names and file names used
//! throughout the crate, making them easier to maintain and modify.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const CHUNKGEN_DIR_NAME: &str = ".chunkgen";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "chunkgen.toml";

/// Default tracing filter when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "chunkgen=info";

/// Request and scheduling limits
pub mod limits {
    /// Maximum number of coordinates a single generation request may carry
    pub const MAX_COORDINATES_PER_REQUEST: usize = 10_000;

    /// Lowest accepted request priority
    pub const MIN_PRIORITY: u8 = 1;

    /// Highest accepted request priority
    pub const MAX_PRIORITY: u8 = 10;

    /// Floor applied to the chunk rate when estimating remaining time
    pub const MIN_CHUNKS_PER_SECOND: f64 = 0.001;
}

/// Repository and snapshot file names
pub mod snapshot {
    /// Snapshot directory name within the application directory
    pub const SNAPSHOTS_DIR_NAME: &str = "snapshots";

    /// Default snapshot file name
    pub const SNAPSHOT_FILE_NAME: &str = "repository.json";

    /// Extension appended to compressed snapshot files
    pub const COMPRESSED_EXTENSION: &str = "gz";

    /// Extension of the checksum side file
    pub const CHECKSUM_EXTENSION: &str = "checksum";

    /// Prefix for checkpoint identifiers
    pub const CHECKPOINT_ID_PREFIX: &str = "checkpoint_";
}

/// Build the application directory path from a root directory
pub fn chunkgen_dir_path(root: &Path) -> PathBuf {
    root.join(CHUNKGEN_DIR_NAME)
}

/// Build the snapshots directory path
pub fn snapshots_dir_path(root: &Path) -> PathBuf {
    chunkgen_dir_path(root).join(snapshot::SNAPSHOTS_DIR_NAME)
}

/// Build the default snapshot file path
pub fn snapshot_file_path(root: &Path) -> PathBuf {
    snapshots_dir_path(root).join(snapshot::SNAPSHOT_FILE_NAME)
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    chunkgen_dir_path(home_dir)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    chunkgen_dir_path(current_dir).join(CONFIG_FILE_NAME)
}
