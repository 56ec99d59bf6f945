//! Configuration loading and discovery
//!
//! Discovery order:
//! 1. Current directory: ./chunkgen.toml or ./.chunkgen/config.toml
//! 2. User config: ~/.chunkgen/config.toml
//! 3. Built-in defaults

use crate::cache::CacheConfig;
use crate::env;
use crate::repository::{RepositoryConfig, SnapshotConfig};
use crate::session::{RecoveryConfig, SessionConfiguration, SessionManagerConfig};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: env::DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Defaults every new session starts from before its overrides
    pub session: SessionConfiguration,
    pub manager: SessionManagerConfig,
    pub repository: RepositoryConfig,
    pub snapshot: SnapshotConfig,
    pub recovery: RecoveryConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: OrchestratorConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Reject session defaults no session could be created with
    pub fn validate(&self) -> Result<()> {
        let errors = self.session.validate();
        if !errors.is_empty() {
            let details = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            bail!("invalid session configuration: {}", details);
        }
        if self.manager.max_transaction_retries == 0 {
            bail!("manager.max_transaction_retries must be at least 1");
        }
        if self.cache.max_size == 0 {
            bail!("cache.max_size must be at least 1");
        }
        if self.cache.ttl_ms == 0 {
            bail!("cache.ttl_ms must be positive");
        }
        Ok(())
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<OrchestratorConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return OrchestratorConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(OrchestratorConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        let current_dir = std_env::current_dir().ok();
        let home_dir = Self::get_home_dir();
        Self::find_in(current_dir.as_deref(), home_dir.as_deref())
    }

    /// First existing candidate under the given directories
    pub fn find_in(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Option<PathBuf> {
        for candidate in Self::config_candidates(current_dir, home_dir) {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    pub fn config_candidates(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(current_dir) = current_dir {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(current_dir));
        }

        if let Some(home_dir) = home_dir {
            candidates.push(env::user_config_file_path(home_dir));
        }

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Write a default config file under `root`'s application directory
    pub fn create_default_config(root: &Path) -> Result<PathBuf> {
        let config_dir = env::chunkgen_dir_path(root);
        let config_path = env::local_config_file_path(root);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).with_context(|| {
                format!("Failed to create config directory {}", config_dir.display())
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if config_path.exists() {
            warn!("Configuration file already exists: {:?}", config_path);
        } else {
            OrchestratorConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> Result<PathBuf> {
        let Some(home_dir) = Self::get_home_dir() else {
            bail!("Could not determine home directory");
        };
        Self::create_default_config(&home_dir)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        let current_dir = std_env::current_dir().ok();
        let home_dir = Self::get_home_dir();
        let candidates = Self::config_candidates(current_dir.as_deref(), home_dir.as_deref());
        for (i, candidate) in candidates.iter().enumerate() {
            let status = if candidate.is_file() {
                "EXISTS"
            } else if candidate.exists() {
                "NOT A FILE"
            } else {
                "NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
