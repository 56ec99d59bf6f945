//! Snapshot export/import of the memory repository.
//!
//! Snapshots are written to a temp file and renamed into place, with an
//! optional gzip layer and a checksum side file over the uncompressed JSON.

use crate::env;
use crate::repository::memory::MemoryStore;
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enable_compression: bool,
    pub checksum_validation: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            checksum_validation: true,
        }
    }
}

/// Result of a snapshot save
#[derive(Debug, Clone)]
pub struct SnapshotResult {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub duration_ms: u64,
    pub compression_ratio: Option<f64>,
    pub checksum: String,
    pub session_count: usize,
}

pub struct SnapshotStore {
    path: PathBuf,
    config: SnapshotConfig,
}

impl SnapshotStore {
    /// Store rooted at `path`; `.gz` is appended when compression is on
    pub fn new(path: impl Into<PathBuf>, config: SnapshotConfig) -> Self {
        let path = path.into();
        let path = if config.enable_compression {
            let mut name = path.clone().into_os_string();
            name.push(".");
            name.push(env::snapshot::COMPRESSED_EXTENSION);
            PathBuf::from(name)
        } else {
            path
        };
        Self { path, config }
    }

    /// Store at the default snapshot location under `root`
    pub fn in_directory(root: &Path, config: SnapshotConfig) -> Self {
        Self::new(env::snapshot_file_path(root), config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn save(&self, store: &MemoryStore) -> Result<SnapshotResult> {
        let start_time = std::time::Instant::now();

        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
        }

        let serialized = serde_json::to_vec(store).context("Failed to serialize repository")?;
        let checksum = calculate_checksum(&serialized);

        let (final_data, compression_ratio) = if self.config.enable_compression {
            let compressed = compress_data(&serialized)?;
            let ratio = serialized.len() as f64 / compressed.len().max(1) as f64;
            (compressed, Some(ratio))
        } else {
            (serialized, None)
        };

        let temp_path = self.temp_path();
        async_fs::write(&temp_path, &final_data)
            .await
            .context("Failed to write snapshot temp file")?;

        if let Err(e) = async_fs::rename(&temp_path, &self.path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(e).context("Failed to move snapshot into place");
        }

        if self.config.checksum_validation {
            async_fs::write(self.checksum_path(), &checksum)
                .await
                .context("Failed to write checksum file")?;
        }

        let result = SnapshotResult {
            path: self.path.clone(),
            bytes_written: final_data.len() as u64,
            duration_ms: start_time.elapsed().as_millis() as u64,
            compression_ratio,
            checksum,
            session_count: store.sessions.len(),
        };
        info!(
            "Saved {} sessions to {}: {} bytes in {}ms",
            result.session_count,
            result.path.display(),
            result.bytes_written,
            result.duration_ms
        );
        Ok(result)
    }

    pub async fn load(&self) -> Result<MemoryStore> {
        if !self.path.exists() {
            return Err(anyhow::anyhow!(
                "Snapshot file not found: {}",
                self.path.display()
            ));
        }

        let content = async_fs::read(&self.path)
            .await
            .context("Failed to read snapshot file")?;

        let decompressed = if self.config.enable_compression {
            decompress_data(&content)?
        } else {
            content
        };

        if self.config.checksum_validation {
            self.validate_checksum(&decompressed).await?;
        }

        let store: MemoryStore =
            serde_json::from_slice(&decompressed).context("Failed to deserialize repository")?;
        debug!(
            "Loaded {} sessions from {}",
            store.sessions.len(),
            self.path.display()
        );
        Ok(store)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn checksum_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".");
        name.push(env::snapshot::CHECKSUM_EXTENSION);
        PathBuf::from(name)
    }

    async fn validate_checksum(&self, data: &[u8]) -> Result<()> {
        let checksum_path = self.checksum_path();
        if !checksum_path.exists() {
            warn!("No checksum file next to {}", self.path.display());
            return Ok(());
        }

        let stored = async_fs::read_to_string(&checksum_path)
            .await
            .context("Failed to read checksum file")?;
        if stored.trim() != calculate_checksum(data) {
            return Err(anyhow::anyhow!(
                "Checksum validation failed for {}",
                self.path.display()
            ));
        }
        Ok(())
    }
}

fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("Failed to compress snapshot")?;
    encoder.finish().context("Failed to finish snapshot compression")
}

fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .context("Failed to decompress snapshot")?;
    Ok(decompressed)
}

fn calculate_checksum(data: &[u8]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}
