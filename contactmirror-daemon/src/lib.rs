//! Store wiring and configuration for the contactmirror daemon.

use anyhow::{Context, Result};
use contactmirror_blobstore::BlobStore;
use contactmirror_store::SqliteContactStore;
use contactmirror_sync::{SyncConfig, SyncEngine, SyncReport};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Database files the daemon works on.
#[derive(Debug, Clone)]
pub struct StorePaths {
    /// Primary contact database (privileged side).
    pub primary: PathBuf,
    /// Mirror contact database (shared side).
    pub mirror: PathBuf,
    /// Blob database holding correlation and watermark state.
    pub state: PathBuf,
}

/// Loads the sync configuration. Without a file the defaults apply; keys
/// missing from the file keep their defaults.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: SyncConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    info!(path = %path.display(), "loaded sync config");
    Ok(config)
}

/// Opens both contact databases and the state database and builds the
/// engine over them.
pub fn open_engine(paths: &StorePaths, config: SyncConfig) -> Result<SyncEngine> {
    let primary = SqliteContactStore::open(&paths.primary, "primary")
        .with_context(|| format!("Failed to open primary store {}", paths.primary.display()))?
        .with_unique_detail_uris()
        .with_generated_guids();
    let mirror = SqliteContactStore::open(&paths.mirror, "mirror")
        .with_context(|| format!("Failed to open mirror store {}", paths.mirror.display()))?;
    let blobs = BlobStore::open(&paths.state)
        .with_context(|| format!("Failed to open state store {}", paths.state.display()))?;

    Ok(SyncEngine::new(
        Arc::new(primary),
        Arc::new(mirror),
        Arc::new(blobs),
        config,
    ))
}

/// One-line summary of a cycle for logs and `--once` output.
#[must_use]
pub fn summarize(report: &SyncReport) -> String {
    format!(
        "account {}: +{} ~{} -{} presence {} tolerated {} ({} ms)",
        report.account,
        report.added,
        report.modified,
        report.removed,
        report.presence_updates,
        report.tolerated_failures,
        report.duration.as_millis(),
    )
}
