//! Cycle state and persisted watermarks.
//!
//! Watermarks are per account and per direction: `pull` is a mirror store
//! clock value, `push` a primary store clock value. They are the only state
//! that must survive restarts, and they advance only when a whole cycle
//! finalizes.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use contactmirror_blobstore::BlobBackend;
use contactmirror_types::{AccountId, HybridTimestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Blob key of the watermark record.
pub const WATERMARK_KEY: &str = "watermarks";

const WATERMARK_VERSION: u32 = 1;

/// Phase of the sync cycle currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Preparing,
    PullingMirror,
    PushingPrimary,
    Finalizing,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::Idle => "idle",
            CycleState::Preparing => "preparing",
            CycleState::PullingMirror => "pulling_mirror",
            CycleState::PushingPrimary => "pushing_primary",
            CycleState::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

/// Counts produced by one directional phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    /// Records saved through the presence fast path.
    pub presence_updates: usize,
    /// Per-record failures that were logged instead of aborting.
    pub tolerated_failures: usize,
}

impl PhaseStats {
    /// Sums two phases.
    #[must_use]
    pub fn combine(self, other: PhaseStats) -> PhaseStats {
        PhaseStats {
            added: self.added + other.added,
            modified: self.modified + other.modified,
            removed: self.removed + other.removed,
            presence_updates: self.presence_updates + other.presence_updates,
            tolerated_failures: self.tolerated_failures + other.tolerated_failures,
        }
    }
}

/// Summary of the last finalized cycle, stored next to the watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pull: PhaseStats,
    pub push: PhaseStats,
}

/// Persisted watermark record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkBlob {
    pub version: u32,
    /// Mirror clock up to which mirror changes were applied.
    pub pull: Option<HybridTimestamp>,
    /// Primary clock up to which primary changes were applied.
    pub push: Option<HybridTimestamp>,
    #[serde(default)]
    pub last_cycle: Option<CycleStats>,
}

impl Default for WatermarkBlob {
    fn default() -> Self {
        Self {
            version: WATERMARK_VERSION,
            pull: None,
            push: None,
            last_cycle: None,
        }
    }
}

impl WatermarkBlob {
    /// Loads the watermarks for `account`; a missing blob means first run.
    pub fn load(backend: &dyn BlobBackend, account: AccountId) -> SyncResult<Self> {
        let Some(bytes) = backend.load_blob(&account.scope(), WATERMARK_KEY)? else {
            return Ok(Self::default());
        };
        let blob: WatermarkBlob = serde_json::from_slice(&bytes)?;
        if blob.version > WATERMARK_VERSION {
            return Err(SyncError::IncompatibleState {
                key: WATERMARK_KEY.into(),
                version: blob.version,
            });
        }
        Ok(blob)
    }

    /// Serializes into a `(key, bytes)` blob entry.
    pub fn encode(&self) -> SyncResult<(&'static str, Vec<u8>)> {
        Ok((WATERMARK_KEY, serde_json::to_vec(self)?))
    }
}
