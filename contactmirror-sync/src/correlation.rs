//! Correlation table between primary and mirror record ids, plus the avatar
//! remap table.
//!
//! Both are loaded fresh at the start of a cycle and written back together
//! with the watermarks in one atomic blob batch.

use crate::error::{SyncError, SyncResult};
use contactmirror_blobstore::BlobBackend;
use contactmirror_types::{AccountId, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Blob key of the correlation table.
pub const CORRELATION_KEY: &str = "correlation";
/// Blob key of the avatar remap table.
pub const AVATAR_REMAP_KEY: &str = "avatar-remap";

const CORRELATION_VERSION: u32 = 1;
const AVATAR_REMAP_VERSION: u32 = 1;

/// Persisted shape of the correlation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationBlob {
    pub version: u32,
    /// `(primary, mirror)` pairs.
    pub pairs: Vec<(RecordId, RecordId)>,
}

/// Persisted shape of the avatar remap table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarRemapBlob {
    pub version: u32,
    /// Primary id → rewritten url → original url.
    pub entries: BTreeMap<RecordId, BTreeMap<String, String>>,
}

/// Bidirectional map between primary and mirror ids.
///
/// Inserting a pair evicts any pair that shares either id, so the mapping
/// stays a bijection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationTable {
    by_primary: BTreeMap<RecordId, RecordId>,
    by_mirror: BTreeMap<RecordId, RecordId>,
    avatars: BTreeMap<RecordId, BTreeMap<String, String>>,
    /// Mirror ids whose primary id was handed to another record this cycle.
    /// Not persisted.
    displaced: Vec<RecordId>,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the table for `account`; a missing blob yields an empty table.
    pub fn load(backend: &dyn BlobBackend, account: AccountId) -> SyncResult<Self> {
        let scope = account.scope();
        let mut table = Self::new();

        if let Some(bytes) = backend.load_blob(&scope, CORRELATION_KEY)? {
            let blob: CorrelationBlob = serde_json::from_slice(&bytes)?;
            if blob.version > CORRELATION_VERSION {
                return Err(SyncError::IncompatibleState {
                    key: CORRELATION_KEY.into(),
                    version: blob.version,
                });
            }
            for (primary, mirror) in blob.pairs {
                table.insert(primary, mirror);
            }
        }

        if let Some(bytes) = backend.load_blob(&scope, AVATAR_REMAP_KEY)? {
            let blob: AvatarRemapBlob = serde_json::from_slice(&bytes)?;
            if blob.version > AVATAR_REMAP_VERSION {
                return Err(SyncError::IncompatibleState {
                    key: AVATAR_REMAP_KEY.into(),
                    version: blob.version,
                });
            }
            table.avatars = blob.entries;
        }

        Ok(table)
    }

    /// Serializes the table into `(key, bytes)` blob entries.
    ///
    /// Avatar remaps whose primary id is no longer correlated are dropped.
    pub fn encode(&self) -> SyncResult<Vec<(&'static str, Vec<u8>)>> {
        let pairs = CorrelationBlob {
            version: CORRELATION_VERSION,
            pairs: self.pairs().map(|(p, m)| (p.clone(), m.clone())).collect(),
        };
        let avatars = AvatarRemapBlob {
            version: AVATAR_REMAP_VERSION,
            entries: self
                .avatars
                .iter()
                .filter(|(primary, remaps)| {
                    self.by_primary.contains_key(*primary) && !remaps.is_empty()
                })
                .map(|(primary, remaps)| (primary.clone(), remaps.clone()))
                .collect(),
        };
        Ok(vec![
            (CORRELATION_KEY, serde_json::to_vec(&pairs)?),
            (AVATAR_REMAP_KEY, serde_json::to_vec(&avatars)?),
        ])
    }

    // ── Correlations ─────────────────────────────────────────────

    /// Correlates two ids, evicting any pair that used either of them.
    ///
    /// A primary id paired with a different mirror id before means the
    /// primary store reused a freed id; the old mirror id is remembered
    /// (see [`take_displaced`](Self::take_displaced)).
    pub fn insert(&mut self, primary: RecordId, mirror: RecordId) {
        if let Some(old_mirror) = self.by_primary.remove(&primary) {
            self.by_mirror.remove(&old_mirror);
            if old_mirror != mirror {
                self.avatars.remove(&primary);
                self.displaced.push(old_mirror);
            }
        }
        if let Some(old_primary) = self.by_mirror.remove(&mirror) {
            self.by_primary.remove(&old_primary);
            self.avatars.remove(&old_primary);
        }
        self.by_primary.insert(primary.clone(), mirror.clone());
        self.by_mirror.insert(mirror, primary);
    }

    /// Mirror id correlated with a primary id.
    #[must_use]
    pub fn mirror_of(&self, primary: &RecordId) -> Option<&RecordId> {
        self.by_primary.get(primary)
    }

    /// Primary id correlated with a mirror id.
    #[must_use]
    pub fn primary_of(&self, mirror: &RecordId) -> Option<&RecordId> {
        self.by_mirror.get(mirror)
    }

    /// Drops the pair for a primary id, with its avatar remaps.
    pub fn remove_by_primary(&mut self, primary: &RecordId) -> Option<RecordId> {
        let mirror = self.by_primary.remove(primary)?;
        self.by_mirror.remove(&mirror);
        self.avatars.remove(primary);
        Some(mirror)
    }

    /// Drops the pair for a mirror id, with its avatar remaps.
    pub fn remove_by_mirror(&mut self, mirror: &RecordId) -> Option<RecordId> {
        let primary = self.by_mirror.remove(mirror)?;
        self.by_primary.remove(&primary);
        self.avatars.remove(&primary);
        Some(primary)
    }

    /// Iterates `(primary, mirror)` pairs in primary id order.
    pub fn pairs(&self) -> impl Iterator<Item = (&RecordId, &RecordId)> {
        self.by_primary.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_primary.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_primary.is_empty()
    }

    /// Returns true if both directions describe the same pairs.
    #[must_use]
    pub fn is_bijective(&self) -> bool {
        self.by_primary.len() == self.by_mirror.len()
            && self
                .by_primary
                .iter()
                .all(|(p, m)| self.by_mirror.get(m) == Some(p))
    }

    /// Drains mirror ids displaced by primary id reuse that are still
    /// uncorrelated.
    pub fn take_displaced(&mut self) -> Vec<RecordId> {
        let displaced = std::mem::take(&mut self.displaced);
        displaced
            .into_iter()
            .filter(|m| !self.by_mirror.contains_key(m))
            .collect()
    }

    // ── Avatar remaps ────────────────────────────────────────────

    /// Records that `rewritten` replaced `original` for a primary record.
    pub fn record_avatar(&mut self, primary: RecordId, rewritten: String, original: String) {
        self.avatars
            .entry(primary)
            .or_default()
            .insert(rewritten, original);
    }

    /// Rewritten → original avatar urls for a primary record.
    #[must_use]
    pub fn avatar_remaps(&self, primary: &RecordId) -> Option<&BTreeMap<String, String>> {
        self.avatars.get(primary)
    }

    /// Forgets avatar remaps for a primary record.
    pub fn clear_avatars(&mut self, primary: &RecordId) {
        self.avatars.remove(primary);
    }
}
