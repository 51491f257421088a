//! Change detection on both stores.

use crate::classifier::IGNORABLE;
use crate::error::SyncResult;
use contactmirror_store::{ChangeSet, ContactStore};
use contactmirror_types::{ContactRecord, DetailKindSet, HybridTimestamp, RecordId};
use std::collections::BTreeMap;
use tracing::debug;

/// Changes found on one store, with the self record split out.
#[derive(Debug, Clone, Default)]
pub struct DetectedChanges {
    /// Watermark to persist once these changes are applied.
    pub watermark: HybridTimestamp,
    /// The store's self record, if it changed.
    pub self_record: Option<ContactRecord>,
    /// Every other change.
    pub changes: ChangeSet,
}

impl DetectedChanges {
    fn split(watermark: HybridTimestamp, mut changes: ChangeSet, self_id: &RecordId) -> Self {
        let mut self_record = None;
        for list in [&mut changes.added, &mut changes.modified] {
            if let Some(pos) = list.iter().position(|r| r.id.as_ref() == Some(self_id)) {
                self_record = Some(list.remove(pos));
            }
        }
        changes.removed.retain(|id| id != self_id);
        Self {
            watermark,
            self_record,
            changes,
        }
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.self_record.is_none() && self.changes.is_empty()
    }
}

/// Mirror-side changes owned by the engine since `since`.
///
/// The watermark is read before the query, so a client write racing the
/// query is picked up again next cycle rather than lost.
pub fn mirror_changes(
    mirror: &dyn ContactStore,
    since: Option<HybridTimestamp>,
    ownership: &str,
) -> SyncResult<DetectedChanges> {
    let watermark = mirror.current_timestamp()?;
    let changes = mirror.query_changes(since, ownership)?;
    let self_id = mirror.self_record_id()?;
    debug!(
        added = changes.added.len(),
        modified = changes.modified.len(),
        removed = changes.removed.len(),
        "mirror changes"
    );
    Ok(DetectedChanges::split(watermark, changes, &self_id))
}

/// Primary-side changes since `since`, ignoring volatile kinds.
pub fn primary_changes(
    primary: &dyn ContactStore,
    since: Option<HybridTimestamp>,
) -> SyncResult<DetectedChanges> {
    let (watermark, changes) = primary.query_local_changes(since, IGNORABLE)?;
    let self_id = primary.self_record_id()?;
    debug!(
        added = changes.added.len(),
        modified = changes.modified.len(),
        removed = changes.removed.len(),
        "primary changes"
    );
    Ok(DetectedChanges::split(watermark, changes, &self_id))
}

/// Kinds primary clients changed since `since`, per record.
///
/// Read before the pull phase writes to the primary store: pull
/// modifications leave these kinds alone so the push phase carries them to
/// the mirror instead of losing them.
pub fn primary_touched(
    primary: &dyn ContactStore,
    since: Option<HybridTimestamp>,
) -> SyncResult<BTreeMap<RecordId, DetailKindSet>> {
    let (_, changes) = primary.query_local_changes(since, IGNORABLE)?;
    Ok(changes.touched)
}
