//! Change-log bookkeeping shared by the store implementations.
//!
//! Every write appends one entry. Queries fold the entries after a watermark
//! into added/modified/removed id lists, skipping engine writes.

use contactmirror_types::{
    ContactRecord, Detail, DetailKind, DetailKindSet, DetailValue, HybridTimestamp, RecordId,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeOp {
    Added,
    Modified,
    Removed,
}

impl ChangeOp {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ChangeOp::Added => "added",
            ChangeOp::Modified => "modified",
            ChangeOp::Removed => "removed",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeOp::Added),
            "modified" => Some(ChangeOp::Modified),
            "removed" => Some(ChangeOp::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ChangeEntry {
    pub record_id: RecordId,
    pub at: HybridTimestamp,
    pub op: ChangeOp,
    /// Kinds touched by a modification. Empty for adds and removals.
    pub kinds: DetailKindSet,
    pub by_engine: bool,
    /// Ownership label of the record at the time of the change.
    pub ownership: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    pub added: Vec<RecordId>,
    pub modified: Vec<RecordId>,
    pub removed: Vec<RecordId>,
    /// Kinds touched by client modifications, for each modified id.
    pub touched: BTreeMap<RecordId, DetailKindSet>,
}

/// Folds change entries (already limited to the query window and sorted by
/// time) into pending client changes.
///
/// A client removal followed by a re-add under the same id reports the id as
/// both removed and added.
pub(crate) fn pending_changes<'a>(
    entries: impl IntoIterator<Item = &'a ChangeEntry>,
    removed_ownership: Option<&str>,
    ignored: DetailKindSet,
    is_live: impl Fn(&RecordId) -> bool,
) -> PendingChanges {
    let mut by_record: BTreeMap<&RecordId, Vec<&ChangeEntry>> = BTreeMap::new();
    for entry in entries {
        by_record.entry(&entry.record_id).or_default().push(entry);
    }

    let mut pending = PendingChanges::default();
    for (id, entries) in by_record {
        let client_removal = entries.iter().any(|e| {
            e.op == ChangeOp::Removed
                && !e.by_engine
                && removed_ownership.is_none_or(|label| e.ownership.as_deref() == Some(label))
        });
        if client_removal {
            pending.removed.push(id.clone());
        }

        if !is_live(id) {
            continue;
        }

        let tail_start = entries
            .iter()
            .rposition(|e| e.op == ChangeOp::Removed)
            .map_or(0, |pos| pos + 1);
        let tail = &entries[tail_start..];

        if tail
            .iter()
            .any(|e| e.op == ChangeOp::Added && !e.by_engine)
        {
            pending.added.push(id.clone());
            continue;
        }

        let touched: DetailKindSet = tail
            .iter()
            .filter(|e| e.op == ChangeOp::Modified && !e.by_engine)
            .fold(DetailKindSet::EMPTY, |acc, e| acc.union(e.kinds));
        let touched = touched.difference(ignored);
        if !touched.is_empty() {
            pending.modified.push(id.clone());
            pending.touched.insert(id.clone(), touched);
        }
    }
    pending
}

fn kind_differs(old: &ContactRecord, new: &ContactRecord, kind: DetailKind) -> bool {
    let ours: Vec<&Detail> = old.details_of(kind).collect();
    let mut theirs: Vec<&Detail> = new.details_of(kind).collect();
    if ours.len() != theirs.len() {
        return true;
    }
    for detail in ours {
        match theirs.iter().position(|t| *t == detail) {
            Some(pos) => {
                theirs.swap_remove(pos);
            }
            None => return true,
        }
    }
    false
}

/// Kinds whose details (payload or bookkeeping) differ between two versions.
pub(crate) fn changed_kinds(old: &ContactRecord, new: &ContactRecord) -> DetailKindSet {
    old.kinds()
        .union(new.kinds())
        .iter()
        .filter(|kind| *kind != DetailKind::Timestamp && kind_differs(old, new, *kind))
        .collect()
}

/// Stamps the store-managed timestamp detail.
pub(crate) fn stamp(record: &mut ContactRecord, created: HybridTimestamp, modified: HybridTimestamp) {
    record.set_detail(DetailValue::Timestamp {
        created: Some(created),
        modified,
    });
}

/// Created timestamp of a stored record, falling back to `fallback`.
pub(crate) fn created_at(record: &ContactRecord, fallback: HybridTimestamp) -> HybridTimestamp {
    record
        .details
        .iter()
        .find_map(|d| match &d.value {
            DetailValue::Timestamp {
                created: Some(created),
                ..
            } => Some(*created),
            _ => None,
        })
        .unwrap_or(fallback)
}

/// Carries store-managed details over from the stored version and stamps
/// the incoming one. Returns the kinds the update touched.
pub(crate) fn prepare_update(
    existing: &ContactRecord,
    incoming: &mut ContactRecord,
    now: HybridTimestamp,
) -> DetailKindSet {
    if incoming.guid().is_none() {
        if let Some(guid) = existing.guid() {
            incoming.set_detail(DetailValue::Guid {
                guid: guid.to_string(),
            });
        }
    }
    if incoming.origin.is_none() {
        incoming.origin.clone_from(&existing.origin);
    }
    let kinds = changed_kinds(existing, incoming);
    stamp(incoming, created_at(existing, now), now);
    incoming.id = existing.id.clone();
    kinds
}

/// Assigns the id and the creation stamp. With `guid_prefix`, records
/// without a guid get `"<prefix>-<id>"`.
pub(crate) fn prepare_insert(
    record: &mut ContactRecord,
    id: RecordId,
    guid_prefix: Option<&str>,
    now: HybridTimestamp,
) {
    if let Some(prefix) = guid_prefix {
        if record.guid().is_none() {
            record.set_detail(DetailValue::Guid {
                guid: format!("{prefix}-{id}"),
            });
        }
    }
    stamp(record, now, now);
    record.id = Some(id);
}

/// Returns the first detail uri of `record` already used by another record.
pub(crate) fn uri_collision<'a>(
    record: &ContactRecord,
    others: impl IntoIterator<Item = &'a ContactRecord>,
) -> Option<String> {
    let uris: Vec<&str> = record
        .details
        .iter()
        .filter_map(|d| d.meta.uri.as_deref())
        .collect();
    if uris.is_empty() {
        return None;
    }
    others
        .into_iter()
        .filter(|other| other.id != record.id)
        .flat_map(|other| other.details.iter().filter_map(|d| d.meta.uri.as_deref()))
        .find(|uri| uris.contains(uri))
        .map(str::to_string)
}
