//! Presence-only change detection.
//!
//! Status flips arrive far more often than real edits. A modification whose
//! only differences lie in presence kinds skips the substantive merge path.

use contactmirror_types::{ContactRecord, DetailKind, DetailKindSet};

/// Derived or volatile kinds that never trigger a sync on their own.
pub const IGNORABLE: DetailKindSet = DetailKindSet::of(&[
    DetailKind::DisplayLabel,
    DetailKind::GlobalPresence,
    DetailKind::Deactivated,
    DetailKind::StatusFlags,
    DetailKind::SyncTarget,
    DetailKind::Timestamp,
]);

/// Ephemeral online-status kinds.
pub const PRESENCE: DetailKindSet = DetailKindSet::of(&[
    DetailKind::Presence,
    DetailKind::OnlineAccount,
    DetailKind::OriginMetadata,
]);

/// Kinds each store manages for itself; never compared across stores.
pub const STORE_LOCAL: DetailKindSet = DetailKindSet::of(&[DetailKind::Guid, DetailKind::Timestamp]);

/// Returns true if `old` and `new` differ only in presence or ignorable kinds.
///
/// Every other kind occurring in either record must have the same number
/// of details on both sides, each matched by an equal payload (detail uris,
/// links and provenance are not compared).
#[must_use]
pub fn is_presence_only(old: &ContactRecord, new: &ContactRecord) -> bool {
    old.content_matches(new, IGNORABLE.union(PRESENCE))
}

/// Returns true if `new` carries nothing worth writing over `old`.
#[must_use]
pub fn is_unchanged(old: &ContactRecord, new: &ContactRecord) -> bool {
    old.content_matches(new, IGNORABLE.union(STORE_LOCAL))
}
