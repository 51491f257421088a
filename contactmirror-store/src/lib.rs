//! Contact store interface for contactmirror.
//!
//! Both the primary and the mirror store expose the same [`ContactStore`]
//! shape to the sync engine. Every write made through the trait is an
//! engine write: stores remember who wrote each change and never report the
//! engine's own writes back from [`ContactStore::query_changes`] or
//! [`ContactStore::query_local_changes`]. Clients of a store write through
//! the store's own API instead.
//!
//! # Implementations
//!
//! - [`MemoryContactStore`]: in-memory, with failure injection for tests
//! - [`SqliteContactStore`]: SQLite-backed, used by the daemon

mod changelog;
mod error;
mod memory;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryContactStore;
pub use sqlite::SqliteContactStore;

use contactmirror_types::{ContactRecord, DetailKindSet, HybridTimestamp, RecordId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Records created, modified and removed within a query window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<ContactRecord>,
    pub modified: Vec<ContactRecord>,
    /// Ids of records removed in the window. Only ids survive a removal.
    pub removed: Vec<RecordId>,
    /// Kinds clients changed, for each record in `modified`.
    pub touched: BTreeMap<RecordId, DetailKindSet>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of changed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Per-record result of [`ContactStore::save_records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Saved; carries the (possibly newly assigned) id.
    Saved(RecordId),
    /// The record carried an id that does not exist in the store.
    DoesNotExist,
    /// Any other per-record failure.
    Failed(String),
}

impl SaveOutcome {
    /// Returns the saved id, if the save succeeded.
    #[must_use]
    pub fn saved_id(&self) -> Option<&RecordId> {
        match self {
            SaveOutcome::Saved(id) => Some(id),
            _ => None,
        }
    }
}

/// Per-id result of [`ContactStore::remove_records`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The id was not present; callers usually treat this as success.
    DoesNotExist,
    Failed(String),
}

/// Store operations consumed by the sync engine.
///
/// Calls are blocking; the engine issues one at a time.
pub trait ContactStore: Send + Sync {
    /// Short name used in logs ("primary", "mirror").
    fn name(&self) -> &str;

    /// Records created, modified or removed by clients after `since`, limited
    /// to records whose ownership label equals `ownership`.
    fn query_changes(
        &self,
        since: Option<HybridTimestamp>,
        ownership: &str,
    ) -> StoreResult<ChangeSet>;

    /// Records changed by clients after `since`, skipping modifications that
    /// only touched `ignored` kinds. Also returns the watermark to persist
    /// once these changes are applied.
    fn query_local_changes(
        &self,
        since: Option<HybridTimestamp>,
        ignored: DetailKindSet,
    ) -> StoreResult<(HybridTimestamp, ChangeSet)>;

    /// Saves records, assigning ids to new ones in place. Outcomes are
    /// returned in input order.
    fn save_records(&self, records: &mut [ContactRecord]) -> StoreResult<Vec<SaveOutcome>>;

    /// Removes records by id. Outcomes are returned in input order.
    fn remove_records(&self, ids: &[RecordId]) -> StoreResult<Vec<RemoveOutcome>>;

    /// Fetches live records; unknown ids are skipped.
    fn fetch_by_ids(&self, ids: &[RecordId]) -> StoreResult<Vec<ContactRecord>>;

    /// Maps each origin id to the live record the engine created from it.
    fn find_by_origin(&self, origins: &[RecordId]) -> StoreResult<HashMap<RecordId, RecordId>>;

    /// Id of the record representing the device owner.
    fn self_record_id(&self) -> StoreResult<RecordId>;

    /// The store's clock value after its latest write.
    fn current_timestamp(&self) -> StoreResult<HybridTimestamp>;

    /// Drops change-log entries stamped at or before `up_to`. Returns how
    /// many were dropped. Queries after `up_to` are unaffected.
    fn prune_changes(&self, up_to: HybridTimestamp) -> StoreResult<usize>;
}

impl<T: ContactStore + ?Sized> ContactStore for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn query_changes(
        &self,
        since: Option<HybridTimestamp>,
        ownership: &str,
    ) -> StoreResult<ChangeSet> {
        (**self).query_changes(since, ownership)
    }

    fn query_local_changes(
        &self,
        since: Option<HybridTimestamp>,
        ignored: DetailKindSet,
    ) -> StoreResult<(HybridTimestamp, ChangeSet)> {
        (**self).query_local_changes(since, ignored)
    }

    fn save_records(&self, records: &mut [ContactRecord]) -> StoreResult<Vec<SaveOutcome>> {
        (**self).save_records(records)
    }

    fn remove_records(&self, ids: &[RecordId]) -> StoreResult<Vec<RemoveOutcome>> {
        (**self).remove_records(ids)
    }

    fn fetch_by_ids(&self, ids: &[RecordId]) -> StoreResult<Vec<ContactRecord>> {
        (**self).fetch_by_ids(ids)
    }

    fn find_by_origin(&self, origins: &[RecordId]) -> StoreResult<HashMap<RecordId, RecordId>> {
        (**self).find_by_origin(origins)
    }

    fn self_record_id(&self) -> StoreResult<RecordId> {
        (**self).self_record_id()
    }

    fn current_timestamp(&self) -> StoreResult<HybridTimestamp> {
        (**self).current_timestamp()
    }

    fn prune_changes(&self, up_to: HybridTimestamp) -> StoreResult<usize> {
        (**self).prune_changes(up_to)
    }
}
