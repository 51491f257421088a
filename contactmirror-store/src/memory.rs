//! In-memory contact store.
//!
//! Behaves like a small SQLite-backed contact database: numeric ids are
//! allocated as one past the highest live id (so a freed id can come back),
//! every write is stamped from a monotonic clock and appended to a change
//! log, and detail uris can be required to be unique across records.
//!
//! Failure injection hooks make it the workhorse of the engine tests.

use crate::changelog::{
    ChangeEntry, ChangeOp, pending_changes, prepare_insert, prepare_update, uri_collision,
};
use crate::{ChangeSet, ContactStore, RemoveOutcome, SaveOutcome, StoreError, StoreResult};
use contactmirror_types::{ContactRecord, DetailKindSet, HybridTimestamp, RecordId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

type SaveFailure = Box<dyn Fn(&ContactRecord) -> bool + Send + Sync>;

const SELF_ID: u64 = 1;

struct Inner {
    clock: HybridTimestamp,
    records: BTreeMap<u64, ContactRecord>,
    log: Vec<ChangeEntry>,
    save_failure: Option<SaveFailure>,
    failing_removals: HashSet<RecordId>,
}

impl Inner {
    fn tick(&mut self) -> HybridTimestamp {
        self.clock = self.clock.tick();
        self.clock
    }

    fn next_id(&self) -> u64 {
        self.records.keys().next_back().map_or(SELF_ID, |max| max + 1)
    }

    fn record(&self, id: &RecordId) -> Option<&ContactRecord> {
        numeric(id).and_then(|n| self.records.get(&n))
    }

    fn log(
        &mut self,
        record_id: RecordId,
        op: ChangeOp,
        kinds: DetailKindSet,
        by_engine: bool,
        ownership: Option<String>,
    ) {
        let at = self.clock;
        self.log.push(ChangeEntry {
            record_id,
            at,
            op,
            kinds,
            by_engine,
            ownership,
        });
    }

    fn insert(
        &mut self,
        mut record: ContactRecord,
        guid_prefix: Option<&str>,
        unique_uris: bool,
        by_engine: bool,
    ) -> Result<ContactRecord, String> {
        let id = self.next_id();
        let now = self.clock.tick();
        prepare_insert(&mut record, RecordId::from(id), guid_prefix, now);
        if unique_uris {
            if let Some(uri) = uri_collision(&record, self.records.values()) {
                return Err(format!("detail uri {uri} already in use"));
            }
        }
        self.clock = now;
        let ownership = record.ownership_label().map(str::to_string);
        self.records.insert(id, record.clone());
        self.log(RecordId::from(id), ChangeOp::Added, DetailKindSet::EMPTY, by_engine, ownership);
        Ok(record)
    }

    fn update(
        &mut self,
        mut record: ContactRecord,
        unique_uris: bool,
        by_engine: bool,
    ) -> Result<ContactRecord, String> {
        let Some(n) = record.id.as_ref().and_then(numeric) else {
            return Err("record has no numeric id".into());
        };
        let Some(existing) = self.records.get(&n) else {
            return Err("record does not exist".into());
        };
        let now = self.clock.tick();
        let kinds = prepare_update(existing, &mut record, now);
        if unique_uris {
            if let Some(uri) = uri_collision(&record, self.records.values()) {
                return Err(format!("detail uri {uri} already in use"));
            }
        }
        self.clock = now;
        let ownership = record.ownership_label().map(str::to_string);
        self.records.insert(n, record.clone());
        self.log(RecordId::from(n), ChangeOp::Modified, kinds, by_engine, ownership);
        Ok(record)
    }

    fn remove(&mut self, n: u64, by_engine: bool) -> Option<ContactRecord> {
        let removed = self.records.remove(&n)?;
        self.tick();
        let ownership = removed.ownership_label().map(str::to_string);
        self.log(RecordId::from(n), ChangeOp::Removed, DetailKindSet::EMPTY, by_engine, ownership);
        Some(removed)
    }

    fn window(&self, since: Option<HybridTimestamp>) -> impl Iterator<Item = &ChangeEntry> {
        self.log
            .iter()
            .filter(move |e| e.at.is_after_watermark(since.as_ref()))
    }

    fn collect(
        &self,
        ids: &[RecordId],
        keep: impl Fn(&ContactRecord) -> bool,
    ) -> Vec<ContactRecord> {
        ids.iter()
            .filter_map(|id| self.record(id))
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }
}

fn numeric(id: &RecordId) -> Option<u64> {
    id.as_str().parse().ok()
}

/// In-memory [`ContactStore`].
pub struct MemoryContactStore {
    name: String,
    unique_uris: bool,
    guids: bool,
    unavailable: AtomicBool,
    inner: Mutex<Inner>,
}

impl MemoryContactStore {
    /// Creates an empty store holding only the self record.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let mut records = BTreeMap::new();
        let now = HybridTimestamp::now();
        let mut me = ContactRecord::new();
        let name = name.into();
        prepare_insert(&mut me, RecordId::from(SELF_ID), None, now);
        records.insert(SELF_ID, me);
        Self {
            name,
            unique_uris: false,
            guids: false,
            unavailable: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                clock: now,
                records,
                log: Vec::new(),
                save_failure: None,
                failing_removals: HashSet::new(),
            }),
        }
    }

    /// Rejects saves whose detail uris are already used by another record.
    #[must_use]
    pub fn with_unique_detail_uris(mut self) -> Self {
        self.unique_uris = true;
        self
    }

    /// Gives new records a store-local guid (`"<name>-<id>"`).
    #[must_use]
    pub fn with_generated_guids(mut self) -> Self {
        self.guids = true;
        self
    }

    fn guid_prefix(&self) -> Option<&str> {
        self.guids.then_some(self.name.as_str())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable(format!("{} store lock poisoned", self.name)))
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} store is offline", self.name)));
        }
        Ok(())
    }

    fn available(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.check_online()?;
        self.lock()
    }

    // ── Client API ──────────────────────────────────────────────

    /// Inserts a new record on behalf of a store client.
    pub fn insert(&self, record: ContactRecord) -> StoreResult<RecordId> {
        if record.id.is_some() {
            return Err(StoreError::Constraint("new records must not carry an id".into()));
        }
        let mut inner = self.lock()?;
        let saved = inner
            .insert(record, self.guid_prefix(), self.unique_uris, false)
            .map_err(StoreError::Constraint)?;
        saved
            .id
            .ok_or_else(|| StoreError::Constraint("store did not assign an id".into()))
    }

    /// Replaces an existing record on behalf of a store client.
    pub fn update(&self, record: ContactRecord) -> StoreResult<()> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| StoreError::NotFound("<unsaved>".into()))?;
        let mut inner = self.lock()?;
        if inner.record(&id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner
            .update(record, self.unique_uris, false)
            .map_err(StoreError::Constraint)?;
        Ok(())
    }

    /// Removes a record on behalf of a store client.
    pub fn remove(&self, id: &RecordId) -> StoreResult<()> {
        let n = numeric(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if n == SELF_ID {
            return Err(StoreError::Constraint("the self record cannot be removed".into()));
        }
        let mut inner = self.lock()?;
        inner
            .remove(n, false)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Returns a live record.
    pub fn get(&self, id: &RecordId) -> StoreResult<Option<ContactRecord>> {
        Ok(self.lock()?.record(id).cloned())
    }

    /// All live records except the self record, in id order.
    pub fn records(&self) -> StoreResult<Vec<ContactRecord>> {
        Ok(self
            .lock()?
            .records
            .iter()
            .filter(|(n, _)| **n != SELF_ID)
            .map(|(_, r)| r.clone())
            .collect())
    }

    /// Number of live records, not counting the self record.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.records.len() - 1)
    }

    /// Returns true if the store holds nothing but the self record.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of change-log entries currently kept.
    pub fn change_log_len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.log.len())
    }

    /// Id of the self record.
    #[must_use]
    pub fn self_id(&self) -> RecordId {
        RecordId::from(SELF_ID)
    }

    // ── Failure injection ───────────────────────────────────────

    /// Makes every engine-facing call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails engine saves of records matching `predicate`.
    pub fn fail_saves_where(
        &self,
        predicate: impl Fn(&ContactRecord) -> bool + Send + Sync + 'static,
    ) -> StoreResult<()> {
        self.lock()?.save_failure = Some(Box::new(predicate));
        Ok(())
    }

    /// Fails engine removals of the given id.
    pub fn fail_removal_of(&self, id: impl Into<RecordId>) -> StoreResult<()> {
        self.lock()?.failing_removals.insert(id.into());
        Ok(())
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.save_failure = None;
        inner.failing_removals.clear();
        self.unavailable.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl ContactStore for MemoryContactStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_changes(
        &self,
        since: Option<HybridTimestamp>,
        ownership: &str,
    ) -> StoreResult<ChangeSet> {
        let inner = self.available()?;
        let pending = pending_changes(
            inner.window(since),
            Some(ownership),
            DetailKindSet::EMPTY,
            |id| inner.record(id).is_some(),
        );
        let self_id = RecordId::from(SELF_ID);
        let owned = |r: &ContactRecord| {
            r.id.as_ref() == Some(&self_id) || r.ownership_label() == Some(ownership)
        };
        let changes = ChangeSet {
            added: inner.collect(&pending.added, owned),
            modified: inner.collect(&pending.modified, owned),
            removed: pending.removed,
            touched: pending.touched,
        };
        debug!(store = %self.name, changes = changes.len(), "queried changes");
        Ok(changes)
    }

    fn query_local_changes(
        &self,
        since: Option<HybridTimestamp>,
        ignored: DetailKindSet,
    ) -> StoreResult<(HybridTimestamp, ChangeSet)> {
        let inner = self.available()?;
        let pending = pending_changes(inner.window(since), None, ignored, |id| {
            inner.record(id).is_some()
        });
        let changes = ChangeSet {
            added: inner.collect(&pending.added, |_| true),
            modified: inner.collect(&pending.modified, |_| true),
            removed: pending.removed,
            touched: pending.touched,
        };
        debug!(store = %self.name, changes = changes.len(), "queried local changes");
        Ok((inner.clock, changes))
    }

    fn save_records(&self, records: &mut [ContactRecord]) -> StoreResult<Vec<SaveOutcome>> {
        let mut inner = self.available()?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            if inner.save_failure.as_ref().is_some_and(|fail| fail(&*record)) {
                outcomes.push(SaveOutcome::Failed("injected save failure".into()));
                continue;
            }
            let result = match &record.id {
                Some(id) if inner.record(id).is_none() => {
                    outcomes.push(SaveOutcome::DoesNotExist);
                    continue;
                }
                Some(_) => inner.update(record.clone(), self.unique_uris, true),
                None => inner.insert(record.clone(), self.guid_prefix(), self.unique_uris, true),
            };
            match result {
                Ok(saved) => {
                    record.id.clone_from(&saved.id);
                    outcomes.push(saved.id.map_or_else(
                        || SaveOutcome::Failed("store did not assign an id".into()),
                        SaveOutcome::Saved,
                    ));
                }
                Err(reason) => outcomes.push(SaveOutcome::Failed(reason)),
            }
        }
        Ok(outcomes)
    }

    fn remove_records(&self, ids: &[RecordId]) -> StoreResult<Vec<RemoveOutcome>> {
        let mut inner = self.available()?;
        let outcomes = ids
            .iter()
            .map(|id| {
                if inner.failing_removals.contains(id) {
                    return RemoveOutcome::Failed("injected removal failure".into());
                }
                match numeric(id) {
                    Some(SELF_ID) => RemoveOutcome::Failed("the self record cannot be removed".into()),
                    Some(n) => match inner.remove(n, true) {
                        Some(_) => RemoveOutcome::Removed,
                        None => RemoveOutcome::DoesNotExist,
                    },
                    None => RemoveOutcome::DoesNotExist,
                }
            })
            .collect();
        Ok(outcomes)
    }

    fn fetch_by_ids(&self, ids: &[RecordId]) -> StoreResult<Vec<ContactRecord>> {
        let inner = self.available()?;
        Ok(inner.collect(ids, |_| true))
    }

    fn find_by_origin(&self, origins: &[RecordId]) -> StoreResult<HashMap<RecordId, RecordId>> {
        let inner = self.available()?;
        let wanted: HashSet<&RecordId> = origins.iter().collect();
        Ok(inner
            .records
            .values()
            .filter_map(|r| match (&r.origin, &r.id) {
                (Some(origin), Some(id)) if wanted.contains(origin) => {
                    Some((origin.clone(), id.clone()))
                }
                _ => None,
            })
            .collect())
    }

    fn self_record_id(&self) -> StoreResult<RecordId> {
        self.check_online()?;
        Ok(self.self_id())
    }

    fn current_timestamp(&self) -> StoreResult<HybridTimestamp> {
        Ok(self.available()?.clock)
    }

    fn prune_changes(&self, up_to: HybridTimestamp) -> StoreResult<usize> {
        let mut inner = self.available()?;
        let before = inner.log.len();
        inner.log.retain(|e| e.at.is_after_watermark(Some(&up_to)));
        let pruned = before - inner.log.len();
        debug!(store = %self.name, pruned, "pruned change log");
        Ok(pruned)
    }
}
