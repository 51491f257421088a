//! Applies detected changes to the opposite store.
//!
//! Both directions follow the same order: resolve which source records are
//! already correlated, apply removals, then save modifications and additions
//! in one batch and correlate the newly assigned ids. The self record is
//! always handled on its own and its failures are only logged.
//!
//! Records the engine creates carry their source id as `origin`. When a
//! source record has no correlation, the target is asked for a record with
//! that origin first, so a cycle rerun after an abort adopts the copies it
//! already made instead of duplicating them.

use crate::classifier::{STORE_LOCAL, is_presence_only, is_unchanged};
use crate::correlation::CorrelationTable;
use crate::detector::DetectedChanges;
use crate::error::{SyncError, SyncResult};
use crate::state::PhaseStats;
use crate::transformer::{RecordTransformer, revert_avatar};
use contactmirror_store::{ChangeSet, ContactStore, RemoveOutcome, SaveOutcome};
use contactmirror_types::{ContactRecord, DetailKindSet, RecordId};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// The store a phase writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Primary,
    Mirror,
}

impl Target {
    fn correlated(self, table: &CorrelationTable, source: &RecordId) -> Option<RecordId> {
        match self {
            Target::Primary => table.primary_of(source).cloned(),
            Target::Mirror => table.mirror_of(source).cloned(),
        }
    }

    fn correlate(self, table: &mut CorrelationTable, source: RecordId, target: RecordId) {
        match self {
            Target::Primary => table.insert(target, source),
            Target::Mirror => table.insert(source, target),
        }
    }

    fn forget(self, table: &mut CorrelationTable, target: &RecordId) {
        match self {
            Target::Primary => table.remove_by_primary(target),
            Target::Mirror => table.remove_by_mirror(target),
        };
    }
}

fn write_failure(store: &dyn ContactStore, what: &str, outcome: &SaveOutcome) -> SyncError {
    let reason = match outcome {
        SaveOutcome::Failed(reason) => reason.clone(),
        SaveOutcome::DoesNotExist => "record does not exist".to_string(),
        SaveOutcome::Saved(_) => "saved".to_string(),
    };
    SyncError::PartialWriteFailure {
        store: store.name().to_string(),
        reason: format!("{what}: {reason}"),
    }
}

/// Overlays the kinds a mirror client changed onto the current primary
/// record. Kinds in `kept` were changed by a primary client since the last
/// push and keep their primary details. Without `changed` every kind of
/// either record counts as changed.
fn merge_kinds(
    current: &ContactRecord,
    incoming: &ContactRecord,
    changed: Option<DetailKindSet>,
    kept: DetailKindSet,
) -> ContactRecord {
    let changed = changed.unwrap_or_else(|| current.kinds().union(incoming.kinds()));
    let mut merged = current.clone();
    for kind in changed.difference(kept.union(STORE_LOCAL)).iter() {
        merged.remove_kind(kind);
        merged.details.extend(incoming.details_of(kind).cloned());
    }
    merged
}

fn has_detail_uris(record: &ContactRecord) -> bool {
    record
        .details
        .iter()
        .any(|d| d.meta.uri.is_some() || !d.meta.linked_uris.is_empty())
}

/// Pending writes for one direction.
#[derive(Default)]
struct Plan {
    modifications: Vec<ContactRecord>,
    /// Presence-only modifications (push only).
    presence: Vec<ContactRecord>,
    /// `(source record, shaped record)` pairs.
    additions: Vec<(ContactRecord, ContactRecord)>,
}

/// Writes one direction's changes into its target store.
pub struct MergeApplier<'a> {
    primary: &'a dyn ContactStore,
    mirror: &'a dyn ContactStore,
    transformer: &'a RecordTransformer,
    batch_size: usize,
}

impl<'a> MergeApplier<'a> {
    #[must_use]
    pub fn new(
        primary: &'a dyn ContactStore,
        mirror: &'a dyn ContactStore,
        transformer: &'a RecordTransformer,
        batch_size: usize,
    ) -> Self {
        Self {
            primary,
            mirror,
            transformer,
            batch_size: batch_size.max(1),
        }
    }

    fn store(&self, target: Target) -> &'a dyn ContactStore {
        match target {
            Target::Primary => self.primary,
            Target::Mirror => self.mirror,
        }
    }

    // ── Mirror → primary ─────────────────────────────────────────

    /// Applies mirror changes to the primary store.
    ///
    /// `kept` holds the kinds primary clients changed since the last push;
    /// a mirror modification of the same record only replaces the other
    /// kinds.
    pub fn apply_pull(
        &self,
        table: &mut CorrelationTable,
        detected: DetectedChanges,
        kept: &BTreeMap<RecordId, DetailKindSet>,
    ) -> SyncResult<PhaseStats> {
        let mut stats = PhaseStats::default();
        let DetectedChanges {
            self_record,
            changes,
            ..
        } = detected;
        let ChangeSet {
            added,
            modified,
            removed,
            touched,
        } = changes;

        let removed_set: HashSet<RecordId> = removed.iter().cloned().collect();
        let upserts: Vec<ContactRecord> = added.into_iter().chain(modified).collect();
        let resolved = self.resolve(Target::Primary, table, &upserts, &removed_set)?;

        let mut plan = Plan::default();
        for record in upserts {
            let Some(mirror_id) = record.id.clone() else {
                continue;
            };
            let Some(current) = resolved.get(&mirror_id) else {
                let mut shaped = self.transformer.to_primary(&record, None);
                shaped.origin = Some(mirror_id);
                plan.additions.push((record, shaped));
                continue;
            };
            let Some(primary_id) = current.id.as_ref() else {
                continue;
            };
            let mut incoming = record;
            if revert_avatar(&mut incoming, table.avatar_remaps(primary_id)) {
                debug!(record = %primary_id, "restored original avatar");
            }
            let mut shaped = self.transformer.to_primary(&incoming, Some(primary_id));
            if let Some(primary_kinds) = kept.get(primary_id) {
                debug!(record = %primary_id, "primary also changed, merging by kind");
                let changed = touched.get(&mirror_id).copied();
                shaped = merge_kinds(current, &shaped, changed, *primary_kinds);
            }
            if is_unchanged(current, &shaped) {
                debug!(record = %primary_id, "mirror change already present in primary");
                continue;
            }
            plan.modifications.push(shaped);
        }

        let targets: Vec<RecordId> = removed
            .iter()
            .filter_map(|m| table.primary_of(m).cloned())
            .collect();
        let pending = !plan.modifications.is_empty();
        for gone in self.remove(self.primary, &targets, pending, &mut stats)? {
            table.remove_by_primary(&gone);
        }

        let additions = self.save_upserts(Target::Primary, table, plan, &mut stats)?;
        self.qualify_uris(additions)?;

        if let Some(record) = self_record {
            let primary_self = self.primary.self_record_id()?;
            let mirror_self = record.id.clone();
            let mut incoming = record;
            revert_avatar(&mut incoming, table.avatar_remaps(&primary_self));
            let mut shaped = self.transformer.to_primary(&incoming, Some(&primary_self));
            if let Some(primary_kinds) = kept.get(&primary_self) {
                let current = self.primary.fetch_by_ids(std::slice::from_ref(&primary_self))?;
                if let Some(current) = current.first() {
                    let changed = mirror_self.and_then(|id| touched.get(&id).copied());
                    shaped = merge_kinds(current, &shaped, changed, *primary_kinds);
                }
            }
            self.save_self(self.primary, shaped, &mut stats)?;
        }

        Ok(stats)
    }

    /// Rewrites the detail uris of freshly added primary records with
    /// their assigned ids.
    fn qualify_uris(&self, added: Vec<(ContactRecord, RecordId)>) -> SyncResult<()> {
        let mut qualified: Vec<ContactRecord> = added
            .into_iter()
            .filter(|(source, _)| has_detail_uris(source))
            .map(|(source, primary_id)| {
                let mut shaped = self.transformer.to_primary(&source, Some(&primary_id));
                shaped.origin = source.id;
                shaped
            })
            .collect();
        if qualified.is_empty() {
            return Ok(());
        }
        let outcomes = self.save_batch(self.primary, &mut qualified)?;
        for (record, outcome) in qualified.iter().zip(&outcomes) {
            if outcome.saved_id().is_none() {
                return Err(write_failure(
                    self.primary,
                    &format!("qualifying detail uris of {}", record.display_name()),
                    outcome,
                ));
            }
        }
        Ok(())
    }

    // ── Primary → mirror ─────────────────────────────────────────

    /// Applies primary changes to the mirror store.
    pub fn apply_push(
        &self,
        table: &mut CorrelationTable,
        detected: DetectedChanges,
    ) -> SyncResult<PhaseStats> {
        let mut stats = PhaseStats::default();
        let DetectedChanges {
            self_record,
            changes,
            ..
        } = detected;
        let ChangeSet {
            added,
            modified,
            removed,
            ..
        } = changes;

        let removed_set: HashSet<RecordId> = removed.iter().cloned().collect();
        let upserts: Vec<ContactRecord> = added.into_iter().chain(modified).collect();
        let upserted: HashSet<RecordId> = upserts.iter().filter_map(|r| r.id.clone()).collect();
        let resolved = self.resolve(Target::Mirror, table, &upserts, &removed_set)?;

        let mut plan = Plan::default();
        for record in upserts {
            let Some(primary_id) = record.id.clone() else {
                continue;
            };
            let mut shaped = self.transformer.to_mirror(&record);
            self.export_avatar(table, &primary_id, &mut shaped, &mut stats);

            let Some(current) = resolved.get(&primary_id) else {
                shaped.origin = Some(primary_id);
                plan.additions.push((record, shaped));
                continue;
            };
            let old = self.transformer.to_mirror(current);
            shaped.id.clone_from(&current.id);
            if is_unchanged(&old, &shaped) {
                debug!(record = %primary_id, "primary change already present in mirror");
            } else if is_presence_only(&old, &shaped) {
                plan.presence.push(shaped);
            } else {
                plan.modifications.push(shaped);
            }
        }

        self.save_presence(std::mem::take(&mut plan.presence), &mut stats);

        let targets = self.push_removals(table, &removed, &upserted)?;
        let pending = !plan.modifications.is_empty();
        for gone in self.remove(self.mirror, &targets, pending, &mut stats)? {
            table.remove_by_mirror(&gone);
        }

        self.save_upserts(Target::Mirror, table, plan, &mut stats)?;

        if let Some(record) = self_record {
            let primary_self = self.primary.self_record_id()?;
            let mirror_self = self.mirror.self_record_id()?;
            let mut shaped = self.transformer.to_mirror(&record);
            self.export_avatar(table, &primary_self, &mut shaped, &mut stats);
            shaped.id = Some(mirror_self);
            self.save_self(self.mirror, shaped, &mut stats)?;
        }

        Ok(stats)
    }

    /// Mirror records to remove for the primary removals of this phase.
    ///
    /// A removed primary id that is live again without a client addition was
    /// reused by the pull phase; its current correlation is fresh and the
    /// mirror record it displaced is removed instead.
    fn push_removals(
        &self,
        table: &mut CorrelationTable,
        removed: &[RecordId],
        upserted: &HashSet<RecordId>,
    ) -> SyncResult<Vec<RecordId>> {
        let candidates: Vec<RecordId> = removed
            .iter()
            .filter(|p| !upserted.contains(*p))
            .cloned()
            .collect();
        let revived = self.fetch_map(self.primary, &candidates)?;
        let mut targets: Vec<RecordId> = removed
            .iter()
            .filter(|p| !revived.contains_key(*p))
            .filter_map(|p| table.mirror_of(p).cloned())
            .collect();
        for stale in table.take_displaced() {
            debug!(record = %stale, "removing mirror record displaced by id reuse");
            if !targets.contains(&stale) {
                targets.push(stale);
            }
        }
        Ok(targets)
    }

    fn export_avatar(
        &self,
        table: &mut CorrelationTable,
        primary_id: &RecordId,
        shaped: &mut ContactRecord,
        stats: &mut PhaseStats,
    ) {
        table.clear_avatars(primary_id);
        match self.transformer.rewrite_avatar(shaped) {
            Ok(Some(rewrite)) => {
                table.record_avatar(primary_id.clone(), rewrite.rewritten, rewrite.original);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(record = %primary_id, error = %e, "avatar link failed, exporting original url");
                stats.tolerated_failures += 1;
            }
        }
    }

    /// Saves presence-only updates. Failures are logged and tolerated.
    fn save_presence(&self, mut presence: Vec<ContactRecord>, stats: &mut PhaseStats) {
        if presence.is_empty() {
            return;
        }
        match self.save_batch(self.mirror, &mut presence) {
            Ok(outcomes) => {
                for (record, outcome) in presence.iter().zip(&outcomes) {
                    if outcome.saved_id().is_some() {
                        stats.presence_updates += 1;
                    } else {
                        warn!(record = %record.display_name(), ?outcome, "presence update failed");
                        stats.tolerated_failures += 1;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, count = presence.len(), "presence batch failed");
                stats.tolerated_failures += presence.len();
            }
        }
    }

    // ── Shared steps ─────────────────────────────────────────────

    /// Maps source ids to the live target records they correspond to.
    ///
    /// Correlations whose target is gone are dropped. Uncorrelated sources
    /// are matched against target records created from them in an earlier,
    /// aborted cycle. Sources that are also being removed are never matched:
    /// their id was reused for a new record.
    fn resolve(
        &self,
        target: Target,
        table: &mut CorrelationTable,
        upserts: &[ContactRecord],
        removed: &HashSet<RecordId>,
    ) -> SyncResult<HashMap<RecordId, ContactRecord>> {
        let store = self.store(target);
        let sources: Vec<&RecordId> = upserts
            .iter()
            .filter_map(|r| r.id.as_ref())
            .filter(|id| !removed.contains(*id))
            .collect();

        let correlated: Vec<(RecordId, RecordId)> = sources
            .iter()
            .filter_map(|s| target.correlated(table, s).map(|t| ((*s).clone(), t)))
            .collect();
        let mut resolved = HashMap::new();
        if !correlated.is_empty() {
            let ids: Vec<RecordId> = correlated.iter().map(|(_, t)| t.clone()).collect();
            let mut live = self.fetch_map(store, &ids)?;
            for (source, t) in correlated {
                match live.remove(&t) {
                    Some(current) => {
                        resolved.insert(source, current);
                    }
                    None => {
                        warn!(
                            store = store.name(),
                            source = %source,
                            target = %t,
                            "dangling correlation, treating as addition"
                        );
                        target.forget(table, &t);
                    }
                }
            }
        }

        let orphans: Vec<RecordId> = sources
            .into_iter()
            .filter(|s| !resolved.contains_key(*s))
            .cloned()
            .collect();
        if orphans.is_empty() {
            return Ok(resolved);
        }
        let adopted = store.find_by_origin(&orphans)?;
        if adopted.is_empty() {
            return Ok(resolved);
        }
        let ids: Vec<RecordId> = adopted.values().cloned().collect();
        let mut live = self.fetch_map(store, &ids)?;
        for (source, t) in adopted {
            if let Some(current) = live.remove(&t) {
                debug!(store = store.name(), source = %source, target = %t, "adopted earlier copy");
                target.correlate(table, source.clone(), t);
                resolved.insert(source, current);
            }
        }
        Ok(resolved)
    }

    fn fetch_map(
        &self,
        store: &dyn ContactStore,
        ids: &[RecordId],
    ) -> SyncResult<HashMap<RecordId, ContactRecord>> {
        let mut live = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch_size) {
            for record in store.fetch_by_ids(chunk)? {
                if let Some(id) = record.id.clone() {
                    live.insert(id, record);
                }
            }
        }
        Ok(live)
    }

    fn save_batch(
        &self,
        store: &dyn ContactStore,
        records: &mut [ContactRecord],
    ) -> SyncResult<Vec<SaveOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for chunk in records.chunks_mut(self.batch_size) {
            outcomes.extend(store.save_records(chunk)?);
        }
        Ok(outcomes)
    }

    /// Removes target records. `DoesNotExist` counts as done. Other
    /// failures abort unless `tolerate` is set, in which case they are
    /// logged. Returns the ids whose correlation should be dropped.
    fn remove(
        &self,
        store: &dyn ContactStore,
        ids: &[RecordId],
        tolerate: bool,
        stats: &mut PhaseStats,
    ) -> SyncResult<Vec<RecordId>> {
        let mut gone = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch_size) {
            let outcomes = store.remove_records(chunk)?;
            for (id, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    RemoveOutcome::Removed => stats.removed += 1,
                    RemoveOutcome::DoesNotExist => {
                        debug!(store = store.name(), record = %id, "already removed");
                    }
                    RemoveOutcome::Failed(reason) if tolerate => {
                        warn!(
                            store = store.name(),
                            record = %id,
                            %reason,
                            "removal failed, continuing with pending modifications"
                        );
                        stats.tolerated_failures += 1;
                        // The target still exists, so its pair stays.
                        continue;
                    }
                    RemoveOutcome::Failed(reason) => {
                        return Err(SyncError::PartialWriteFailure {
                            store: store.name().to_string(),
                            reason: format!("removing {id}: {reason}"),
                        });
                    }
                }
                gone.push(id.clone());
            }
        }
        Ok(gone)
    }

    /// Saves modifications and additions in one batch and correlates the
    /// new records. Returns `(source, new target id)` for each addition.
    fn save_upserts(
        &self,
        target: Target,
        table: &mut CorrelationTable,
        plan: Plan,
        stats: &mut PhaseStats,
    ) -> SyncResult<Vec<(ContactRecord, RecordId)>> {
        let store = self.store(target);
        let modified = plan.modifications.len();
        let (sources, shaped): (Vec<ContactRecord>, Vec<ContactRecord>) =
            plan.additions.into_iter().unzip();
        let mut batch = plan.modifications;
        batch.extend(shaped);
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = self.save_batch(store, &mut batch)?;
        for (record, outcome) in batch.iter().zip(&outcomes).take(modified) {
            if outcome.saved_id().is_none() {
                return Err(write_failure(
                    store,
                    &format!("updating {}", record.display_name()),
                    outcome,
                ));
            }
            stats.modified += 1;
        }

        let mut added = Vec::with_capacity(sources.len());
        for (source, outcome) in sources.into_iter().zip(outcomes.iter().skip(modified)) {
            let (Some(new_id), Some(source_id)) = (outcome.saved_id(), source.id.clone()) else {
                return Err(write_failure(
                    store,
                    &format!("adding {}", source.display_name()),
                    outcome,
                ));
            };
            debug!(store = store.name(), source = %source_id, target = %new_id, "added");
            target.correlate(table, source_id, new_id.clone());
            stats.added += 1;
            added.push((source, new_id.clone()));
        }
        Ok(added)
    }

    /// Saves the self record unless unchanged. Failures are tolerated.
    fn save_self(
        &self,
        store: &dyn ContactStore,
        shaped: ContactRecord,
        stats: &mut PhaseStats,
    ) -> SyncResult<()> {
        let Some(id) = shaped.id.clone() else {
            return Ok(());
        };
        if let Some(current) = store.fetch_by_ids(std::slice::from_ref(&id))?.first() {
            if is_unchanged(current, &shaped) {
                return Ok(());
            }
        }
        let mut batch = [shaped];
        match store.save_records(&mut batch) {
            Ok(outcomes) if outcomes.first().and_then(SaveOutcome::saved_id).is_some() => {
                debug!(store = store.name(), "self record saved");
            }
            Ok(outcomes) => {
                warn!(store = store.name(), outcome = ?outcomes.first(), "self record save failed");
                stats.tolerated_failures += 1;
            }
            Err(e) => {
                warn!(store = store.name(), error = %e, "self record save failed");
                stats.tolerated_failures += 1;
            }
        }
        Ok(())
    }
}
