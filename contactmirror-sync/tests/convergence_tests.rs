mod common;

use common::{
    ACCOUNT, Harness, ProbeStore, alice, mirror_person, mirror_store, note, person, primary_store,
};
use contactmirror_blobstore::BlobStore;
use contactmirror_store::MemoryContactStore;
use contactmirror_sync::{IGNORABLE, STORE_LOCAL, SyncConfig, SyncEngine, SyncError};
use contactmirror_types::{ContactRecord, DetailKind, DetailValue, PresenceState};
use proptest::prelude::*;
use std::sync::Arc;

fn assert_converged(
    primary: &MemoryContactStore,
    mirror: &MemoryContactStore,
    engine: &SyncEngine,
) {
    let table = engine.correlations(ACCOUNT).unwrap();
    assert!(table.is_bijective());
    assert_eq!(primary.len().unwrap(), mirror.len().unwrap());
    assert_eq!(table.len(), primary.len().unwrap() + 1);

    for (p, m) in table.pairs() {
        let ours = primary.get(p).unwrap().expect("correlated primary record is live");
        let theirs = mirror.get(m).unwrap().expect("correlated mirror record is live");
        assert!(
            ours.content_matches(&theirs, IGNORABLE.union(STORE_LOCAL)),
            "{p} and {m} diverged"
        );
    }
}

// ── Idempotence ─────────────────────────────────────────────────

#[test]
fn second_run_without_edits_is_noop() {
    let h = Harness::new();
    h.primary.insert(alice()).unwrap();
    h.primary.insert(person("Bob", "Builder")).unwrap();
    h.mirror.insert(mirror_person("Carol")).unwrap();

    let first = h.engine.run(ACCOUNT).unwrap();
    assert_eq!(first.added, 3);

    let second = h.engine.run(ACCOUNT).unwrap();
    assert!(second.is_noop());
    assert_ne!(first.cycle_id, second.cycle_id);
    assert_converged(&h.primary, &h.mirror, &h.engine);
}

#[test]
fn run_after_each_direction_settles() {
    let h = Harness::new();
    let alice_id = h.primary.insert(alice()).unwrap();
    h.engine.run(ACCOUNT).unwrap();

    let mut copy = h.mirror_copy(&alice_id).unwrap();
    copy.set_detail(note("pulled"));
    h.mirror.update(copy).unwrap();
    assert_eq!(h.engine.run(ACCOUNT).unwrap().pull.modified, 1);
    assert!(h.engine.run(ACCOUNT).unwrap().is_noop());

    let mut stored = h.primary.get(&alice_id).unwrap().unwrap();
    stored.set_detail(note("pushed"));
    h.primary.update(stored).unwrap();
    assert_eq!(h.engine.run(ACCOUNT).unwrap().push.modified, 1);
    assert!(h.engine.run(ACCOUNT).unwrap().is_noop());

    assert_converged(&h.primary, &h.mirror, &h.engine);
}

// ── Redelivery ──────────────────────────────────────────────────

#[test]
fn aborted_cycle_rerun_matches_clean_run() {
    let h = Harness::new();
    h.mirror.insert(mirror_person("Bob")).unwrap();
    h.primary.insert(person("Carol", "Danvers")).unwrap();
    h.mirror
        .fail_saves_where(|r| r.display_name() == "Carol Danvers")
        .unwrap();

    let err = h.engine.run(ACCOUNT).unwrap_err();
    assert!(matches!(err, SyncError::PartialWriteFailure { .. }));
    assert_eq!(h.primary.len().unwrap(), 2);
    assert_eq!(h.engine.watermarks(ACCOUNT).unwrap().pull, None);

    h.mirror.clear_failures().unwrap();
    let report = h.engine.run(ACCOUNT).unwrap();
    assert_eq!(report.pull.added, 0);
    assert_eq!(report.push.added, 1);
    assert_eq!(h.primary.len().unwrap(), 2);
    assert_eq!(h.mirror.len().unwrap(), 2);
    assert_converged(&h.primary, &h.mirror, &h.engine);

    let clean = Harness::new();
    clean.mirror.insert(mirror_person("Bob")).unwrap();
    clean.primary.insert(person("Carol", "Danvers")).unwrap();
    let reference = clean.engine.run(ACCOUNT).unwrap();
    assert_eq!(reference.added, 2);
    assert_eq!(clean.primary.len().unwrap(), h.primary.len().unwrap());
    assert_eq!(clean.mirror.len().unwrap(), h.mirror.len().unwrap());
}

#[test]
fn repeated_aborts_never_duplicate() {
    let h = Harness::new();
    h.mirror.insert(mirror_person("Bob")).unwrap();
    h.primary.insert(person("Carol", "Danvers")).unwrap();
    h.mirror
        .fail_saves_where(|r| r.display_name() == "Carol Danvers")
        .unwrap();

    for _ in 0..3 {
        assert!(h.engine.run(ACCOUNT).is_err());
    }
    h.mirror.clear_failures().unwrap();
    h.engine.run(ACCOUNT).unwrap();

    let names: Vec<String> = h
        .primary
        .records()
        .unwrap()
        .iter()
        .map(ContactRecord::display_name)
        .collect();
    assert_eq!(names.iter().filter(|n| n.as_str() == "Bob").count(), 1);
    assert_converged(&h.primary, &h.mirror, &h.engine);
}

// ── Ordering and id reuse ───────────────────────────────────────

#[test]
fn pull_removes_before_adding_into_reused_id() {
    let primary = primary_store();
    let probe = Arc::new(ProbeStore::new(primary.clone()));
    let mirror = mirror_store();
    let engine = SyncEngine::new(
        probe.clone(),
        mirror.clone(),
        Arc::new(BlobStore::open_in_memory().unwrap()),
        SyncConfig::default(),
    );

    let alice_id = primary.insert(alice()).unwrap();
    engine.run(ACCOUNT).unwrap();
    let alice_copy = engine
        .correlations(ACCOUNT)
        .unwrap()
        .mirror_of(&alice_id)
        .cloned()
        .unwrap();

    mirror.remove(&alice_copy).unwrap();
    let dave = mirror.insert(mirror_person("Dave")).unwrap();
    assert_eq!(dave, alice_copy);

    let seen = probe.calls().len();
    let report = engine.run(ACCOUNT).unwrap();
    assert_eq!(report.pull.removed, 1);
    assert_eq!(report.pull.added, 1);

    let calls = probe.calls().split_off(seen);
    let removed_at = calls.iter().position(|c| *c == "remove").unwrap();
    let saved_at = calls.iter().position(|c| *c == "save").unwrap();
    assert!(removed_at < saved_at, "{calls:?}");

    let records = primary.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].display_name(), "Dave");
    assert_eq!(records[0].id.as_ref(), Some(&alice_id));

    let table = engine.correlations(ACCOUNT).unwrap();
    assert_eq!(table.mirror_of(&alice_id), Some(&dave));
    assert!(table.is_bijective());
    assert_converged(&primary, &mirror, &engine);
}

#[test]
fn push_removes_before_adding_into_reused_id() {
    let primary = primary_store();
    let mirror = mirror_store();
    let probe = Arc::new(ProbeStore::new(mirror.clone()));
    let engine = SyncEngine::new(
        primary.clone(),
        probe.clone(),
        Arc::new(BlobStore::open_in_memory().unwrap()),
        SyncConfig::default(),
    );

    let alice_id = primary.insert(alice()).unwrap();
    engine.run(ACCOUNT).unwrap();

    primary.remove(&alice_id).unwrap();
    let erin = primary.insert(person("Erin", "")).unwrap();
    assert_eq!(erin, alice_id);

    let seen = probe.calls().len();
    let report = engine.run(ACCOUNT).unwrap();
    assert_eq!(report.push.removed, 1);
    assert_eq!(report.push.added, 1);

    let calls = probe.calls().split_off(seen);
    let removed_at = calls.iter().position(|c| *c == "remove").unwrap();
    let saved_at = calls.iter().position(|c| *c == "save").unwrap();
    assert!(removed_at < saved_at, "{calls:?}");

    let copies = mirror.records().unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].display_name(), "Erin");
    assert_converged(&primary, &mirror, &engine);
}

#[test]
fn pull_addition_reusing_removed_primary_id_displaces_stale_copy() {
    let h = Harness::new();
    let alice_id = h.primary.insert(alice()).unwrap();
    h.engine.run(ACCOUNT).unwrap();
    let stale = h.mirror_id_of(&alice_id);

    h.primary.remove(&alice_id).unwrap();
    let bob = h.mirror.insert(mirror_person("Bob")).unwrap();

    let report = h.engine.run(ACCOUNT).unwrap();
    assert_eq!(report.pull.added, 1);
    assert_eq!(report.push.removed, 1);

    let bob_copy = h.primary_copy(&bob).unwrap();
    assert_eq!(bob_copy.id.as_ref(), Some(&alice_id));
    assert!(h.mirror.get(&stale).unwrap().is_none());
    assert!(h.mirror.get(&bob).unwrap().is_some());
    assert_converged(&h.primary, &h.mirror, &h.engine);
    assert!(h.engine.run(ACCOUNT).unwrap().is_noop());
}

#[test]
fn mirror_edit_revives_primary_removal() {
    let h = Harness::new();
    let alice_id = h.primary.insert(alice()).unwrap();
    h.engine.run(ACCOUNT).unwrap();
    let copy_id = h.mirror_id_of(&alice_id);

    h.primary.remove(&alice_id).unwrap();
    let mut copy = h.mirror.get(&copy_id).unwrap().unwrap();
    copy.set_detail(note("still here"));
    h.mirror.update(copy).unwrap();

    h.engine.run(ACCOUNT).unwrap();
    assert!(h.mirror.get(&copy_id).unwrap().is_some());
    let revived = h.primary_copy(&copy_id).unwrap();
    assert_eq!(revived.display_name(), "Alice Liddell");
    assert_converged(&h.primary, &h.mirror, &h.engine);
}

// ── Random edit sequences ───────────────────────────────────────

#[derive(Debug, Clone)]
enum Edit {
    PrimaryAdd(u8),
    PrimaryNote(usize, u8),
    PrimaryPresence(usize),
    PrimaryRemove(usize),
    MirrorAdd(u8),
    MirrorNote(usize, u8),
    MirrorRemove(usize),
    Sync,
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        any::<u8>().prop_map(Edit::PrimaryAdd),
        (any::<usize>(), any::<u8>()).prop_map(|(i, n)| Edit::PrimaryNote(i, n)),
        any::<usize>().prop_map(Edit::PrimaryPresence),
        any::<usize>().prop_map(Edit::PrimaryRemove),
        any::<u8>().prop_map(Edit::MirrorAdd),
        (any::<usize>(), any::<u8>()).prop_map(|(i, n)| Edit::MirrorNote(i, n)),
        any::<usize>().prop_map(Edit::MirrorRemove),
        Just(Edit::Sync),
    ]
}

fn pick(store: &MemoryContactStore, index: usize) -> Option<ContactRecord> {
    let records = store.records().unwrap();
    if records.is_empty() {
        return None;
    }
    Some(records[index % records.len()].clone())
}

fn apply(h: &Harness, edit: &Edit) {
    match edit {
        Edit::PrimaryAdd(n) => {
            h.primary.insert(person(&format!("P{n}"), "")).unwrap();
        }
        Edit::PrimaryNote(i, n) => {
            if let Some(mut record) = pick(&h.primary, *i) {
                record.set_detail(note(&format!("p-{n}")));
                h.primary.update(record).unwrap();
            }
        }
        Edit::PrimaryPresence(i) => {
            if let Some(mut record) = pick(&h.primary, *i) {
                let state = match record.first(DetailKind::Presence) {
                    Some(_) => PresenceState::Offline,
                    None => PresenceState::Available,
                };
                record.set_detail(DetailValue::Presence {
                    state,
                    message: String::new(),
                });
                h.primary.update(record).unwrap();
            }
        }
        Edit::PrimaryRemove(i) => {
            if let Some(record) = pick(&h.primary, *i) {
                h.primary.remove(record.id.as_ref().unwrap()).unwrap();
            }
        }
        Edit::MirrorAdd(n) => {
            h.mirror.insert(mirror_person(&format!("M{n}"))).unwrap();
        }
        Edit::MirrorNote(i, n) => {
            if let Some(mut record) = pick(&h.mirror, *i) {
                record.set_detail(note(&format!("m-{n}")));
                h.mirror.update(record).unwrap();
            }
        }
        Edit::MirrorRemove(i) => {
            if let Some(record) = pick(&h.mirror, *i) {
                h.mirror.remove(record.id.as_ref().unwrap()).unwrap();
            }
        }
        Edit::Sync => {
            h.engine.run(ACCOUNT).unwrap();
            assert!(h.engine.correlations(ACCOUNT).unwrap().is_bijective());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_edits_converge(edits in prop::collection::vec(edit_strategy(), 1..40)) {
        let h = Harness::new();
        for edit in &edits {
            apply(&h, edit);
        }
        h.engine.run(ACCOUNT).unwrap();
        assert_converged(&h.primary, &h.mirror, &h.engine);
        prop_assert!(h.engine.run(ACCOUNT).unwrap().is_noop());
    }
}
