use contactmirror_blobstore::{BlobBackend, BlobStore};
use contactmirror_sync::correlation::{AVATAR_REMAP_KEY, CORRELATION_KEY};
use contactmirror_sync::state::WATERMARK_KEY;
use contactmirror_sync::{CorrelationTable, SyncError, WatermarkBlob};
use contactmirror_types::{AccountId, HybridTimestamp, RecordId};
use proptest::prelude::*;

const ACCOUNT: AccountId = AccountId::new(3);

fn id(n: u32) -> RecordId {
    RecordId::from(n.to_string().as_str())
}

fn persist(blobs: &BlobStore, table: &CorrelationTable) {
    let entries = table.encode().unwrap();
    blobs.store_blobs(&ACCOUNT.scope(), &entries).unwrap();
}

// ── Pairs ───────────────────────────────────────────────────────

#[test]
fn insert_and_lookup_both_ways() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.insert(id(3), id(6));

    assert_eq!(table.mirror_of(&id(2)), Some(&id(5)));
    assert_eq!(table.primary_of(&id(6)), Some(&id(3)));
    assert_eq!(table.len(), 2);
    assert!(table.is_bijective());
}

#[test]
fn insert_evicts_pairs_sharing_an_id() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.insert(id(3), id(6));

    // Mirror 6 now belongs to primary 2; both old pairs go.
    table.insert(id(2), id(6));
    assert_eq!(table.len(), 1);
    assert_eq!(table.mirror_of(&id(2)), Some(&id(6)));
    assert_eq!(table.mirror_of(&id(3)), None);
    assert_eq!(table.primary_of(&id(5)), None);
    assert!(table.is_bijective());
}

#[test]
fn remove_by_either_side() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.insert(id(3), id(6));

    assert_eq!(table.remove_by_primary(&id(2)), Some(id(5)));
    assert_eq!(table.remove_by_mirror(&id(6)), Some(id(3)));
    assert_eq!(table.remove_by_mirror(&id(6)), None);
    assert!(table.is_empty());
}

#[test]
fn reused_primary_id_displaces_old_mirror() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.insert(id(2), id(7));
    assert_eq!(table.take_displaced(), vec![id(5)]);
    assert!(table.take_displaced().is_empty());

    // Re-correlating the same pair displaces nothing.
    table.insert(id(2), id(7));
    assert!(table.take_displaced().is_empty());
}

#[test]
fn displaced_mirror_correlated_again_is_not_reported() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.insert(id(2), id(7));
    table.insert(id(4), id(5));
    assert!(table.take_displaced().is_empty());
}

// ── Avatar remaps ───────────────────────────────────────────────

#[test]
fn avatar_remaps_follow_their_pair() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.record_avatar(id(2), "/a/x.jpg".into(), "/a/privileged/x.jpg".into());
    assert_eq!(
        table
            .avatar_remaps(&id(2))
            .and_then(|m| m.get("/a/x.jpg"))
            .map(String::as_str),
        Some("/a/privileged/x.jpg")
    );

    table.remove_by_mirror(&id(5));
    assert!(table.avatar_remaps(&id(2)).is_none());
}

#[test]
fn clear_avatars_keeps_the_pair() {
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.record_avatar(id(2), "/a/x.jpg".into(), "/a/privileged/x.jpg".into());
    table.clear_avatars(&id(2));
    assert!(table.avatar_remaps(&id(2)).is_none());
    assert_eq!(table.mirror_of(&id(2)), Some(&id(5)));
}

// ── Persistence ─────────────────────────────────────────────────

#[test]
fn missing_blobs_load_empty() {
    let blobs = BlobStore::open_in_memory().unwrap();
    assert!(CorrelationTable::load(&blobs, ACCOUNT).unwrap().is_empty());
    assert_eq!(
        WatermarkBlob::load(&blobs, ACCOUNT).unwrap(),
        WatermarkBlob::default()
    );
}

#[test]
fn table_survives_persist_and_load() {
    let blobs = BlobStore::open_in_memory().unwrap();
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.insert(id(3), id(6));
    table.record_avatar(id(3), "/a/y.jpg".into(), "/a/privileged/y.jpg".into());
    persist(&blobs, &table);

    let loaded = CorrelationTable::load(&blobs, ACCOUNT).unwrap();
    assert_eq!(loaded, table);

    // Other accounts see nothing.
    let other = CorrelationTable::load(&blobs, AccountId::new(4)).unwrap();
    assert!(other.is_empty());
}

#[test]
fn encode_drops_remaps_of_uncorrelated_ids() {
    let blobs = BlobStore::open_in_memory().unwrap();
    let mut table = CorrelationTable::new();
    table.insert(id(2), id(5));
    table.record_avatar(id(9), "/a/z.jpg".into(), "/a/privileged/z.jpg".into());
    persist(&blobs, &table);

    let loaded = CorrelationTable::load(&blobs, ACCOUNT).unwrap();
    assert!(loaded.avatar_remaps(&id(9)).is_none());
    assert_eq!(loaded.len(), 1);
}

#[test]
fn future_versions_are_rejected() {
    let blobs = BlobStore::open_in_memory().unwrap();
    let scope = ACCOUNT.scope();
    blobs
        .store_blob(&scope, CORRELATION_KEY, br#"{"version":99,"pairs":[]}"#)
        .unwrap();
    let err = CorrelationTable::load(&blobs, ACCOUNT).unwrap_err();
    assert!(matches!(err, SyncError::IncompatibleState { version: 99, .. }));

    let blobs = BlobStore::open_in_memory().unwrap();
    blobs
        .store_blob(&scope, AVATAR_REMAP_KEY, br#"{"version":7,"entries":{}}"#)
        .unwrap();
    assert!(matches!(
        CorrelationTable::load(&blobs, ACCOUNT),
        Err(SyncError::IncompatibleState { version: 7, .. })
    ));

    blobs
        .store_blob(
            &scope,
            WATERMARK_KEY,
            br#"{"version":5,"pull":null,"push":null}"#,
        )
        .unwrap();
    assert!(matches!(
        WatermarkBlob::load(&blobs, ACCOUNT),
        Err(SyncError::IncompatibleState { version: 5, .. })
    ));
}

#[test]
fn watermarks_round_trip() {
    let blobs = BlobStore::open_in_memory().unwrap();
    let marks = WatermarkBlob {
        pull: Some(HybridTimestamp::new(40, 2)),
        push: Some(HybridTimestamp::new(12, 0)),
        ..WatermarkBlob::default()
    };
    let (key, bytes) = marks.encode().unwrap();
    blobs.store_blob(&ACCOUNT.scope(), key, &bytes).unwrap();
    assert_eq!(WatermarkBlob::load(&blobs, ACCOUNT).unwrap(), marks);
}

// ── Properties ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Insert(u32, u32),
    RemovePrimary(u32),
    RemoveMirror(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..12, 1u32..12).prop_map(|(p, m)| Op::Insert(p, m)),
        1 => (1u32..12).prop_map(Op::RemovePrimary),
        1 => (1u32..12).prop_map(Op::RemoveMirror),
    ]
}

proptest! {
    #[test]
    fn table_stays_bijective(ops in prop::collection::vec(op(), 0..60)) {
        let mut table = CorrelationTable::new();
        for op in ops {
            match op {
                Op::Insert(p, m) => {
                    table.insert(id(p), id(m));
                    prop_assert_eq!(table.mirror_of(&id(p)), Some(&id(m)));
                }
                Op::RemovePrimary(p) => {
                    table.remove_by_primary(&id(p));
                    prop_assert!(table.mirror_of(&id(p)).is_none());
                }
                Op::RemoveMirror(m) => {
                    table.remove_by_mirror(&id(m));
                    prop_assert!(table.primary_of(&id(m)).is_none());
                }
            }
            prop_assert!(table.is_bijective());
        }
        for displaced in table.take_displaced() {
            prop_assert!(table.primary_of(&displaced).is_none());
        }
    }
}
