#![allow(dead_code)]

use contactmirror_blobstore::{BlobBackend, BlobStore, BlobStoreError, BlobStoreResult};
use contactmirror_store::{
    ChangeSet, ContactStore, MemoryContactStore, RemoveOutcome, SaveOutcome, StoreResult,
};
use contactmirror_sync::{SyncConfig, SyncEngine};
use contactmirror_types::{
    AccountId, ContactRecord, Detail, DetailKindSet, DetailValue, HybridTimestamp, RecordId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

pub const ACCOUNT: AccountId = AccountId::new(1);

// ── Records ─────────────────────────────────────────────────────

pub fn person(given: &str, family: &str) -> ContactRecord {
    ContactRecord::new().with_detail(DetailValue::Name {
        given: given.into(),
        family: family.into(),
    })
}

/// Alice as a primary client would create her.
pub fn alice() -> ContactRecord {
    person("Alice", "Liddell").with_detail(
        Detail::new(DetailValue::PhoneNumber {
            number: "+15550100".into(),
            sub_types: vec!["mobile".into()],
        })
        .with_provenance("sim"),
    )
}

/// A record as a mirror client would create it.
pub fn mirror_person(given: &str) -> ContactRecord {
    person(given, "").with_detail(DetailValue::SyncTarget {
        label: "aggregate".into(),
    })
}

pub fn note(text: &str) -> DetailValue {
    DetailValue::Note { text: text.into() }
}

// ── Harness ─────────────────────────────────────────────────────

pub struct Harness {
    pub primary: Arc<MemoryContactStore>,
    pub mirror: Arc<MemoryContactStore>,
    pub blobs: Arc<BlobStore>,
    pub engine: SyncEngine,
}

pub fn primary_store() -> Arc<MemoryContactStore> {
    Arc::new(
        MemoryContactStore::new("primary")
            .with_unique_detail_uris()
            .with_generated_guids(),
    )
}

pub fn mirror_store() -> Arc<MemoryContactStore> {
    Arc::new(MemoryContactStore::new("mirror"))
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let primary = primary_store();
        let mirror = mirror_store();
        let blobs = Arc::new(BlobStore::open_in_memory().unwrap());
        let engine = SyncEngine::new(primary.clone(), mirror.clone(), blobs.clone(), config);
        Self {
            primary,
            mirror,
            blobs,
            engine,
        }
    }

    /// Mirror counterpart of a primary record, per the persisted table.
    pub fn mirror_copy(&self, primary_id: &RecordId) -> Option<ContactRecord> {
        let table = self.engine.correlations(ACCOUNT).unwrap();
        let mirror_id = table.mirror_of(primary_id)?.clone();
        self.mirror.get(&mirror_id).unwrap()
    }

    /// Primary counterpart of a mirror record, per the persisted table.
    pub fn primary_copy(&self, mirror_id: &RecordId) -> Option<ContactRecord> {
        let table = self.engine.correlations(ACCOUNT).unwrap();
        let primary_id = table.primary_of(mirror_id)?.clone();
        self.primary.get(&primary_id).unwrap()
    }

    pub fn mirror_id_of(&self, primary_id: &RecordId) -> RecordId {
        self.engine
            .correlations(ACCOUNT)
            .unwrap()
            .mirror_of(primary_id)
            .cloned()
            .unwrap()
    }
}

// ── Store probe ─────────────────────────────────────────────────

/// Records engine calls and can hold the first cycle at its first clock
/// read until released.
pub struct ProbeStore {
    inner: Arc<MemoryContactStore>,
    calls: Mutex<Vec<&'static str>>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ProbeStore {
    pub fn new(inner: Arc<MemoryContactStore>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
        }
    }

    /// Returns the store and the sender that releases the gate.
    pub fn gated(inner: Arc<MemoryContactStore>) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let store = Self::new(inner);
        *store.gate.lock().unwrap() = Some(rx);
        (store, tx)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ContactStore for ProbeStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn query_changes(
        &self,
        since: Option<HybridTimestamp>,
        ownership: &str,
    ) -> StoreResult<ChangeSet> {
        self.log("query");
        self.inner.query_changes(since, ownership)
    }

    fn query_local_changes(
        &self,
        since: Option<HybridTimestamp>,
        ignored: DetailKindSet,
    ) -> StoreResult<(HybridTimestamp, ChangeSet)> {
        self.log("query");
        self.inner.query_local_changes(since, ignored)
    }

    fn save_records(&self, records: &mut [ContactRecord]) -> StoreResult<Vec<SaveOutcome>> {
        self.log("save");
        self.inner.save_records(records)
    }

    fn remove_records(&self, ids: &[RecordId]) -> StoreResult<Vec<RemoveOutcome>> {
        self.log("remove");
        self.inner.remove_records(ids)
    }

    fn fetch_by_ids(&self, ids: &[RecordId]) -> StoreResult<Vec<ContactRecord>> {
        self.inner.fetch_by_ids(ids)
    }

    fn find_by_origin(&self, origins: &[RecordId]) -> StoreResult<HashMap<RecordId, RecordId>> {
        self.inner.find_by_origin(origins)
    }

    fn self_record_id(&self) -> StoreResult<RecordId> {
        self.inner.self_record_id()
    }

    fn current_timestamp(&self) -> StoreResult<HybridTimestamp> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        self.inner.current_timestamp()
    }

    fn prune_changes(&self, up_to: HybridTimestamp) -> StoreResult<usize> {
        self.log("prune");
        self.inner.prune_changes(up_to)
    }
}

// ── Blob backend that can fail ──────────────────────────────────

/// Blob backend whose batch writes fail while `failing` is set.
pub struct FlakyBlobs {
    inner: BlobStore,
    failing: AtomicBool,
}

impl FlakyBlobs {
    pub fn new() -> Self {
        Self {
            inner: BlobStore::open_in_memory().unwrap(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl BlobBackend for FlakyBlobs {
    fn load_blob(&self, scope: &str, key: &str) -> BlobStoreResult<Option<Vec<u8>>> {
        self.inner.load_blob(scope, key)
    }

    fn store_blob(&self, scope: &str, key: &str, bytes: &[u8]) -> BlobStoreResult<()> {
        self.inner.store_blob(scope, key, bytes)
    }

    fn store_blobs(&self, scope: &str, entries: &[(&str, Vec<u8>)]) -> BlobStoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Storage("disk full".into()));
        }
        self.inner.store_blobs(scope, entries)
    }
}
