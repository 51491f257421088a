//! SQLite-backed contact store.
//!
//! Records are kept as JSON bodies keyed by an `INTEGER PRIMARY KEY`, so ids
//! are allocated the way SQLite allocates rowids (one past the highest live
//! id). Every write runs in a transaction that also appends to the `changes`
//! table, refreshes the record's rows in `detail_uris` and advances the
//! persisted clock.

use crate::changelog::{ChangeEntry, ChangeOp, pending_changes, prepare_insert, prepare_update};
use crate::{ChangeSet, ContactStore, RemoveOutcome, SaveOutcome, StoreError, StoreResult};
use contactmirror_types::{ContactRecord, DetailKindSet, HybridTimestamp, RecordId};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const SELF_ID: i64 = 1;

/// Persistent [`ContactStore`] used by the daemon.
pub struct SqliteContactStore {
    name: String,
    unique_uris: bool,
    guids: bool,
    conn: Arc<Mutex<Connection>>,
}

fn numeric(id: &RecordId) -> Option<i64> {
    id.as_str().parse().ok()
}

fn load_clock(conn: &Connection) -> StoreResult<HybridTimestamp> {
    let (wall, logical) = conn.query_row("SELECT wall, logical FROM clock WHERE id = 0", [], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    Ok(HybridTimestamp::new(wall as u64, logical as u32))
}

fn advance_clock(conn: &Connection) -> StoreResult<HybridTimestamp> {
    let now = load_clock(conn)?.tick();
    conn.execute(
        "UPDATE clock SET wall = ?1, logical = ?2 WHERE id = 0",
        params![now.wall_time() as i64, i64::from(now.logical())],
    )?;
    Ok(now)
}

fn load_record(conn: &Connection, id: i64) -> StoreResult<Option<ContactRecord>> {
    let body = conn
        .query_row("SELECT body FROM records WHERE id = ?1", params![id], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
}

fn all_records(conn: &Connection) -> StoreResult<Vec<ContactRecord>> {
    let mut stmt = conn.prepare("SELECT body FROM records ORDER BY id")?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

fn detail_uris(record: &ContactRecord) -> impl Iterator<Item = &str> {
    record.details.iter().filter_map(|d| d.meta.uri.as_deref())
}

/// Returns the first detail uri of `record` already used by a record other
/// than `id`.
fn uri_collision(conn: &Connection, id: i64, record: &ContactRecord) -> StoreResult<Option<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM detail_uris WHERE uri = ?1 AND record_id != ?2 LIMIT 1",
    )?;
    for uri in detail_uris(record) {
        if stmt.exists(params![uri, id])? {
            return Ok(Some(uri.to_string()));
        }
    }
    Ok(None)
}

fn index_uris(conn: &Connection, id: i64, record: &ContactRecord) -> StoreResult<()> {
    conn.execute("DELETE FROM detail_uris WHERE record_id = ?1", params![id])?;
    let mut stmt =
        conn.prepare_cached("INSERT INTO detail_uris (uri, record_id) VALUES (?1, ?2)")?;
    for uri in detail_uris(record) {
        stmt.execute(params![uri, id])?;
    }
    Ok(())
}

fn put_record(conn: &Connection, id: i64, record: &ContactRecord) -> StoreResult<()> {
    index_uris(conn, id, record)?;
    conn.execute(
        "INSERT INTO records (id, origin, body) VALUES (?1, ?2, ?3)
         ON CONFLICT (id) DO UPDATE SET origin = excluded.origin, body = excluded.body",
        params![
            id,
            record.origin.as_ref().map(RecordId::as_str),
            serde_json::to_string(record)?
        ],
    )?;
    Ok(())
}

fn append_change(conn: &Connection, entry: &ChangeEntry) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO changes (record_id, wall, logical, op, kinds, by_engine, ownership)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.record_id.as_str(),
            entry.at.wall_time() as i64,
            i64::from(entry.at.logical()),
            entry.op.as_str(),
            i64::from(entry.kinds.bits()),
            entry.by_engine,
            entry.ownership,
        ],
    )?;
    Ok(())
}

fn changes_since(
    conn: &Connection,
    since: Option<HybridTimestamp>,
) -> StoreResult<Vec<ChangeEntry>> {
    let since = since.unwrap_or(HybridTimestamp::ZERO);
    let mut stmt = conn.prepare(
        "SELECT record_id, wall, logical, op, kinds, by_engine, ownership FROM changes
         WHERE wall > ?1 OR (wall = ?1 AND logical > ?2)
         ORDER BY seq",
    )?;
    let rows = stmt.query_map(
        params![since.wall_time() as i64, i64::from(since.logical())],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        },
    )?;
    let mut entries = Vec::new();
    for row in rows {
        let (record_id, wall, logical, op, kinds, by_engine, ownership) = row?;
        let op = ChangeOp::parse(&op)
            .ok_or_else(|| StoreError::Constraint(format!("unknown change op {op}")))?;
        entries.push(ChangeEntry {
            record_id: RecordId::new(record_id),
            at: HybridTimestamp::new(wall as u64, logical as u32),
            op,
            kinds: DetailKindSet::from_bits(kinds as u32),
            by_engine,
            ownership,
        });
    }
    Ok(entries)
}

impl SqliteContactStore {
    /// Opens (or creates) a contact store at the given path.
    pub fn open(path: &Path, name: impl Into<String>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_conn(conn, name.into())
    }

    /// Opens an in-memory contact store (for testing).
    pub fn open_in_memory(name: impl Into<String>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_conn(conn, name.into())
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

    fn with_conn(conn: Connection, name: String) -> StoreResult<Self> {
        let store = Self {
            name,
            unique_uris: false,
            guids: false,
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable(format!("{} store lock poisoned", self.name)))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY,
                origin TEXT,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS records_origin ON records (origin);

            CREATE TABLE IF NOT EXISTS changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                wall INTEGER NOT NULL,
                logical INTEGER NOT NULL,
                op TEXT NOT NULL,
                kinds INTEGER NOT NULL,
                by_engine INTEGER NOT NULL,
                ownership TEXT
            );

            CREATE INDEX IF NOT EXISTS changes_at ON changes (wall, logical);

            CREATE TABLE IF NOT EXISTS detail_uris (
                uri TEXT NOT NULL,
                record_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS detail_uris_uri ON detail_uris (uri);
            CREATE INDEX IF NOT EXISTS detail_uris_record ON detail_uris (record_id);

            CREATE TABLE IF NOT EXISTS clock (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                wall INTEGER NOT NULL,
                logical INTEGER NOT NULL
            );
            ",
        )?;
        let now = HybridTimestamp::now();
        tx.execute(
            "INSERT OR IGNORE INTO clock (id, wall, logical) VALUES (0, ?1, ?2)",
            params![now.wall_time() as i64, i64::from(now.logical())],
        )?;
        let indexed: i64 = tx.query_row("SELECT COUNT(*) FROM detail_uris", [], |row| row.get(0))?;
        if indexed == 0 {
            for record in all_records(&tx)? {
                if let Some(n) = record.id.as_ref().and_then(numeric) {
                    index_uris(&tx, n, &record)?;
                }
            }
        }
        if load_record(&tx, SELF_ID)?.is_none() {
            let mut me = ContactRecord::new();
            prepare_insert(&mut me, RecordId::from(SELF_ID as u64), None, now);
            put_record(&tx, SELF_ID, &me)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Inserts, or replaces when the record carries an id. Per-record
    /// rejections come back as the inner `Err`.
    fn write(
        &self,
        conn: &Connection,
        mut record: ContactRecord,
        by_engine: bool,
    ) -> StoreResult<Result<ContactRecord, SaveOutcome>> {
        let (n, op, kinds) = match record.id.as_ref() {
            Some(id) => {
                let Some(n) = numeric(id) else {
                    return Ok(Err(SaveOutcome::DoesNotExist));
                };
                let Some(existing) = load_record(conn, n)? else {
                    return Ok(Err(SaveOutcome::DoesNotExist));
                };
                let now = advance_clock(conn)?;
                let kinds = prepare_update(&existing, &mut record, now);
                (n, ChangeOp::Modified, kinds)
            }
            None => {
                let n: i64 =
                    conn.query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM records", [], |row| {
                        row.get(0)
                    })?;
                let now = advance_clock(conn)?;
                let guid_prefix = self.guids.then_some(self.name.as_str());
                prepare_insert(&mut record, RecordId::from(n as u64), guid_prefix, now);
                (n, ChangeOp::Added, DetailKindSet::EMPTY)
            }
        };
        if self.unique_uris {
            if let Some(uri) = uri_collision(conn, n, &record)? {
                return Ok(Err(SaveOutcome::Failed(format!(
                    "detail uri {uri} already in use"
                ))));
            }
        }
        put_record(conn, n, &record)?;
        append_change(
            conn,
            &ChangeEntry {
                record_id: RecordId::from(n as u64),
                at: load_clock(conn)?,
                op,
                kinds,
                by_engine,
                ownership: record.ownership_label().map(str::to_string),
            },
        )?;
        Ok(Ok(record))
    }

    fn delete(&self, conn: &Connection, n: i64, by_engine: bool) -> StoreResult<bool> {
        let Some(existing) = load_record(conn, n)? else {
            return Ok(false);
        };
        conn.execute("DELETE FROM records WHERE id = ?1", params![n])?;
        conn.execute("DELETE FROM detail_uris WHERE record_id = ?1", params![n])?;
        let at = advance_clock(conn)?;
        append_change(
            conn,
            &ChangeEntry {
                record_id: RecordId::from(n as u64),
                at,
                op: ChangeOp::Removed,
                kinds: DetailKindSet::EMPTY,
                by_engine,
                ownership: existing.ownership_label().map(str::to_string),
            },
        )?;
        Ok(true)
    }

    fn collect(
        conn: &Connection,
        ids: &[RecordId],
        keep: impl Fn(&ContactRecord) -> bool,
    ) -> StoreResult<Vec<ContactRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for n in ids.iter().filter_map(numeric) {
            if let Some(record) = load_record(conn, n)? {
                if keep(&record) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    fn live_ids(conn: &Connection) -> StoreResult<HashSet<RecordId>> {
        let mut stmt = conn.prepare("SELECT id FROM records")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(|n| RecordId::from(n as u64)))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    // ── Client API ──────────────────────────────────────────────

    /// Inserts a new record on behalf of a store client.
    pub fn insert(&self, record: ContactRecord) -> StoreResult<RecordId> {
        if record.id.is_some() {
            return Err(StoreError::Constraint("new records must not carry an id".into()));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let saved = match self.write(&tx, record, false)? {
            Ok(saved) => saved,
            Err(outcome) => return Err(StoreError::Constraint(format!("{outcome:?}"))),
        };
        tx.commit()?;
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
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match self.write(&tx, record, false)? {
            Ok(_) => {}
            Err(SaveOutcome::DoesNotExist) => return Err(StoreError::NotFound(id.to_string())),
            Err(outcome) => return Err(StoreError::Constraint(format!("{outcome:?}"))),
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes a record on behalf of a store client.
    pub fn remove(&self, id: &RecordId) -> StoreResult<()> {
        let n = numeric(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if n == SELF_ID {
            return Err(StoreError::Constraint("the self record cannot be removed".into()));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if !self.delete(&tx, n, false)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns a live record.
    pub fn get(&self, id: &RecordId) -> StoreResult<Option<ContactRecord>> {
        let Some(n) = numeric(id) else {
            return Ok(None);
        };
        let conn = self.conn()?;
        load_record(&conn, n)
    }

    /// All live records except the self record, in id order.
    pub fn records(&self) -> StoreResult<Vec<ContactRecord>> {
        let self_id = RecordId::from(SELF_ID as u64);
        let conn = self.conn()?;
        Ok(all_records(&conn)?
            .into_iter()
            .filter(|r| r.id.as_ref() != Some(&self_id))
            .collect())
    }

    /// Number of live records, not counting the self record.
    pub fn len(&self) -> StoreResult<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM records WHERE id != ?1",
            params![SELF_ID],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Returns true if the store holds nothing but the self record.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl ContactStore for SqliteContactStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_changes(
        &self,
        since: Option<HybridTimestamp>,
        ownership: &str,
    ) -> StoreResult<ChangeSet> {
        let conn = self.conn()?;
        let entries = changes_since(&conn, since)?;
        let live = Self::live_ids(&conn)?;
        let pending = pending_changes(&entries, Some(ownership), DetailKindSet::EMPTY, |id| {
            live.contains(id)
        });
        let self_id = RecordId::from(SELF_ID as u64);
        let owned = |r: &ContactRecord| {
            r.id.as_ref() == Some(&self_id) || r.ownership_label() == Some(ownership)
        };
        let changes = ChangeSet {
            added: Self::collect(&conn, &pending.added, owned)?,
            modified: Self::collect(&conn, &pending.modified, owned)?,
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
        let conn = self.conn()?;
        let watermark = load_clock(&conn)?;
        let entries = changes_since(&conn, since)?;
        let live = Self::live_ids(&conn)?;
        let pending = pending_changes(&entries, None, ignored, |id| live.contains(id));
        let changes = ChangeSet {
            added: Self::collect(&conn, &pending.added, |_| true)?,
            modified: Self::collect(&conn, &pending.modified, |_| true)?,
            removed: pending.removed,
            touched: pending.touched,
        };
        debug!(store = %self.name, changes = changes.len(), "queried local changes");
        Ok((watermark, changes))
    }

    fn save_records(&self, records: &mut [ContactRecord]) -> StoreResult<Vec<SaveOutcome>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            let outcome = match self.write(&tx, record.clone(), true)? {
                Ok(saved) => {
                    record.id.clone_from(&saved.id);
                    saved.id.map_or_else(
                        || SaveOutcome::Failed("store did not assign an id".into()),
                        SaveOutcome::Saved,
                    )
                }
                Err(outcome) => outcome,
            };
            outcomes.push(outcome);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    fn remove_records(&self, ids: &[RecordId]) -> StoreResult<Vec<RemoveOutcome>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = match numeric(id) {
                Some(SELF_ID) => RemoveOutcome::Failed("the self record cannot be removed".into()),
                Some(n) => {
                    if self.delete(&tx, n, true)? {
                        RemoveOutcome::Removed
                    } else {
                        RemoveOutcome::DoesNotExist
                    }
                }
                None => RemoveOutcome::DoesNotExist,
            };
            outcomes.push(outcome);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    fn fetch_by_ids(&self, ids: &[RecordId]) -> StoreResult<Vec<ContactRecord>> {
        let conn = self.conn()?;
        Self::collect(&conn, ids, |_| true)
    }

    fn find_by_origin(&self, origins: &[RecordId]) -> StoreResult<HashMap<RecordId, RecordId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM records WHERE origin = ?1")?;
        let mut found = HashMap::new();
        for origin in origins {
            let hit = stmt
                .query_row(params![origin.as_str()], |row| row.get::<_, i64>(0))
                .optional()?;
            if let Some(n) = hit {
                found.insert(origin.clone(), RecordId::from(n as u64));
            }
        }
        Ok(found)
    }

    fn self_record_id(&self) -> StoreResult<RecordId> {
        Ok(RecordId::from(SELF_ID as u64))
    }

    fn current_timestamp(&self) -> StoreResult<HybridTimestamp> {
        let conn = self.conn()?;
        load_clock(&conn)
    }

    fn prune_changes(&self, up_to: HybridTimestamp) -> StoreResult<usize> {
        let conn = self.conn()?;
        let pruned = conn.execute(
            "DELETE FROM changes WHERE wall < ?1 OR (wall = ?1 AND logical <= ?2)",
            params![up_to.wall_time() as i64, i64::from(up_to.logical())],
        )?;
        debug!(store = %self.name, pruned, "pruned change log");
        Ok(pruned)
    }
}
