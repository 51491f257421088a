//! Namespace-scoped blob storage for engine-private state.
//!
//! The sync engine keeps three small blobs per account (correlation table,
//! avatar remap table, watermarks). They live here, in a separate SQLite
//! file, so engine bookkeeping never mixes with contact data.
//!
//! Writes that must land together go through [`BlobBackend::store_blobs`],
//! which commits all entries in one transaction. Every blob is stored with
//! its SHA-256; a load whose content no longer matches fails with
//! [`BlobStoreError::Corrupt`].

mod error;

pub use error::{BlobStoreError, BlobStoreResult};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Abstract access to persisted engine state.
///
/// `scope` groups related keys (one scope per account); `key` names a blob
/// within it.
pub trait BlobBackend: Send + Sync {
    /// Loads a blob, returning `None` if it was never stored.
    fn load_blob(&self, scope: &str, key: &str) -> BlobStoreResult<Option<Vec<u8>>>;

    /// Stores (or overwrites) a single blob.
    fn store_blob(&self, scope: &str, key: &str, bytes: &[u8]) -> BlobStoreResult<()>;

    /// Stores several blobs atomically: either all of them are written or
    /// none is.
    fn store_blobs(&self, scope: &str, entries: &[(&str, Vec<u8>)]) -> BlobStoreResult<()>;
}

/// SQLite-backed blob store.
pub struct BlobStore {
    conn: Mutex<Connection>,
}

fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl BlobStore {
    /// Opens (or creates) a blob store at the given path.
    pub fn open(path: &Path) -> BlobStoreResult<Self> {
        Self::with_conn(Connection::open(path)?)
    }

    /// Opens an in-memory blob store (for testing).
    pub fn open_in_memory() -> BlobStoreResult<Self> {
        Self::with_conn(Connection::open_in_memory()?)
    }

    fn with_conn(conn: Connection) -> BlobStoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> BlobStoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BlobStoreError::Storage("blob store connection lock poisoned".into()))
    }

    fn init_schema(&self) -> BlobStoreResult<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS blobs (
                namespace TEXT NOT NULL,
                blob_id TEXT NOT NULL,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, blob_id)
            );
            ",
        )?;
        Ok(())
    }

    fn upsert(conn: &Connection, namespace: &str, blob_id: &str, data: &[u8]) -> BlobStoreResult<()> {
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO blobs (namespace, blob_id, data, size, content_hash, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (namespace, blob_id) DO UPDATE SET
                data = excluded.data,
                size = excluded.size,
                content_hash = excluded.content_hash,
                modified_at = excluded.modified_at",
            params![
                namespace,
                blob_id,
                data,
                data.len() as i64,
                content_hash(data),
                now,
            ],
        )?;
        Ok(())
    }
}

impl BlobBackend for BlobStore {
    fn load_blob(&self, scope: &str, key: &str) -> BlobStoreResult<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT data, content_hash FROM blobs WHERE namespace = ?1 AND blob_id = ?2",
                params![scope, key],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((data, hash)) = row else {
            return Ok(None);
        };
        if content_hash(&data) != hash {
            return Err(BlobStoreError::Corrupt(scope.to_string(), key.to_string()));
        }
        Ok(Some(data))
    }

    fn store_blob(&self, scope: &str, key: &str, bytes: &[u8]) -> BlobStoreResult<()> {
        let conn = self.conn()?;
        Self::upsert(&conn, scope, key, bytes)
    }

    fn store_blobs(&self, scope: &str, entries: &[(&str, Vec<u8>)]) -> BlobStoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, bytes) in entries {
            Self::upsert(&tx, scope, key, bytes)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl<T: BlobBackend + ?Sized> BlobBackend for Arc<T> {
    fn load_blob(&self, scope: &str, key: &str) -> BlobStoreResult<Option<Vec<u8>>> {
        (**self).load_blob(scope, key)
    }

    fn store_blob(&self, scope: &str, key: &str, bytes: &[u8]) -> BlobStoreResult<()> {
        (**self).store_blob(scope, key, bytes)
    }

    fn store_blobs(&self, scope: &str, entries: &[(&str, Vec<u8>)]) -> BlobStoreResult<()> {
        (**self).store_blobs(scope, entries)
    }
}
