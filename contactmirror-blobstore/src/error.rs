//! Error types for the blob store.

use thiserror::Error;

/// Result type for blob store operations.
pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// Errors that can occur in blob store operations.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// Stored content no longer matches its recorded hash.
    #[error("blob corrupt: {0}/{1}")]
    Corrupt(String, String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Storage-level failure (lock poisoned, backend unreachable, ...).
    #[error("storage error: {0}")]
    Storage(String),
}
