//! Error types for the contact stores.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that fail a whole store call (as opposed to per-record outcomes).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A client operation referenced a record that does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A client write violated a store constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),
}
