//! Error types for the sync layer.

use contactmirror_blobstore::BlobStoreError;
use contactmirror_store::StoreError;
use contactmirror_types::AccountId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Reasons a sync cycle aborts.
///
/// Every variant leaves the watermarks where they were; the next trigger
/// reruns the whole cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A contact store could not be reached or failed a whole call.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Part of a batch write failed and the failure is not tolerated.
    #[error("partial write failure in {store} store: {reason}")]
    PartialWriteFailure { store: String, reason: String },

    /// Persisted engine state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted engine state was written by an incompatible version.
    #[error("incompatible {key} blob version {version}")]
    IncompatibleState { key: String, version: u32 },

    /// The blob store failed.
    #[error("blob store error: {0}")]
    Blob(#[from] BlobStoreError),

    /// A cycle for this account is already running.
    #[error("sync cycle already in progress for account {0}")]
    CycleInProgress(AccountId),

    /// The orchestrator task is gone.
    #[error("orchestrator channel closed")]
    ChannelClosed,
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::StoreUnavailable(err.to_string())
    }
}
