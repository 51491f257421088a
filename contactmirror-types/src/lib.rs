//! Core type definitions for contactmirror.
//!
//! This crate defines the store-agnostic types shared by the stores and the
//! sync engine:
//! - Record and account identifiers
//! - Hybrid Logical Clock timestamps used for change watermarks
//! - Contact records built from a closed set of typed details
//!
//! Nothing here knows which store a record lives in. Store-specific
//! decorations (ownership labels, detail-uri disambiguators, rewritten
//! avatar paths) are applied by the sync engine's transformer.

mod detail;
mod ids;
mod record;
mod timestamp;

pub use detail::{Detail, DetailKind, DetailKindSet, DetailMeta, DetailValue, PresenceState};
pub use ids::{AccountId, RecordId};
pub use record::ContactRecord;
pub use timestamp::HybridTimestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    #[error("unknown detail kind: {0}")]
    UnknownDetailKind(String),
}
