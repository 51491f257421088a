//! Bidirectional sync between a primary and a mirror contact store.
//!
//! The primary store is the full-access contact database; the mirror is a
//! sandboxed replica for less-trusted consumers. Both are written
//! independently, and the engine keeps them convergent.
//!
//! # Architecture
//!
//! - **Transformer**: translates records between the two store shapes,
//!   including avatar path rewriting
//! - **Classifier**: separates presence-only updates from substantive ones
//! - **Correlation**: persistent primary ↔ mirror id map and avatar remaps
//! - **Detector**: queries each store for changes since its watermark
//! - **Applicator**: writes one direction's changes into the other store
//! - **Engine**: runs a cycle (prepare → pull → push → finalize)
//! - **Orchestrator**: coalesces triggers, one cycle per account at a time
//!
//! # Cycle
//!
//! 1. **Prepare**: load watermarks, correlations and avatar remaps
//! 2. **Pull**: mirror changes owned by the engine go to the primary store
//! 3. **Push**: primary changes go to the mirror store
//! 4. **Finalize**: persist all engine state in one atomic blob batch
//!
//! # Example
//!
//! ```
//! use contactmirror_blobstore::BlobStore;
//! use contactmirror_store::MemoryContactStore;
//! use contactmirror_sync::{SyncConfig, SyncEngine};
//! use contactmirror_types::AccountId;
//! use std::sync::Arc;
//!
//! let engine = SyncEngine::new(
//!     Arc::new(MemoryContactStore::new("primary").with_unique_detail_uris()),
//!     Arc::new(MemoryContactStore::new("mirror")),
//!     Arc::new(BlobStore::open_in_memory().unwrap()),
//!     SyncConfig::default(),
//! );
//! let report = engine.run(AccountId::new(1)).unwrap();
//! assert!(report.is_noop());
//! ```

pub mod applicator;
pub mod classifier;
pub mod correlation;
pub mod detector;
mod engine;
mod error;
mod orchestrator;
pub mod state;
pub mod transformer;

pub use applicator::MergeApplier;
pub use classifier::{IGNORABLE, PRESENCE, STORE_LOCAL, is_presence_only};
pub use correlation::{AvatarRemapBlob, CorrelationBlob, CorrelationTable};
pub use detector::DetectedChanges;
pub use engine::{
    DEFAULT_AGGREGATE_LABEL, DEFAULT_PRIVILEGED_SEGMENT, SyncConfig, SyncDirection, SyncEngine,
    SyncReport, TriggerPolicy,
};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{
    OrchestratorConfig, OrchestratorHandle, SyncCommand, SyncEvent, SyncOrchestrator,
    create_orchestrator,
};
pub use state::{CycleState, CycleStats, PhaseStats, WatermarkBlob};
pub use transformer::{AvatarRewrite, RecordTransformer};
