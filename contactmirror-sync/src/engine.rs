//! Sync engine: runs one synchronous prepare → pull → push → finalize cycle.
//!
//! The engine performs no scheduling. The orchestrator (or any caller) asks
//! it to run a cycle for an account; at most one cycle per account runs at a
//! time and a second request fails fast with [`SyncError::CycleInProgress`].

use crate::applicator::MergeApplier;
use crate::correlation::CorrelationTable;
use crate::detector;
use crate::error::{SyncError, SyncResult};
use crate::state::{CycleState, CycleStats, PhaseStats, WatermarkBlob};
use crate::transformer::RecordTransformer;
use chrono::Utc;
use contactmirror_blobstore::BlobBackend;
use contactmirror_store::ContactStore;
use contactmirror_types::AccountId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Default ownership label of engine-managed records.
pub const DEFAULT_AGGREGATE_LABEL: &str = "aggregate";

/// Default path segment marking privileged-only avatar files.
pub const DEFAULT_PRIVILEGED_SEGMENT: &str = "privileged/";

/// Which directions a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    #[default]
    TwoWay,
    /// Mirror → primary only.
    PullOnly,
    /// Primary → mirror only.
    PushOnly,
}

impl SyncDirection {
    #[must_use]
    pub fn pulls(self) -> bool {
        matches!(self, SyncDirection::TwoWay | SyncDirection::PullOnly)
    }

    #[must_use]
    pub fn pushes(self) -> bool {
        matches!(self, SyncDirection::TwoWay | SyncDirection::PushOnly)
    }
}

/// How a trigger interacts with [`SyncConfig::always_up_to_date`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Run regardless of configuration (explicit user request).
    Force,
    /// Run only when the account is configured to stay up to date
    /// (change notifications, periodic timers).
    IfAlwaysUpToDate,
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Ownership label marking engine-managed records.
    pub aggregate_label: String,
    /// Path segment removed from privileged avatar paths on export.
    pub privileged_segment: String,
    /// Directions to run.
    pub direction: SyncDirection,
    /// Whether non-forced triggers start a cycle.
    pub always_up_to_date: bool,
    /// Maximum records per store call.
    pub batch_size: usize,
    /// Whether finalized cycles drop change-log entries at or before the
    /// persisted watermarks. Disable when several accounts share one pair
    /// of stores.
    pub prune_change_logs: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            aggregate_label: DEFAULT_AGGREGATE_LABEL.to_string(),
            privileged_segment: DEFAULT_PRIVILEGED_SEGMENT.to_string(),
            direction: SyncDirection::TwoWay,
            always_up_to_date: true,
            batch_size: 100,
            prune_change_logs: true,
        }
    }
}

/// Outcome of a finalized cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub cycle_id: Uuid,
    pub account: AccountId,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub presence_updates: usize,
    pub tolerated_failures: usize,
    pub pull: PhaseStats,
    pub push: PhaseStats,
    pub duration: Duration,
}

impl SyncReport {
    /// Returns true if the cycle wrote nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added + self.modified + self.removed + self.presence_updates == 0
    }
}

/// Drives sync cycles between a primary and a mirror store.
pub struct SyncEngine {
    primary: Arc<dyn ContactStore>,
    mirror: Arc<dyn ContactStore>,
    blobs: Arc<dyn BlobBackend>,
    config: SyncConfig,
    transformer: RecordTransformer,
    /// Accounts with a cycle in flight, and its phase.
    cycles: Mutex<HashMap<AccountId, CycleState>>,
}

/// Marks an account busy for the lifetime of a cycle.
struct CycleGuard<'a> {
    engine: &'a SyncEngine,
    account: AccountId,
}

impl CycleGuard<'_> {
    fn enter(&self, state: CycleState) {
        debug!(%state, "entering phase");
        self.engine.cycles().insert(self.account, state);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.engine.cycles().remove(&self.account);
    }
}

impl SyncEngine {
    /// Creates an engine over the given stores.
    pub fn new(
        primary: Arc<dyn ContactStore>,
        mirror: Arc<dyn ContactStore>,
        blobs: Arc<dyn BlobBackend>,
        config: SyncConfig,
    ) -> Self {
        let transformer =
            RecordTransformer::new(&config.aggregate_label, &config.privileged_segment);
        Self {
            primary,
            mirror,
            blobs,
            config,
            transformer,
            cycles: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn cycles(&self) -> std::sync::MutexGuard<'_, HashMap<AccountId, CycleState>> {
        self.cycles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase of the cycle running for `account`.
    pub fn state(&self, account: AccountId) -> CycleState {
        self.cycles().get(&account).copied().unwrap_or_default()
    }

    /// Returns true if a trigger with `policy` should start a cycle.
    pub fn accepts(&self, policy: TriggerPolicy) -> bool {
        policy == TriggerPolicy::Force || self.config.always_up_to_date
    }

    /// Runs a cycle if `policy` allows it; `None` means the trigger was
    /// ignored.
    pub fn trigger(
        &self,
        account: AccountId,
        policy: TriggerPolicy,
    ) -> SyncResult<Option<SyncReport>> {
        if !self.accepts(policy) {
            debug!(%account, ?policy, "trigger ignored");
            return Ok(None);
        }
        self.run(account).map(Some)
    }

    /// Stats of the last finalized cycle for `account`.
    pub fn last_cycle(&self, account: AccountId) -> SyncResult<Option<CycleStats>> {
        Ok(WatermarkBlob::load(&*self.blobs, account)?.last_cycle)
    }

    /// Persisted watermarks for `account`.
    pub fn watermarks(&self, account: AccountId) -> SyncResult<WatermarkBlob> {
        WatermarkBlob::load(&*self.blobs, account)
    }

    /// Persisted correlation table for `account`.
    pub fn correlations(&self, account: AccountId) -> SyncResult<CorrelationTable> {
        CorrelationTable::load(&*self.blobs, account)
    }

    /// Runs one full cycle for `account`.
    ///
    /// On error nothing is persisted: watermarks, correlations and avatar
    /// remaps stay as they were and the next cycle starts over.
    pub fn run(&self, account: AccountId) -> SyncResult<SyncReport> {
        let guard = {
            let mut cycles = self.cycles();
            if cycles.contains_key(&account) {
                return Err(SyncError::CycleInProgress(account));
            }
            cycles.insert(account, CycleState::Preparing);
            CycleGuard {
                engine: self,
                account,
            }
        };

        let cycle_id = Uuid::now_v7();
        let span = info_span!("sync_cycle", %account, cycle = %cycle_id);
        let _enter = span.enter();

        match self.cycle(&guard, cycle_id) {
            Ok(report) => {
                info!(
                    added = report.added,
                    modified = report.modified,
                    removed = report.removed,
                    presence = report.presence_updates,
                    tolerated = report.tolerated_failures,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "sync cycle aborted");
                Err(e)
            }
        }
    }

    fn cycle(&self, guard: &CycleGuard<'_>, cycle_id: Uuid) -> SyncResult<SyncReport> {
        let account = guard.account;
        let started = Instant::now();
        let started_at = Utc::now();

        guard.enter(CycleState::Preparing);
        let mut watermarks = WatermarkBlob::load(&*self.blobs, account)?;
        let mut table = CorrelationTable::load(&*self.blobs, account)?;
        let primary_self = self.primary.self_record_id()?;
        let mirror_self = self.mirror.self_record_id()?;
        if table.mirror_of(&primary_self) != Some(&mirror_self) {
            debug!(entries = table.len(), "seeding self correlation");
            table.insert(primary_self, mirror_self);
        }

        let applier = MergeApplier::new(
            &*self.primary,
            &*self.mirror,
            &self.transformer,
            self.config.batch_size,
        );

        let mut pull = PhaseStats::default();
        if self.config.direction.pulls() {
            guard.enter(CycleState::PullingMirror);
            // Read before the pull writes to the primary store.
            let kept = if self.config.direction.pushes() {
                detector::primary_touched(&*self.primary, watermarks.push)?
            } else {
                BTreeMap::new()
            };
            let detected = detector::mirror_changes(
                &*self.mirror,
                watermarks.pull,
                self.transformer.aggregate_label(),
            )?;
            let next = detected.watermark;
            pull = applier.apply_pull(&mut table, detected, &kept)?;
            watermarks.pull = Some(next);
            info!(
                added = pull.added,
                modified = pull.modified,
                removed = pull.removed,
                "pulled mirror changes"
            );
        }

        let mut push = PhaseStats::default();
        if self.config.direction.pushes() {
            guard.enter(CycleState::PushingPrimary);
            let detected = detector::primary_changes(&*self.primary, watermarks.push)?;
            let next = detected.watermark;
            push = applier.apply_push(&mut table, detected)?;
            watermarks.push = Some(next);
            info!(
                added = push.added,
                modified = push.modified,
                removed = push.removed,
                presence = push.presence_updates,
                "pushed primary changes"
            );
        }

        guard.enter(CycleState::Finalizing);
        watermarks.last_cycle = Some(CycleStats {
            cycle_id: cycle_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            pull,
            push,
        });
        let mut entries = table.encode()?;
        entries.push(watermarks.encode()?);
        self.blobs.store_blobs(&account.scope(), &entries)?;
        debug!(correlations = table.len(), "persisted engine state");
        if self.config.prune_change_logs {
            self.prune_change_logs(&watermarks);
        }

        let totals = pull.combine(push);
        Ok(SyncReport {
            cycle_id,
            account,
            added: totals.added,
            modified: totals.modified,
            removed: totals.removed,
            presence_updates: totals.presence_updates,
            tolerated_failures: totals.tolerated_failures,
            pull,
            push,
            duration: started.elapsed(),
        })
    }

    /// Drops change-log entries both stores will never be asked for again.
    /// The cycle is already persisted, so failures are only logged.
    fn prune_change_logs(&self, watermarks: &WatermarkBlob) {
        let logs = [(&self.primary, watermarks.push), (&self.mirror, watermarks.pull)];
        for (store, up_to) in logs {
            let Some(up_to) = up_to else {
                continue;
            };
            if let Err(e) = store.prune_changes(up_to) {
                warn!(store = store.name(), error = %e, "failed to prune change log");
            }
        }
    }
}
