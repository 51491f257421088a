//! Trigger handling around the synchronous engine.
//!
//! Change notifications arrive as [`SyncCommand::Trigger`] messages. The
//! orchestrator keeps at most one cycle per account in flight; triggers that
//! arrive meanwhile collapse into a single follow-up cycle started once the
//! running one ends. Cycles execute on the blocking thread pool and report
//! back through [`SyncEvent`]s.

use crate::engine::{SyncEngine, SyncReport, TriggerPolicy};
use crate::error::{SyncError, SyncResult};
use contactmirror_types::AccountId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Commands accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Something changed; sync `account`.
    Trigger {
        account: AccountId,
        policy: TriggerPolicy,
    },
    /// Stop accepting triggers and exit once running cycles end.
    Shutdown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CycleCompleted {
        account: AccountId,
        report: SyncReport,
    },
    CycleFailed {
        account: AccountId,
        error: String,
    },
    /// A non-forced trigger was dropped by configuration.
    TriggerIgnored { account: AccountId },
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

/// Cloneable handle for sending commands to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<SyncCommand>,
}

impl OrchestratorHandle {
    /// Requests a cycle for `account`.
    pub async fn trigger(&self, account: AccountId, policy: TriggerPolicy) -> SyncResult<()> {
        self.send(SyncCommand::Trigger { account, policy }).await
    }

    /// Asks the orchestrator to stop.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.send(SyncCommand::Shutdown).await
    }

    async fn send(&self, command: SyncCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

type Finished = (AccountId, SyncResult<SyncReport>);

/// Event loop owning the in-flight bookkeeping.
pub struct SyncOrchestrator {
    engine: Arc<SyncEngine>,
    commands: mpsc::Receiver<SyncCommand>,
    events: mpsc::Sender<SyncEvent>,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
    running: HashSet<AccountId>,
    follow_up: HashSet<AccountId>,
}

/// Creates an orchestrator, its command handle and its event stream.
pub fn create_orchestrator(
    engine: Arc<SyncEngine>,
    config: OrchestratorConfig,
) -> (OrchestratorHandle, mpsc::Receiver<SyncEvent>, SyncOrchestrator) {
    let capacity = config.channel_capacity.max(1);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let orchestrator = SyncOrchestrator {
        engine,
        commands: command_rx,
        events: event_tx,
        finished_tx,
        finished_rx,
        running: HashSet::new(),
        follow_up: HashSet::new(),
    };
    (
        OrchestratorHandle {
            commands: command_tx,
        },
        event_rx,
        orchestrator,
    )
}

impl SyncOrchestrator {
    /// Runs until shut down or every handle is dropped, then waits for the
    /// cycles still in flight.
    pub async fn run(mut self) {
        info!("sync orchestrator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SyncCommand::Trigger { account, policy }) => {
                        self.on_trigger(account, policy).await;
                    }
                    Some(SyncCommand::Shutdown) | None => break,
                },
                Some((account, result)) = self.finished_rx.recv() => {
                    self.on_finished(account, result).await;
                }
            }
        }

        self.follow_up.clear();
        while !self.running.is_empty() {
            match self.finished_rx.recv().await {
                Some((account, result)) => self.on_finished(account, result).await,
                None => break,
            }
        }
        info!("sync orchestrator stopped");
    }

    async fn on_trigger(&mut self, account: AccountId, policy: TriggerPolicy) {
        if !self.engine.accepts(policy) {
            debug!(%account, "trigger ignored by policy");
            self.emit(SyncEvent::TriggerIgnored { account }).await;
            return;
        }
        if self.running.contains(&account) {
            debug!(%account, "cycle in flight, coalescing trigger");
            self.follow_up.insert(account);
            return;
        }
        self.start(account);
    }

    fn start(&mut self, account: AccountId) {
        self.running.insert(account);
        let engine = Arc::clone(&self.engine);
        let finished = self.finished_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || engine.run(account))
                .await
                .unwrap_or_else(|e| {
                    Err(SyncError::StoreUnavailable(format!("sync task failed: {e}")))
                });
            let _ = finished.send((account, result));
        });
    }

    async fn on_finished(&mut self, account: AccountId, result: SyncResult<SyncReport>) {
        self.running.remove(&account);
        let event = match result {
            Ok(report) => SyncEvent::CycleCompleted { account, report },
            Err(e) => {
                warn!(%account, error = %e, "sync cycle failed");
                SyncEvent::CycleFailed {
                    account,
                    error: e.to_string(),
                }
            }
        };
        self.emit(event).await;
        if self.follow_up.remove(&account) {
            debug!(%account, "starting coalesced follow-up cycle");
            self.start(account);
        }
    }

    async fn emit(&self, event: SyncEvent) {
        if self.events.send(event).await.is_err() {
            debug!("no event listener");
        }
    }
}
