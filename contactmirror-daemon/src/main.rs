//! Contactmirror sync daemon
//!
//! Keeps a mirror contact database in step with a primary one:
//! 1. Runs a forced cycle at startup
//! 2. Triggers a cycle every `--interval-secs` (subject to `always_up_to_date`)
//!
//! Usage:
//!   contactmirror-daemon --primary contacts.db --mirror shared.db --state sync.db
//!
//! With `--once` it runs a single cycle and exits.

use std::{path::PathBuf, sync::Arc, time::Duration};
use anyhow::{Context, Result};
use clap::Parser;
use contactmirror_daemon::{StorePaths, load_config, open_engine, summarize};
use contactmirror_sync::{
    OrchestratorConfig, SyncEngine, SyncEvent, TriggerPolicy, create_orchestrator,
};
use contactmirror_types::AccountId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "contactmirror-daemon")]
#[command(about = "Primary/mirror contact sync daemon")]
struct Args {
    /// Primary contact database
    #[arg(long, default_value = "primary.db")]
    primary: PathBuf,

    /// Mirror contact database
    #[arg(long, default_value = "mirror.db")]
    mirror: PathBuf,

    /// Sync state database (correlations, watermarks)
    #[arg(long, default_value = "contactmirror-state.db")]
    state: PathBuf,

    /// Account to sync
    #[arg(short, long, default_value = "1")]
    account: AccountId,

    /// Seconds between periodic triggers
    #[arg(short, long, default_value = "300")]
    interval_secs: u64,

    /// JSON sync configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one forced cycle and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Contactmirror daemon starting...");
    let config = load_config(args.config.as_deref())?;
    let paths = StorePaths {
        primary: args.primary.clone(),
        mirror: args.mirror.clone(),
        state: args.state.clone(),
    };
    let engine = Arc::new(open_engine(&paths, config)?);
    info!(
        "Syncing account {} ({} <-> {})",
        args.account,
        paths.primary.display(),
        paths.mirror.display()
    );

    if args.once {
        return run_once(engine, args.account).await;
    }

    let (handle, events, orchestrator) =
        create_orchestrator(Arc::clone(&engine), OrchestratorConfig::default());
    let orchestrator_task = tokio::spawn(orchestrator.run());
    tokio::spawn(log_events(events));

    handle
        .trigger(args.account, TriggerPolicy::Force)
        .await
        .context("Failed to queue startup cycle")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    // The first tick completes immediately; the startup cycle covers it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Periodic trigger for account {}", args.account);
                if let Err(e) = handle.trigger(args.account, TriggerPolicy::IfAlwaysUpToDate).await {
                    warn!("Failed to queue periodic cycle: {}", e);
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown requested");
                break;
            }
        }
    }

    // Already stopped if the trigger above failed.
    let _ = handle.shutdown().await;
    orchestrator_task
        .await
        .context("Orchestrator task panicked")?;
    info!("Contactmirror daemon stopped");
    Ok(())
}

async fn run_once(engine: Arc<SyncEngine>, account: AccountId) -> Result<()> {
    let report = tokio::task::spawn_blocking(move || engine.trigger(account, TriggerPolicy::Force))
        .await
        .context("Sync task panicked")?
        .context("Sync cycle failed")?;
    match report {
        Some(report) => println!("{}", summarize(&report)),
        None => println!("account {account}: trigger ignored"),
    }
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::CycleCompleted { report, .. } if report.is_noop() => {
                debug!("Cycle {} found nothing to do", report.cycle_id);
            }
            SyncEvent::CycleCompleted { report, .. } => {
                info!("Cycle {} done: {}", report.cycle_id, summarize(&report));
            }
            SyncEvent::CycleFailed { account, error } => {
                warn!("Cycle for account {} failed: {}", account, error);
            }
            SyncEvent::TriggerIgnored { account } => {
                debug!("Trigger for account {} ignored by config", account);
            }
        }
    }
}
