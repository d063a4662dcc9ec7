//! Handlers behind each CLI subcommand.
//!
//! All of them are thin callers over the same [`JobStore`] and
//! [`StatusReporter`]; the dispatch logic lives in [`Daemon`] only.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::CommandAdapter;
use crate::config::AutomationConfig;
use crate::daemon::{Daemon, DaemonSettings, RunOutcome};
use crate::queue::JobStore;
use crate::report::StatusReport;
use crate::status::StatusReporter;
use crate::ui;

/// How a successful command ended, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Work was done (exit 0).
    Done,
    /// Nothing was planned (exit 2).
    Idle,
}

fn open_store(config: &AutomationConfig) -> Result<Arc<JobStore>> {
    let store = JobStore::open(&config.db_path)
        .with_context(|| format!("Failed to open job store at {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

fn check_application(config: &AutomationConfig) -> Result<()> {
    if let Some(app) = config.adapter.app_path.as_ref().filter(|app| !app.exists()) {
        bail!("Video application not installed at {}", app.display());
    }
    Ok(())
}

fn build_daemon(config: &AutomationConfig) -> Result<Daemon<CommandAdapter>> {
    check_application(config)?;
    let store = open_store(config)?;
    let reporter = StatusReporter::new(&config.status_path);
    let adapter = CommandAdapter::from_config(&config.adapter, &config.output_dir);
    Ok(Daemon::new(
        store,
        reporter,
        adapter,
        DaemonSettings::from(config),
    ))
}

/// Cancels `token` on Ctrl+C or, on Unix, SIGTERM.
async fn cancel_on_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing current job"),
        _ = terminate => info!("Received SIGTERM, finishing current job"),
    }
    token.cancel();
}

/// `daemon`: runs the polling loop until interrupted.
pub async fn run_daemon(config: &AutomationConfig) -> Result<CommandStatus> {
    let mut daemon = build_daemon(config)?;
    info!(
        db = %config.db_path.display(),
        status = %config.status_path.display(),
        output = %config.output_dir.display(),
        "Starting background automation daemon"
    );

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_shutdown(cancel.clone()));
    let result = daemon.run(&cancel).await;
    watcher.abort();

    result.context("Daemon stopped on a job store failure")?;
    Ok(CommandStatus::Done)
}

/// `process-one`: handles the oldest planned job, if any.
pub async fn process_one(config: &AutomationConfig) -> Result<CommandStatus> {
    let mut daemon = build_daemon(config)?;

    let progress = ui::DispatchProgress::start("Processing next planned video");
    let outcome = daemon
        .process_one()
        .await
        .context("Job store failure while processing")?;

    match outcome {
        RunOutcome::Idle => {
            progress.finish_idle();
            Ok(CommandStatus::Idle)
        }
        RunOutcome::Processed(report) => {
            progress.finish(&report);
            Ok(CommandStatus::Done)
        }
    }
}

/// `status`: prints the snapshot, queue counts and pending jobs.
pub fn show_status(config: &AutomationConfig, limit: Option<usize>, json: bool) -> Result<CommandStatus> {
    let store = open_store(config)?;
    let reporter = StatusReporter::new(&config.status_path);
    let report = StatusReport::gather(
        &store,
        &reporter,
        limit.unwrap_or(config.pending_preview),
        &config.log_path,
    )
    .context("Failed to read job store")?;

    if json {
        ui::print_status_json(&report)?;
    } else {
        ui::print_status(&report);
    }
    Ok(CommandStatus::Done)
}

/// `requeue`: gives a failed job another attempt.
pub fn requeue(config: &AutomationConfig, id: i64) -> Result<CommandStatus> {
    let store = open_store(config)?;
    store
        .requeue(id)
        .with_context(|| format!("Cannot requeue job {id}"))?;
    match store.get(id)? {
        Some(job) => println!("Job {id} ({}) is planned again", job.preview_title(50)),
        None => println!("Job {id} is planned again"),
    }
    Ok(CommandStatus::Done)
}
