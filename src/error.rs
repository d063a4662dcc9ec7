use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::queue::JobState;

/// Failures of the persistent job table.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(i64),

    #[error("Job {id} is {state}; only failed jobs can be requeued")]
    NotRequeueable { id: i64, state: JobState },

    #[error("Job store lock poisoned")]
    Poisoned,
}

/// Failures while persisting the status snapshot.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by an automation adapter while handling one job.
///
/// The daemon treats every variant exactly like
/// [`AdapterOutcome::Failed`](crate::adapter::AdapterOutcome::Failed).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Automation application not found at {}", .0.display())]
    ApplicationMissing(PathBuf),

    #[error("Failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Automation did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
