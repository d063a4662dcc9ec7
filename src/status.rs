//! Persisted status snapshot for external monitoring.
//!
//! The [`StatusReporter`] owns one JSON file. Reads never fail: a missing or
//! unreadable file yields the default snapshot. Writes merge a
//! [`StatusUpdate`] into the current snapshot, stamp `last_update` and replace
//! the file atomically (temp file + rename).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StatusError;

/// The job currently handed to the automation adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentVideo {
    pub id: i64,
    pub title: String,
}

/// Aggregate view of daemon progress, as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub current_video: Option<CurrentVideo>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
}

/// Accepts RFC 3339 and offset-less ISO-8601 timestamps, the latter read as
/// local time. Anything else becomes `None` instead of failing the snapshot.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(text)) => parse_timestamp(&text),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => {
            warn!(value = %other, "Ignoring non-string last_update");
            None
        }
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    match text.parse::<NaiveDateTime>() {
        Ok(naive) => Some(
            naive
                .and_local_timezone(Local)
                .earliest()
                .map_or_else(|| naive.and_utc(), |ts| ts.with_timezone(&Utc)),
        ),
        Err(e) => {
            warn!(value = text, error = %e, "Ignoring unparsable last_update");
            None
        }
    }
}

/// Fields to merge into the snapshot. `None` leaves a field untouched;
/// `current_video: Some(None)` clears the current job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub running: Option<bool>,
    pub current_video: Option<Option<CurrentVideo>>,
    pub processed_count: Option<u64>,
    pub failed_count: Option<u64>,
}

impl StatusUpdate {
    pub fn running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn current_video(mut self, current: Option<CurrentVideo>) -> Self {
        self.current_video = Some(current);
        self
    }

    pub fn counts(mut self, processed: u64, failed: u64) -> Self {
        self.processed_count = Some(processed);
        self.failed_count = Some(failed);
        self
    }

    fn apply(self, snapshot: &mut StatusSnapshot) {
        if let Some(running) = self.running {
            snapshot.running = running;
        }
        if let Some(current) = self.current_video {
            snapshot.current_video = current;
        }
        if let Some(processed) = self.processed_count {
            snapshot.processed_count = processed;
        }
        if let Some(failed) = self.failed_count {
            snapshot.failed_count = failed;
        }
    }
}

/// Reads and writes the status snapshot file.
pub struct StatusReporter {
    path: PathBuf,
    // Serializes read-merge-write cycles within this process.
    write_lock: Mutex<()>,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last persisted snapshot, or the default one.
    pub fn read(&self) -> StatusSnapshot {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StatusSnapshot::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read status file, using defaults");
                return StatusSnapshot::default();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Corrupt status file, using defaults");
            StatusSnapshot::default()
        })
    }

    /// Merges `update` into the current snapshot and persists the result.
    pub fn write(&self, update: StatusUpdate) -> Result<StatusSnapshot, StatusError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = self.read();
        update.apply(&mut snapshot);
        snapshot.last_update = Some(Utc::now());
        self.persist(&snapshot)?;
        debug!(path = %self.path.display(), "Status snapshot written");
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &StatusSnapshot) -> Result<(), StatusError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Daemon start: running, counters reset, nothing in flight.
    pub fn mark_started(&self) -> Result<StatusSnapshot, StatusError> {
        self.write(
            StatusUpdate::default()
                .running(true)
                .current_video(None)
                .counts(0, 0),
        )
    }

    /// Daemon exit: not running, nothing in flight. Counters are kept.
    pub fn mark_stopped(&self) -> Result<StatusSnapshot, StatusError> {
        self.write(StatusUpdate::default().running(false).current_video(None))
    }

    pub fn set_current(&self, id: i64, title: &str) -> Result<StatusSnapshot, StatusError> {
        self.write(StatusUpdate::default().current_video(Some(CurrentVideo {
            id,
            title: title.to_string(),
        })))
    }

    pub fn clear_current(&self) -> Result<StatusSnapshot, StatusError> {
        self.write(StatusUpdate::default().current_video(None))
    }

    pub fn record_counts(&self, processed: u64, failed: u64) -> Result<StatusSnapshot, StatusError> {
        self.write(StatusUpdate::default().counts(processed, failed))
    }
}
