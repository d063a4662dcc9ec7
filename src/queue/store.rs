//! SQLite-backed job table.
//!
//! The table is shared with the tools that create jobs and with read-only
//! status queries, so every mutation is a single transaction and the
//! connection waits on a busy database instead of failing outright.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use super::job::{Job, JobState, StateCounts};
use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS videos (
    id        INTEGER PRIMARY KEY,
    title     TEXT NOT NULL DEFAULT '',
    script    TEXT NOT NULL DEFAULT '',
    status    TEXT NOT NULL DEFAULT 'planned',
    file_path TEXT NOT NULL DEFAULT ''
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_JOB: &str = "SELECT id, title, script, status, file_path FROM videos";

fn read_job_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let file_path: Option<String> = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        script: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        state: row.get(3)?,
        output_path: file_path.filter(|p| !p.is_empty()).map(PathBuf::from),
    })
}

/// Persistent table of video jobs.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Opens (or creates) the database at `path` and makes sure the job table exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened job store");
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// All planned jobs, oldest id first.
    pub fn list_planned(&self) -> Result<Vec<Job>, StoreError> {
        self.list_by_state(JobState::Planned, None)
    }

    /// Jobs in `state` ordered by ascending id, optionally capped at `limit` rows.
    pub fn list_by_state(
        &self,
        state: JobState,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("{SELECT_JOB} WHERE status = ?1 ORDER BY id ASC LIMIT ?2"))?;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let jobs = stmt
            .query_map(params![state, limit], read_job_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("{SELECT_JOB} WHERE id = ?1"),
                params![id],
                read_job_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Sets the state of job `id` in one transaction.
    ///
    /// The output path column is overwritten with `output_path`, or emptied when
    /// `None`, so only a downloaded job ever carries a path. Ordering between
    /// states is the caller's responsibility.
    pub fn transition(
        &self,
        id: i64,
        new_state: JobState,
        output_path: Option<&Path>,
    ) -> Result<(), StoreError> {
        let file_path = output_path
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE videos SET status = ?1, file_path = ?2 WHERE id = ?3",
            params![new_state, file_path, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit()?;

        debug!(job_id = id, state = %new_state, "Job state updated");
        Ok(())
    }

    /// Puts a failed job back in the queue and forgets any previous output.
    pub fn requeue(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let state: Option<JobState> = tx
            .query_row(
                "SELECT status FROM videos WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match state {
            None => return Err(StoreError::NotFound(id)),
            Some(JobState::Failed) => {}
            Some(state) => return Err(StoreError::NotRequeueable { id, state }),
        }
        tx.execute(
            "UPDATE videos SET status = ?1, file_path = '' WHERE id = ?2",
            params![JobState::Planned, id],
        )?;
        tx.commit()?;

        info!(job_id = id, "Job requeued");
        Ok(())
    }

    /// Number of jobs in each state. Rows with an unrecognised status are skipped.
    pub fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM videos GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StateCounts::default();
        for row in rows {
            let (status, count) = row?;
            match status.parse::<JobState>() {
                Ok(state) => counts.add(state, u64::try_from(count).unwrap_or(0)),
                Err(e) => warn!(error = %e, count, "Ignoring jobs with unknown status"),
            }
        }
        Ok(counts)
    }

    #[cfg(test)]
    pub(crate) fn insert_planned(&self, id: i64, title: &str, script: &str) {
        let conn = self.conn().unwrap();
        conn.execute(
            "INSERT INTO videos (id, title, script, status) VALUES (?1, ?2, ?3, 'planned')",
            params![id, title, script],
        )
        .unwrap();
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) {
        self.conn().unwrap().execute_batch(sql).unwrap();
    }
}
