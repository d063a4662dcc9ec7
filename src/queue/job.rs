use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a video job.
///
/// Each job flows through: planned → processing → {downloaded | failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Planned,
    Processing,
    Downloaded,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Planned,
        JobState::Processing,
        JobState::Downloaded,
        JobState::Failed,
    ];

    /// The value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Planned => "planned",
            JobState::Processing => "processing",
            JobState::Downloaded => "downloaded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Downloaded | JobState::Failed)
    }

    /// Whether the daemon may move a job from `self` to `next`.
    ///
    /// Operator resets (failed → planned) are not part of this graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Planned, JobState::Processing)
                | (JobState::Processing, JobState::Downloaded)
                | (JobState::Processing, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job state: {0:?}")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: UnknownState| FromSqlError::Other(Box::new(e)))
    }
}

/// One row of the job table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub title: String,
    pub script: String,
    pub state: JobState,
    pub output_path: Option<PathBuf>,
}

impl Job {
    /// The title cut to at most `max_chars` characters, for log lines and listings.
    pub fn preview_title(&self, max_chars: usize) -> String {
        preview(&self.title, max_chars)
    }
}

/// First `max_chars` characters of `text`.
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub planned: u64,
    pub processing: u64,
    pub downloaded: u64,
    pub failed: u64,
}

impl StateCounts {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Planned => self.planned += count,
            JobState::Processing => self.processing += count,
            JobState::Downloaded => self.downloaded += count,
            JobState::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.planned + self.processing + self.downloaded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_roundtrip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
            assert_eq!(state.to_string(), state.as_str());
        }
        assert_eq!(
            "queued".parse::<JobState>(),
            Err(UnknownState("queued".into()))
        );
    }

    #[test]
    fn only_forward_edges_are_legal() {
        use JobState::*;

        assert!(Planned.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Downloaded));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Planned.can_transition_to(Downloaded));
        assert!(!Planned.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Planned));
        for terminal in [Downloaded, Failed] {
            assert!(terminal.is_terminal());
            for next in JobState::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Planned.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&JobState::Downloaded).unwrap();
        assert_eq!(json, "\"downloaded\"");
    }

    #[test]
    fn preview_title_counts_chars() {
        let job = Job {
            id: 1,
            title: "Ünïcode title that is long".into(),
            script: String::new(),
            state: JobState::Planned,
            output_path: None,
        };
        assert_eq!(job.preview_title(7), "Ünïcode");
        assert_eq!(job.preview_title(100), job.title);
    }

    #[test]
    fn state_counts_total() {
        let mut counts = StateCounts::default();
        counts.add(JobState::Planned, 3);
        counts.add(JobState::Failed, 1);
        counts.add(JobState::Planned, 2);
        assert_eq!(counts.planned, 5);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 6);
    }
}
