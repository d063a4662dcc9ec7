//! Read-only view of the queue for the `status` command.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;

use crate::error::StoreError;
use crate::queue::{Job, JobState, JobStore, StateCounts};
use crate::status::{StatusReporter, StatusSnapshot};

const RECENT_LOG_LINES: usize = 10;

/// Snapshot, queue counts, the head of the queue and the end of the log.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub snapshot: StatusSnapshot,
    pub counts: StateCounts,
    pub pending: Vec<Job>,
    pub recent_log: Vec<String>,
}

impl StatusReport {
    pub fn gather(
        store: &JobStore,
        reporter: &StatusReporter,
        pending_limit: usize,
        log_path: &Path,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            snapshot: reporter.read(),
            counts: store.count_by_state()?,
            pending: store.list_by_state(JobState::Planned, Some(pending_limit))?,
            recent_log: tail_lines(log_path, RECENT_LOG_LINES),
        })
    }
}

/// Last `n` lines of the file at `path`; empty when it cannot be read.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }
    let mut tail = VecDeque::with_capacity(n);
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if tail.len() == n {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_keeps_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("automation.log");
        let contents: String = (1..=15).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, contents).unwrap();

        let tail = tail_lines(&path, 3);
        assert_eq!(tail, vec!["line 13", "line 14", "line 15"]);
    }

    #[test]
    fn tail_lines_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(tail_lines(&dir.path().join("missing.log"), 10).is_empty());
    }

    #[test]
    fn gather_lists_pending_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open_in_memory().unwrap();
        for id in [6, 2, 9, 4] {
            store.insert_planned(id, &format!("Video {id}"), "");
        }
        store.transition(9, JobState::Failed, None).unwrap();
        let reporter = StatusReporter::new(dir.path().join("status.json"));
        reporter.set_current(1, "Intro").unwrap();

        let report =
            StatusReport::gather(&store, &reporter, 2, &dir.path().join("automation.log")).unwrap();

        let ids: Vec<i64> = report.pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(report.counts.planned, 3);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.snapshot.current_video.unwrap().id, 1);
        assert!(report.recent_log.is_empty());
    }

    #[test]
    fn report_serializes_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open_in_memory().unwrap();
        store.insert_planned(1, "Intro", "Hello world");
        let reporter = StatusReporter::new(dir.path().join("status.json"));

        let report = StatusReport::gather(&store, &reporter, 5, Path::new("none.log")).unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["snapshot"]["running"], false);
        assert_eq!(json["counts"]["planned"], 1);
        assert_eq!(json["pending"][0]["title"], "Intro");
        assert_eq!(json["pending"][0]["state"], "planned");
    }
}
