//! Polling daemon that feeds planned jobs to the automation adapter.
//!
//! One control task, one job at a time: the adapter drives an exclusive
//! desktop application. Each dispatch moves a job
//! planned → processing → {downloaded | failed}; the status snapshot follows
//! along on a best-effort basis.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterOutcome, AutomationAdapter, RenderRequest};
use crate::config::AutomationConfig;
use crate::error::{StatusError, StoreError};
use crate::queue::{Job, JobState, JobStore};
use crate::status::{StatusReporter, StatusSnapshot};

const LOG_TITLE_CHARS: usize = 40;

/// Timing and failure policy of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSettings {
    pub poll_interval: Duration,
    pub job_pause: Duration,
    /// Consecutive failing cycles tolerated before giving up; 0 never gives up.
    pub max_store_failures: u32,
}

impl From<&AutomationConfig> for DaemonSettings {
    fn from(config: &AutomationConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            job_pause: config.job_pause(),
            max_store_failures: config.max_store_failures,
        }
    }
}

/// Jobs finished since the current run began.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    pub processed: u64,
    pub failed: u64,
}

impl DispatchCounters {
    pub fn total(&self) -> u64 {
        self.processed + self.failed
    }
}

/// What happened to one dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub job_id: i64,
    pub title: String,
    /// Terminal state written to the store.
    pub state: JobState,
    pub output_path: Option<PathBuf>,
    pub reason: Option<String>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Downloaded
    }
}

/// Result of a single-shot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No planned job was waiting.
    Idle,
    Processed(DispatchReport),
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when cancelled.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn best_effort(what: &str, result: Result<StatusSnapshot, StatusError>) {
    if let Err(e) = result {
        warn!(error = %e, "Status update failed ({what})");
    }
}

/// Drives jobs from the store through the adapter.
pub struct Daemon<A> {
    store: Arc<JobStore>,
    reporter: StatusReporter,
    adapter: A,
    settings: DaemonSettings,
    counters: DispatchCounters,
}

impl<A: AutomationAdapter> Daemon<A> {
    pub fn new(
        store: Arc<JobStore>,
        reporter: StatusReporter,
        adapter: A,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            store,
            reporter,
            adapter,
            settings,
            counters: DispatchCounters::default(),
        }
    }

    /// Runs until `cancel` fires.
    ///
    /// Counters restart at zero. An in-flight adapter call is always awaited;
    /// cancellation only interrupts the pauses around it. The snapshot is
    /// marked not running before returning, also on error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<DispatchCounters, StoreError> {
        self.counters = DispatchCounters::default();
        best_effort("start", self.reporter.mark_started());
        info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            status_file = %self.reporter.path().display(),
            "Daemon started"
        );

        let result = self.run_loop(cancel).await;

        best_effort("stop", self.reporter.mark_stopped());
        match &result {
            Ok(counters) => info!(
                dispatched = counters.total(),
                processed = counters.processed,
                failed = counters.failed,
                "Daemon stopped"
            ),
            Err(e) => error!(error = %e, "Daemon stopped after repeated store failures"),
        }
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<DispatchCounters, StoreError> {
        let mut consecutive_failures = 0u32;

        while !cancel.is_cancelled() {
            match self.drain_planned(cancel).await {
                Ok(0) => {
                    consecutive_failures = 0;
                    debug!("No planned jobs, sleeping");
                }
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        "Job store unavailable, cycle aborted"
                    );
                    let limit = self.settings.max_store_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        return Err(e);
                    }
                }
            }

            if !pause(cancel, self.settings.poll_interval).await {
                break;
            }
        }

        Ok(self.counters)
    }

    /// Dispatches every job that was planned when the batch was read.
    /// Jobs planned meanwhile wait for the next pass.
    async fn drain_planned(&mut self, cancel: &CancellationToken) -> Result<usize, StoreError> {
        let batch = self.store.list_planned()?;
        if batch.is_empty() {
            return Ok(0);
        }
        info!(count = batch.len(), "Found planned jobs");

        let mut dispatched = 0;
        for job in &batch {
            if cancel.is_cancelled() {
                break;
            }
            let report = self.dispatch(job).await?;
            self.record(&report);
            dispatched += 1;

            if !pause(cancel, self.settings.job_pause).await {
                break;
            }
        }
        Ok(dispatched)
    }

    fn record(&mut self, report: &DispatchReport) {
        if report.succeeded() {
            self.counters.processed += 1;
        } else {
            self.counters.failed += 1;
        }
        best_effort(
            "counts",
            self.reporter
                .record_counts(self.counters.processed, self.counters.failed),
        );
    }

    /// Processes the oldest planned job, if any, and returns.
    ///
    /// Run counters in the snapshot belong to the continuous daemon and are
    /// left alone.
    pub async fn process_one(&mut self) -> Result<RunOutcome, StoreError> {
        let Some(job) = self.store.list_by_state(JobState::Planned, Some(1))?.pop() else {
            info!("No planned jobs to process");
            return Ok(RunOutcome::Idle);
        };
        let report = self.dispatch(&job).await?;
        Ok(RunOutcome::Processed(report))
    }

    /// Runs one job through the adapter and records its terminal state.
    ///
    /// Adapter failures of any kind end in `failed`; only store errors are
    /// returned. The current job is cleared from the snapshot either way.
    async fn dispatch(&self, job: &Job) -> Result<DispatchReport, StoreError> {
        debug_assert!(job.state.can_transition_to(JobState::Processing));
        let started = Instant::now();

        self.store.transition(job.id, JobState::Processing, None)?;
        best_effort("current job", self.reporter.set_current(job.id, &job.title));
        info!(job_id = job.id, title = %job.preview_title(LOG_TITLE_CHARS), "Processing job");

        let (state, output_path, reason) =
            match self.adapter.process(&RenderRequest::from(job)).await {
                Ok(AdapterOutcome::Produced(path)) => (JobState::Downloaded, Some(path), None),
                Ok(AdapterOutcome::Failed(reason)) => (JobState::Failed, None, Some(reason)),
                Err(e) => (JobState::Failed, None, Some(e.to_string())),
            };
        debug_assert!(state.is_terminal());

        let written = self
            .store
            .transition(job.id, state, output_path.as_deref());
        best_effort("clear job", self.reporter.clear_current());
        written?;

        let report = DispatchReport {
            job_id: job.id,
            title: job.title.clone(),
            state,
            output_path,
            reason,
            elapsed: started.elapsed(),
        };
        match (&report.output_path, &report.reason) {
            (Some(path), _) => info!(
                job_id = job.id,
                output = %path.display(),
                elapsed_secs = report.elapsed.as_secs(),
                "Video exported"
            ),
            (None, reason) => error!(
                job_id = job.id,
                reason = reason.as_deref().unwrap_or("unknown"),
                "Video job failed"
            ),
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::error::AdapterError;

    type Respond = Box<dyn Fn(&RenderRequest) -> Result<AdapterOutcome, AdapterError> + Send + Sync>;

    /// Records every call, answers through `respond` and cancels the run
    /// once `stop_after` calls have been made.
    struct MockAdapter {
        calls: Mutex<Vec<i64>>,
        respond: Respond,
        cancel: CancellationToken,
        stop_after: usize,
        // Runs during each call, with the store as the daemon left it.
        during: Option<Box<dyn Fn(&RenderRequest) + Send + Sync>>,
    }

    impl MockAdapter {
        fn new(cancel: &CancellationToken, stop_after: usize, respond: Respond) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond,
                cancel: cancel.clone(),
                stop_after,
                during: None,
            }
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AutomationAdapter for MockAdapter {
        async fn process(&self, request: &RenderRequest) -> Result<AdapterOutcome, AdapterError> {
            let seen = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(request.job_id);
                calls.len()
            };
            if let Some(during) = &self.during {
                during(request);
            }
            if seen >= self.stop_after {
                self.cancel.cancel();
            }
            (self.respond)(request)
        }
    }

    fn produce(request: &RenderRequest) -> Result<AdapterOutcome, AdapterError> {
        Ok(AdapterOutcome::Produced(PathBuf::from(format!(
            "/out/{}.mp4",
            request.job_id
        ))))
    }

    fn settings() -> DaemonSettings {
        DaemonSettings {
            poll_interval: Duration::from_millis(1),
            job_pause: Duration::from_millis(1),
            max_store_failures: 3,
        }
    }

    fn setup(
        jobs: &[(i64, &str, &str)],
        adapter: MockAdapter,
    ) -> (tempfile::TempDir, Arc<JobStore>, Daemon<MockAdapter>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(&dir.path().join("database.db")).unwrap());
        for &(id, title, script) in jobs {
            store.insert_planned(id, title, script);
        }
        let reporter = StatusReporter::new(dir.path().join("status.json"));
        let daemon = Daemon::new(Arc::clone(&store), reporter, adapter, settings());
        (dir, store, daemon)
    }

    #[tokio::test]
    async fn successful_dispatch_downloads_job() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let (_dir, store, mut daemon) = setup(&[(1, "Intro", "Hello world")], adapter);

        let counters = daemon.run(&cancel).await.unwrap();

        let job = store.get(1).unwrap().unwrap();
        assert_eq!(job.state, JobState::Downloaded);
        assert_eq!(job.output_path, Some(PathBuf::from("/out/1.mp4")));
        assert_eq!(counters, DispatchCounters { processed: 1, failed: 0 });

        let snapshot = daemon.reporter.read();
        assert!(!snapshot.running);
        assert!(snapshot.current_video.is_none());
        assert_eq!(snapshot.processed_count, 1);
        assert_eq!(snapshot.failed_count, 0);
        assert!(snapshot.last_update.is_some());
    }

    #[tokio::test]
    async fn adapter_error_fails_job_and_loop_continues() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(
            &cancel,
            2,
            Box::new(|request: &RenderRequest| {
                if request.job_id == 2 {
                    Err(AdapterError::Io(std::io::Error::other("export dialog never appeared")))
                } else {
                    produce(request)
                }
            }),
        );
        let (_dir, store, mut daemon) =
            setup(&[(2, "Broken", "..."), (3, "Next", "...")], adapter);

        let counters = daemon.run(&cancel).await.unwrap();

        let failed = store.get(2).unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.output_path, None);
        assert_eq!(store.get(3).unwrap().unwrap().state, JobState::Downloaded);
        assert_eq!(counters, DispatchCounters { processed: 1, failed: 1 });

        let snapshot = daemon.reporter.read();
        assert_eq!(snapshot.failed_count, 1);
        assert_eq!(snapshot.processed_count, 1);
    }

    #[tokio::test]
    async fn failed_outcome_is_not_retried() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(
            &cancel,
            1,
            Box::new(|_: &RenderRequest| Ok(AdapterOutcome::Failed("no file".into()))),
        );
        let (_dir, store, mut daemon) = setup(&[(1, "Intro", "Hello")], adapter);

        daemon.run(&cancel).await.unwrap();

        assert_eq!(store.get(1).unwrap().unwrap().state, JobState::Failed);
        assert_eq!(daemon.adapter.calls(), vec![1]);
        assert_eq!(daemon.counters.failed, 1);
    }

    #[tokio::test]
    async fn dispatches_in_ascending_id_order() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, 3, Box::new(produce));
        let (_dir, _store, mut daemon) =
            setup(&[(3, "c", ""), (1, "a", ""), (2, "b", "")], adapter);

        let counters = daemon.run(&cancel).await.unwrap();

        assert_eq!(daemon.adapter.calls(), vec![1, 2, 3]);
        assert_eq!(counters.total(), 3);
    }

    #[tokio::test]
    async fn only_one_job_processing_during_dispatch() {
        let cancel = CancellationToken::new();
        let mut adapter = MockAdapter::new(&cancel, 3, Box::new(produce));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(&dir.path().join("database.db")).unwrap());
        for id in 1..=3 {
            store.insert_planned(id, "clip", "");
        }

        let observed = Arc::new(Mutex::new(Vec::new()));
        let (probe_store, probe_seen) = (Arc::clone(&store), Arc::clone(&observed));
        adapter.during = Some(Box::new(move |request: &RenderRequest| {
            let counts = probe_store.count_by_state().unwrap();
            let state = probe_store.get(request.job_id).unwrap().unwrap().state;
            probe_seen.lock().unwrap().push((counts.processing, state));
        }));

        let reporter = StatusReporter::new(dir.path().join("status.json"));
        let mut daemon = Daemon::new(Arc::clone(&store), reporter, adapter, settings());
        daemon.run(&cancel).await.unwrap();

        let observed = observed.lock().unwrap().clone();
        assert_eq!(observed.len(), 3);
        for (processing, state) in observed {
            assert_eq!(processing, 1);
            assert_eq!(state, JobState::Processing);
        }
        assert_eq!(store.count_by_state().unwrap().downloaded, 3);
    }

    #[tokio::test]
    async fn snapshot_shows_current_job_while_processing() {
        let cancel = CancellationToken::new();
        let mut adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("status.json");

        let seen = Arc::new(Mutex::new(None));
        let (probe_path, probe_seen) = (status_path.clone(), Arc::clone(&seen));
        adapter.during = Some(Box::new(move |_: &RenderRequest| {
            *probe_seen.lock().unwrap() = Some(StatusReporter::new(&probe_path).read());
        }));

        let store = Arc::new(JobStore::open(&dir.path().join("database.db")).unwrap());
        store.insert_planned(7, "Intro", "Hello");
        let mut daemon = Daemon::new(store, StatusReporter::new(&status_path), adapter, settings());
        daemon.run(&cancel).await.unwrap();

        let during = seen.lock().unwrap().clone().unwrap();
        assert!(during.running);
        let current = during.current_video.unwrap();
        assert_eq!((current.id, current.title.as_str()), (7, "Intro"));
        assert!(daemon.reporter.read().current_video.is_none());
    }

    #[tokio::test]
    async fn jobs_planned_mid_batch_wait_for_next_pass() {
        let cancel = CancellationToken::new();
        let mut adapter = MockAdapter::new(&cancel, 3, Box::new(produce));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(&dir.path().join("database.db")).unwrap());
        store.insert_planned(1, "a", "");
        store.insert_planned(2, "b", "");

        let probe_store = Arc::clone(&store);
        adapter.during = Some(Box::new(move |request: &RenderRequest| {
            if request.job_id == 1 {
                probe_store.insert_planned(0, "late", "");
            }
        }));

        let reporter = StatusReporter::new(dir.path().join("status.json"));
        let mut daemon = Daemon::new(Arc::clone(&store), reporter, adapter, settings());
        daemon.run(&cancel).await.unwrap();

        // Job 0 has the lowest id but was not part of the first batch.
        assert_eq!(daemon.adapter.calls(), vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn counters_reset_on_each_start() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let (_dir, _store, mut daemon) = setup(&[(1, "a", "")], adapter);
        daemon.reporter.record_counts(7, 4).unwrap();

        daemon.run(&cancel).await.unwrap();

        let snapshot = daemon.reporter.read();
        assert_eq!(snapshot.processed_count + snapshot.failed_count, 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let (_dir, store, mut daemon) = setup(&[(1, "a", "")], adapter);

        let counters = daemon.run(&cancel).await.unwrap();

        assert_eq!(counters.total(), 0);
        assert!(daemon.adapter.calls().is_empty());
        assert_eq!(store.get(1).unwrap().unwrap().state, JobState::Planned);
        assert!(!daemon.reporter.read().running);
    }

    #[tokio::test]
    async fn idle_loop_keeps_polling_until_cancelled() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let (_dir, store, mut daemon) = setup(&[], adapter);

        let late = Arc::clone(&store);
        let stopper = cancel.clone();
        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            late.insert_planned(5, "late arrival", "");
            // Safety net in case the job is never picked up.
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let counters = daemon.run(&cancel).await.unwrap();
        feeder.abort();

        assert_eq!(daemon.adapter.calls(), vec![5]);
        assert_eq!(counters.processed, 1);
    }

    #[tokio::test]
    async fn repeated_store_failures_stop_the_daemon() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let (_dir, store, mut daemon) = setup(&[], adapter);
        store.execute_raw("DROP TABLE videos");

        let err = daemon.run(&cancel).await.unwrap_err();

        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(!daemon.reporter.read().running);
    }

    #[tokio::test]
    async fn store_outage_is_retried_on_next_poll() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, 1, Box::new(produce));
        let (_dir, store, mut daemon) = setup(&[], adapter);
        // A second outage would end the run if one recovered cycle did not
        // reset the failure count.
        daemon.settings = DaemonSettings {
            poll_interval: Duration::from_millis(50),
            job_pause: Duration::from_millis(1),
            max_store_failures: 2,
        };
        store.execute_raw("ALTER TABLE videos RENAME TO videos_offline");

        let flaky = Arc::clone(&store);
        let stopper = cancel.clone();
        let outages = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flaky.execute_raw("ALTER TABLE videos_offline RENAME TO videos");
            tokio::time::sleep(Duration::from_millis(50)).await;
            flaky.execute_raw("ALTER TABLE videos RENAME TO videos_offline");
            tokio::time::sleep(Duration::from_millis(50)).await;
            flaky.execute_raw("ALTER TABLE videos_offline RENAME TO videos");
            flaky.insert_planned(7, "after outage", "");
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let counters = daemon.run(&cancel).await.unwrap();
        outages.abort();

        assert_eq!(daemon.adapter.calls(), vec![7]);
        assert_eq!(counters, DispatchCounters { processed: 1, failed: 0 });
        assert_eq!(store.get(7).unwrap().unwrap().state, JobState::Downloaded);
    }

    #[tokio::test]
    async fn unwritable_status_file_does_not_stop_dispatch() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(
            &cancel,
            2,
            Box::new(|request: &RenderRequest| {
                if request.job_id == 2 {
                    Ok(AdapterOutcome::Failed("export dialog missing".into()))
                } else {
                    produce(request)
                }
            }),
        );
        let (dir, store, mut daemon) = setup(&[(1, "a", ""), (2, "b", "")], adapter);
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        daemon.reporter = StatusReporter::new(blocker.join("status.json"));

        let counters = daemon.run(&cancel).await.unwrap();

        assert_eq!(counters, DispatchCounters { processed: 1, failed: 1 });
        assert_eq!(store.get(1).unwrap().unwrap().state, JobState::Downloaded);
        assert_eq!(store.get(2).unwrap().unwrap().state, JobState::Failed);
        assert!(!blocker.join("status.json").exists());
    }

    #[tokio::test]
    async fn process_one_handles_oldest_job_only() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, usize::MAX, Box::new(produce));
        let (_dir, store, mut daemon) = setup(&[(4, "d", ""), (2, "b", "")], adapter);

        let outcome = daemon.process_one().await.unwrap();

        match outcome {
            RunOutcome::Processed(report) => {
                assert_eq!(report.job_id, 2);
                assert!(report.succeeded());
                assert_eq!(report.output_path.as_deref(), Some(Path::new("/out/2.mp4")));
                assert!(report.reason.is_none());
            }
            RunOutcome::Idle => panic!("expected a processed job"),
        }
        assert_eq!(store.get(4).unwrap().unwrap().state, JobState::Planned);

        let snapshot = daemon.reporter.read();
        assert_eq!(snapshot.processed_count, 0);
        assert!(snapshot.current_video.is_none());
    }

    #[tokio::test]
    async fn process_one_reports_failure_reason() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(
            &cancel,
            usize::MAX,
            Box::new(|_: &RenderRequest| Err(AdapterError::TimedOut(Duration::from_secs(900)))),
        );
        let (_dir, store, mut daemon) = setup(&[(1, "a", "")], adapter);

        let RunOutcome::Processed(report) = daemon.process_one().await.unwrap() else {
            panic!("expected a processed job");
        };
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(
            report.reason.as_deref(),
            Some("Automation did not finish within 900s")
        );
        assert_eq!(store.get(1).unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn process_one_on_empty_queue_is_idle() {
        let cancel = CancellationToken::new();
        let adapter = MockAdapter::new(&cancel, usize::MAX, Box::new(produce));
        let (_dir, _store, mut daemon) = setup(&[], adapter);

        assert_eq!(daemon.process_one().await.unwrap(), RunOutcome::Idle);
        assert!(daemon.adapter.calls().is_empty());
    }
}
