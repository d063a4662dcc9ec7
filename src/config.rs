//! Configuration loaded from `autovideo.toml`.
//!
//! [`AutomationConfig`] holds every tunable of the daemon. Values absent from
//! the file fall back to defaults. `AUTOVIDEO_APP_PATH` overrides the
//! application path, and CLI flags override the database and status paths.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapter::{CompletionRule, FileSettled, FixedDelay};

const DEFAULT_CONFIG_FILE: &str = "autovideo.toml";
const APP_PATH_ENV: &str = "AUTOVIDEO_APP_PATH";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    /// SQLite database holding the `videos` table.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// JSON status snapshot read by monitoring tools.
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,

    /// Log file written by `daemon` and `process-one`, tailed by `status`.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Directory exported videos are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between polls when the queue is empty or drained.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds to pause between two jobs.
    #[serde(default = "default_job_pause_secs")]
    pub job_pause_secs: u64,

    /// Consecutive failed cycles before the daemon gives up; 0 retries forever.
    #[serde(default = "default_max_store_failures")]
    pub max_store_failures: u32,

    /// Number of pending jobs listed by `status`.
    #[serde(default = "default_pending_preview")]
    pub pending_preview: usize,

    #[serde(default)]
    pub adapter: AdapterConfig,
}

/// How completion of an export is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    /// Wait `export_wait_secs`, then check the file exists.
    Fixed,
    /// Poll until the file size settles, up to `settle_timeout_secs`.
    Settled,
}

/// Settings for the external automation driver.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    /// Installed video application; checked before the daemon starts.
    #[serde(default)]
    pub app_path: Option<PathBuf>,

    #[serde(default = "default_command")]
    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,

    #[serde(default = "default_completion")]
    pub completion: CompletionKind,

    #[serde(default = "default_export_wait_secs")]
    pub export_wait_secs: u64,

    #[serde(default = "default_settle_timeout_secs")]
    pub settle_timeout_secs: u64,

    #[serde(default = "default_settle_interval_secs")]
    pub settle_interval_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("database.db")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("output/automation_status.json")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("output/automation.log")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output/videos")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_job_pause_secs() -> u64 {
    5
}

fn default_max_store_failures() -> u32 {
    10
}

fn default_pending_preview() -> usize {
    5
}

fn default_command() -> PathBuf {
    PathBuf::from("video-automation")
}

fn default_launch_timeout_secs() -> u64 {
    900
}

fn default_completion() -> CompletionKind {
    CompletionKind::Settled
}

fn default_export_wait_secs() -> u64 {
    60
}

fn default_settle_timeout_secs() -> u64 {
    600
}

fn default_settle_interval_secs() -> u64 {
    5
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            app_path: None,
            command: default_command(),
            args: Vec::new(),
            launch_timeout_secs: default_launch_timeout_secs(),
            completion: default_completion(),
            export_wait_secs: default_export_wait_secs(),
            settle_timeout_secs: default_settle_timeout_secs(),
            settle_interval_secs: default_settle_interval_secs(),
        }
    }
}

impl AdapterConfig {
    pub fn completion_rule(&self) -> CompletionRule {
        match self.completion {
            CompletionKind::Fixed => CompletionRule::FixedDelay(FixedDelay {
                wait: Duration::from_secs(self.export_wait_secs),
            }),
            CompletionKind::Settled => CompletionRule::Settled(FileSettled {
                timeout: Duration::from_secs(self.settle_timeout_secs),
                interval: Duration::from_secs(self.settle_interval_secs.max(1)),
            }),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            status_path: default_status_path(),
            log_path: default_log_path(),
            output_dir: default_output_dir(),
            log_level: default_log_level(),
            poll_interval_secs: default_poll_interval_secs(),
            job_pause_secs: default_job_pause_secs(),
            max_store_failures: default_max_store_failures(),
            pending_preview: default_pending_preview(),
            adapter: AdapterConfig::default(),
        }
    }
}

impl AutomationConfig {
    /// Loads `path`, or `autovideo.toml` in the current directory when no path
    /// is given. A missing default file yields the defaults; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        // The environment wins over the file for the application path.
        config.apply_app_path_override(std::env::var(APP_PATH_ENV).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_app_path_override(&mut self, value: Option<String>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.adapter.app_path = Some(PathBuf::from(value));
        }
    }

    /// Applies `--db` and `--status-file` from the command line.
    pub fn with_overrides(mut self, db: Option<PathBuf>, status_file: Option<PathBuf>) -> Self {
        if let Some(db) = db {
            self.db_path = db;
        }
        if let Some(status_file) = status_file {
            self.status_path = status_file;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn job_pause(&self) -> Duration {
        Duration::from_secs(self.job_pause_secs)
    }
}
