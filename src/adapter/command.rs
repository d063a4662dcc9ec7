//! Adapter that shells out to an external automation driver.
//!
//! The driver program does the actual UI work against the video
//! application. It receives the job through environment variables and
//! `{id}` / `{output}` placeholders in its arguments, and is expected to
//! export the video to the requested output path. Whether the export
//! finished is decided afterwards by a [`CompletionStrategy`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::completion::{CompletionRule, CompletionStrategy};
use super::{AdapterOutcome, AutomationAdapter, RenderRequest};
use crate::config::AdapterConfig;
use crate::error::AdapterError;

const SAFE_TITLE_CHARS: usize = 20;
const STDERR_TAIL_CHARS: usize = 400;

/// `video_{id}_{title}.mp4`, keeping the first 20 title characters with every
/// non-alphanumeric character replaced by `_`.
pub fn output_file_name(job_id: i64, title: &str) -> String {
    let safe_title: String = title
        .chars()
        .take(SAFE_TITLE_CHARS)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("video_{job_id}_{safe_title}.mp4")
}

fn expand_arg(arg: &str, request: &RenderRequest, output: &Path) -> String {
    arg.replace("{id}", &request.job_id.to_string())
        .replace("{output}", &output.to_string_lossy())
}

/// Deletes a file left at `output` by an earlier attempt, so completion
/// checks only see what this run exported.
async fn remove_stale_output(output: &Path) -> Result<(), AdapterError> {
    match tokio::fs::remove_file(output).await {
        Ok(()) => {
            warn!(path = %output.display(), "Removed stale export from earlier attempt");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AdapterError::Io(e)),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    text.chars().skip(skip).collect()
}

/// Runs the configured driver command once per job.
#[derive(Debug, Clone)]
pub struct CommandAdapter<C = CompletionRule> {
    program: PathBuf,
    args: Vec<String>,
    app_path: Option<PathBuf>,
    output_dir: PathBuf,
    launch_timeout: Duration,
    completion: C,
}

impl CommandAdapter<CompletionRule> {
    pub fn from_config(adapter: &AdapterConfig, output_dir: &Path) -> Self {
        Self::new(adapter, output_dir, adapter.completion_rule())
    }
}

impl<C> CommandAdapter<C> {
    pub fn new(adapter: &AdapterConfig, output_dir: &Path, completion: C) -> Self {
        Self {
            program: adapter.command.clone(),
            args: adapter.args.clone(),
            app_path: adapter.app_path.clone(),
            output_dir: output_dir.to_path_buf(),
            launch_timeout: Duration::from_secs(adapter.launch_timeout_secs),
            completion,
        }
    }

    /// Where the export for `request` is expected to land.
    pub fn output_path_for(&self, request: &RenderRequest) -> PathBuf {
        self.output_dir
            .join(output_file_name(request.job_id, &request.title))
    }
}

impl<C: CompletionStrategy + Sync> AutomationAdapter for CommandAdapter<C> {
    async fn process(&self, request: &RenderRequest) -> Result<AdapterOutcome, AdapterError> {
        if let Some(app) = self.app_path.as_ref().filter(|app| !app.exists()) {
            return Err(AdapterError::ApplicationMissing(app.clone()));
        }
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let output = self.output_path_for(request);
        remove_stale_output(&output).await?;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| expand_arg(arg, request, &output))
            .collect();

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .env("AUTOVIDEO_JOB_ID", request.job_id.to_string())
            .env("AUTOVIDEO_TITLE", &request.title)
            .env("AUTOVIDEO_SCRIPT", &request.script)
            .env("AUTOVIDEO_OUTPUT", &output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(app) = &self.app_path {
            cmd.env("AUTOVIDEO_APP_PATH", app);
        }

        debug!(program = %self.program.display(), ?args, "Launching automation driver");
        let child = cmd.spawn().map_err(|source| AdapterError::Launch {
            program: self.program.clone(),
            source,
        })?;

        // Dropping the child on timeout kills it.
        let finished = tokio::time::timeout(self.launch_timeout, child.wait_with_output())
            .await
            .map_err(|_| AdapterError::TimedOut(self.launch_timeout))??;

        if !finished.status.success() {
            let tail = stderr_tail(&finished.stderr);
            warn!(job_id = request.job_id, status = %finished.status, "Automation driver failed");
            return Ok(AdapterOutcome::Failed(format!(
                "automation driver exited with {}: {tail}",
                finished.status
            )));
        }

        info!(job_id = request.job_id, output = %output.display(), "Waiting for export to complete");
        if self.completion.wait_for(&output).await {
            Ok(AdapterOutcome::Produced(output))
        } else {
            Ok(AdapterOutcome::Failed(format!(
                "export did not produce {}",
                output.display()
            )))
        }
    }
}
