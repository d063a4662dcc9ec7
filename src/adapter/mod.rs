//! Contract between the daemon and whatever drives the video application.
//!
//! The daemon hands one [`RenderRequest`] at a time to an
//! [`AutomationAdapter`] and waits for it to settle. An adapter reports a
//! produced file or a failure reason; raising an [`AdapterError`] is treated
//! the same as [`AdapterOutcome::Failed`].

mod command;
mod completion;

use std::future::Future;
use std::path::PathBuf;

pub use command::CommandAdapter;
pub use completion::{CompletionRule, FileSettled, FixedDelay};

use crate::error::AdapterError;
use crate::queue::Job;

/// What the adapter needs to render one video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub job_id: i64,
    pub title: String,
    pub script: String,
}

impl From<&Job> for RenderRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            title: job.title.clone(),
            script: job.script.clone(),
        }
    }
}

/// Result of one generation + export attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// The video was exported to this path.
    Produced(PathBuf),
    /// The automation ran but produced nothing usable.
    Failed(String),
}

/// Performs the generation and export workflow for a single job.
///
/// Implementations get exactly one attempt per call and may block for
/// minutes. They are never invoked concurrently by the daemon.
pub trait AutomationAdapter {
    fn process(
        &self,
        request: &RenderRequest,
    ) -> impl Future<Output = Result<AdapterOutcome, AdapterError>> + Send;
}
