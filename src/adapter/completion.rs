use std::future::Future;
use std::path::Path;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

/// Decides whether an export finished and left a file at the expected path.
pub trait CompletionStrategy {
    fn wait_for(&self, output: &Path) -> impl Future<Output = bool> + Send;
}

/// Sleeps for a fixed time, then checks that the file exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub wait: Duration,
}

impl CompletionStrategy for FixedDelay {
    async fn wait_for(&self, output: &Path) -> bool {
        sleep(self.wait).await;
        tokio::fs::try_exists(output).await.unwrap_or(false)
    }
}

/// Polls until the file exists with a non-zero size that stayed the same
/// across two consecutive polls, or until `timeout` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSettled {
    pub timeout: Duration,
    pub interval: Duration,
}

impl CompletionStrategy for FileSettled {
    async fn wait_for(&self, output: &Path) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut last_size: Option<u64> = None;

        loop {
            let size = tokio::fs::metadata(output).await.ok().map(|m| m.len());
            match (last_size, size) {
                (Some(prev), Some(cur)) if prev == cur && cur > 0 => return true,
                _ => {}
            }
            last_size = size;

            if Instant::now() >= deadline {
                debug!(path = %output.display(), size = ?size, "Output did not settle before timeout");
                return false;
            }
            sleep(self.interval).await;
        }
    }
}

/// Strategy chosen at runtime from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionRule {
    FixedDelay(FixedDelay),
    Settled(FileSettled),
}

impl CompletionStrategy for CompletionRule {
    async fn wait_for(&self, output: &Path) -> bool {
        match self {
            CompletionRule::FixedDelay(rule) => rule.wait_for(output).await,
            CompletionRule::Settled(rule) => rule.wait_for(output).await,
        }
    }
}
