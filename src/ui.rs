//! Terminal output: a spinner for single-shot runs and the status report.
//!
//! Uses `indicatif` for the spinner and `console` for colours. Output stays
//! plain when stdout is not a terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::daemon::DispatchReport;
use crate::queue::preview;
use crate::report::StatusReport;

const LIST_TITLE_CHARS: usize = 50;

/// Colours shared by the status report and dispatch results.
struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
    bold: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
            bold: Style::new().bold(),
        }
    }
}

/// Spinner shown while `process-one` waits on the adapter.
pub struct DispatchProgress {
    pb: ProgressBar,
    palette: Palette,
}

impl DispatchProgress {
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            palette: Palette::new(),
        }
    }

    /// Stops the spinner and prints the job's result.
    pub fn finish(&self, report: &DispatchReport) {
        self.pb.finish_and_clear();
        if let Some(path) = &report.output_path {
            println!(
                "  {} [{}] {} → {}",
                self.palette.green.apply_to("✓"),
                report.job_id,
                report.title,
                path.display()
            );
        } else {
            println!(
                "  {} [{}] {}: {}",
                self.palette.red.apply_to("✗"),
                report.job_id,
                report.title,
                report.reason.as_deref().unwrap_or("unknown failure")
            );
        }
    }

    pub fn finish_idle(&self) {
        self.pb.finish_and_clear();
        println!("  {} No planned videos to process", self.palette.yellow.apply_to("–"));
    }
}

/// Planned jobs beyond those listed in the report.
fn unlisted_pending(report: &StatusReport) -> u64 {
    let listed = u64::try_from(report.pending.len()).unwrap_or(u64::MAX);
    report.counts.planned.saturating_sub(listed)
}

/// Prints the human-readable status report.
pub fn print_status(report: &StatusReport) {
    let palette = Palette::new();
    let snapshot = &report.snapshot;

    println!();
    println!("{}", palette.bold.apply_to("=== Automation Status ==="));
    let running = if snapshot.running {
        palette.green.apply_to("yes")
    } else {
        palette.dim.apply_to("no")
    };
    println!("Running:     {running}");
    match snapshot.last_update {
        Some(ts) => println!("Last update: {}", ts.to_rfc3339()),
        None => println!("Last update: {}", palette.dim.apply_to("never")),
    }
    println!("Processed:   {}", palette.green.apply_to(snapshot.processed_count));
    println!("Failed:      {}", palette.red.apply_to(snapshot.failed_count));
    if let Some(current) = &snapshot.current_video {
        println!(
            "Current:     [{}] {}",
            current.id,
            preview(&current.title, LIST_TITLE_CHARS)
        );
    }

    let counts = &report.counts;
    println!();
    println!(
        "Queue: {} jobs ({} planned, {} processing, {} downloaded, {} failed)",
        counts.total(),
        palette.yellow.apply_to(counts.planned),
        counts.processing,
        palette.green.apply_to(counts.downloaded),
        palette.red.apply_to(counts.failed)
    );

    println!();
    println!("{}", palette.bold.apply_to(format!("Pending videos: {}", counts.planned)));
    for job in &report.pending {
        println!("  [{}] {}", job.id, job.preview_title(LIST_TITLE_CHARS));
    }
    let unlisted = unlisted_pending(report);
    if unlisted > 0 {
        println!("  {}", palette.dim.apply_to(format!("… and {unlisted} more")));
    }

    if !report.recent_log.is_empty() {
        println!();
        println!("{}", palette.bold.apply_to("=== Recent Log ==="));
        for line in &report.recent_log {
            println!("{}", palette.dim.apply_to(line));
        }
    }
}

/// Prints the status report as pretty JSON.
pub fn print_status_json(report: &StatusReport) -> serde_json::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
