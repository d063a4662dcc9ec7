//! Command-line interface built on clap.
//!
//! Three operating modes share the same store and status file: the
//! continuous daemon, a single-shot run and a status query. `requeue` is the
//! operator's way to give a failed job another attempt.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Queue daemon that turns planned video jobs into exported videos.
#[derive(Debug, Parser)]
#[command(name = "autovideo", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./autovideo.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database holding the job table.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Status snapshot file.
    #[arg(long, global = true)]
    pub status_file: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Polls for planned jobs and processes them until interrupted.
    Daemon,

    /// Processes the oldest planned job and exits (exit code 2 if none).
    ProcessOne,

    /// Shows the status snapshot and the pending jobs.
    Status {
        /// Number of pending jobs to list.
        #[arg(long)]
        limit: Option<usize>,

        /// Prints the report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Moves a failed job back to planned.
    Requeue {
        /// Job id.
        id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_daemon_subcommand() {
        let cli = Cli::parse_from(["autovideo", "daemon"]);
        assert!(matches!(cli.command, Command::Daemon));
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_parses_process_one() {
        let cli = Cli::parse_from(["autovideo", "process-one", "--db", "jobs.db"]);
        assert!(matches!(cli.command, Command::ProcessOne));
        assert_eq!(cli.db, Some(PathBuf::from("jobs.db")));
    }

    #[test]
    fn cli_parses_status_flags() {
        let cli = Cli::parse_from(["autovideo", "status", "--limit", "10", "--json"]);
        match cli.command {
            Command::Status { limit, json } => {
                assert_eq!(limit, Some(10));
                assert!(json);
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "autovideo",
            "--config",
            "prod.toml",
            "--status-file",
            "/tmp/status.json",
            "--verbose",
            "requeue",
            "12",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("prod.toml")));
        assert_eq!(cli.status_file, Some(PathBuf::from("/tmp/status.json")));
        assert!(matches!(cli.command, Command::Requeue { id: 12 }));
    }

    #[test]
    fn cli_rejects_non_numeric_id() {
        assert!(Cli::try_parse_from(["autovideo", "requeue", "abc"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
