mod adapter;
mod cli;
mod commands;
mod config;
mod daemon;
mod error;
mod logging;
mod queue;
mod report;
mod status;
mod ui;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use commands::CommandStatus;
use config::AutomationConfig;
use tracing::error;

const EXIT_IDLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AutomationConfig::load(cli.config.as_deref()) {
        Ok(config) => config.with_overrides(cli.db, cli.status_file),
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Only the modes that touch jobs append to the log file that `status` tails.
    let log_file = match cli.command {
        Command::Daemon | Command::ProcessOne => Some(config.log_path.as_path()),
        Command::Status { .. } | Command::Requeue { .. } => None,
    };
    let _guard = match logging::init(&config.log_level, cli.verbose, log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, &config).await {
        Ok(CommandStatus::Done) => ExitCode::SUCCESS,
        Ok(CommandStatus::Idle) => ExitCode::from(EXIT_IDLE),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &AutomationConfig) -> Result<CommandStatus> {
    match command {
        Command::Daemon => commands::run_daemon(config).await,
        Command::ProcessOne => commands::process_one(config).await,
        Command::Status { limit, json } => commands::show_status(config, limit, json),
        Command::Requeue { id } => commands::requeue(config, id),
    }
}
