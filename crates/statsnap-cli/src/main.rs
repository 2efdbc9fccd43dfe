//! statsnap - statistics snapshot runs, backfills and trend reports

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::info;

use commands::Runtime;
use statsnap_common::init_logging;
use statsnap_config::ConfigLoader;
use statsnap_jobs::BackfillRequest;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level or filter directive, overriding the configuration
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute every snapshot type for the last complete window of each period
    Snapshot {
        /// Period to compute (daily, weekly, monthly); repeatable
        #[arg(long = "period", value_name = "PERIOD")]
        periods: Vec<String>,

        /// Retries per snapshot after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Recompute snapshots that already exist
        #[arg(long)]
        force: bool,
    },

    /// Recompute daily snapshots over a historical date range
    Backfill {
        /// Snapshot type (overview, posts, users, popular, all)
        snapshot_type: Option<String>,

        /// First day, YYYY-MM-DD
        start_date: Option<String>,

        /// Last day, YYYY-MM-DD; must be before today
        end_date: Option<String>,

        /// Recompute days that already have snapshots
        #[arg(long)]
        force: bool,

        /// Days per task
        #[arg(long)]
        batch_size: Option<usize>,

        /// Print the task plan without computing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete snapshots past their expiry
    Clean {
        /// Purge snapshots expired before this day instead of now
        #[arg(long, value_name = "DATE")]
        before: Option<String>,
    },

    /// Print one stored snapshot
    Show {
        snapshot_type: String,
        /// daily, weekly or monthly
        period: String,
        /// Any day inside the period, YYYY-MM-DD
        date: String,
    },

    /// Compare a snapshot with the one for the preceding period
    Trends {
        snapshot_type: String,
        /// daily, weekly or monthly
        period: String,
        /// Any day inside the period, YYYY-MM-DD
        date: String,

        /// Also analyze each metric over this many most recent snapshots
        #[arg(long, default_value_t = 0)]
        history: usize,
    },
}

impl Command {
    fn needs_activity(&self) -> bool {
        matches!(self, Command::Snapshot { .. } | Command::Backfill { .. })
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_config(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(config.logging.to_logging_config()).context("Failed to initialize logging")?;
    info!(command = ?cli.command, "Starting statsnap");

    let default_batch_size = config.backfill.default_batch_size;
    let runtime = Runtime::open(config, cli.command.needs_activity())?;

    match cli.command {
        Command::Snapshot {
            periods,
            max_retries,
            force,
        } => commands::snapshot(&runtime, periods, max_retries, force).await,
        Command::Backfill {
            snapshot_type,
            start_date,
            end_date,
            force,
            batch_size,
            dry_run,
        } => {
            let request = BackfillRequest {
                snapshot_type,
                start_date,
                end_date,
                force,
                batch_size: batch_size.unwrap_or(default_batch_size),
                dry_run,
            };
            commands::backfill(&runtime, request).await
        }
        Command::Clean { before } => commands::clean(&runtime, before).await,
        Command::Show {
            snapshot_type,
            period,
            date,
        } => commands::show(&runtime, &snapshot_type, &period, &date).await,
        Command::Trends {
            snapshot_type,
            period,
            date,
            history,
        } => commands::trends(&runtime, &snapshot_type, &period, &date, history).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_snapshot_periods() {
        let cli = Cli::parse_from([
            "statsnap", "snapshot", "--period", "daily", "--period", "weekly", "--max-retries", "3",
        ]);
        match cli.command {
            Command::Snapshot {
                periods,
                max_retries,
                force,
            } => {
                assert_eq!(periods, vec!["daily", "weekly"]);
                assert_eq!(max_retries, Some(3));
                assert!(!force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_backfill_positionals() {
        let cli = Cli::parse_from([
            "statsnap", "backfill", "overview", "2023-01-01", "2023-01-03", "--batch-size", "1",
            "--dry-run",
        ]);
        match cli.command {
            Command::Backfill {
                snapshot_type,
                start_date,
                end_date,
                batch_size,
                dry_run,
                ..
            } => {
                assert_eq!(snapshot_type.as_deref(), Some("overview"));
                assert_eq!(start_date.as_deref(), Some("2023-01-01"));
                assert_eq!(end_date.as_deref(), Some("2023-01-03"));
                assert_eq!(batch_size, Some(1));
                assert!(dry_run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
