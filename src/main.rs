//! CLI entry point for caseharvest.

use std::process::ExitCode;

use anyhow::{Context, Result};
use caseharvest_core::{AppConfig, RunCoordinator, RunReport, SearchFilters, open_ledger};
use clap::Parser;
use tracing::{debug, info};

mod cli;

use cli::{Args, Command, LedgerAction};

/// Process outcome, mapped to the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    Failure,
    Partial,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Failure => ExitCode::from(1),
            ProcessExit::Partial => ExitCode::from(2),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    init_tracing(args.default_log_level());
    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(exit) => exit.into(),
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::from(1)
        }
    }
}

/// Priority: `RUST_LOG` > quiet flag > verbose flag > default (info).
fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

async fn run(args: Args) -> Result<ProcessExit> {
    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply_overrides(&mut config);
    config.validate().context("validating command-line overrides")?;

    let filters = SearchFilters::from_config(
        &config.platform,
        &config.walk,
        args.date_from,
        args.date_to,
    );

    let report = match &args.command {
        Command::Ledger { action } => return run_ledger_command(&config, action).await,
        Command::Collect => coordinator(&config).await?.collect(&filters).await?,
        Command::Download { limit } => {
            coordinator(&config)
                .await?
                .download_pending(limit.or(config.run.download_limit))
                .await?
        }
        Command::Run => coordinator(&config).await?.run_once(&filters).await?,
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("rendering run report")?
    );
    Ok(determine_exit_outcome(&report))
}

async fn coordinator(config: &AppConfig) -> Result<RunCoordinator> {
    info!(platform = %config.platform.base_url, "caseharvest starting");
    RunCoordinator::from_config(config)
        .await
        .context("initialising run")
}

async fn run_ledger_command(config: &AppConfig, action: &LedgerAction) -> Result<ProcessExit> {
    let ledger = open_ledger(config).await.context("opening ledger")?;
    match action {
        LedgerAction::Show => {
            let mut ids: Vec<String> = ledger.load().await?.into_iter().collect();
            ids.sort();
            for id in &ids {
                println!("{id}");
            }
            info!(count = ids.len(), "processed cases");
            Ok(ProcessExit::Success)
        }
        LedgerAction::Contains { case_id } => {
            if ledger.contains(case_id).await? {
                println!("processed");
                Ok(ProcessExit::Success)
            } else {
                println!("not processed");
                Ok(ProcessExit::Failure)
            }
        }
    }
}

/// Halted runs fail; otherwise failures with some downloads are partial.
fn determine_exit_outcome(report: &RunReport) -> ProcessExit {
    let summary = &report.summary;
    if !report.is_complete() {
        ProcessExit::Failure
    } else if summary.failed == 0 {
        ProcessExit::Success
    } else if summary.downloaded > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseharvest_core::{RunHalt, RunSummary};

    fn report(downloaded: usize, failed: usize, halted: Option<RunHalt>) -> RunReport {
        RunReport {
            summary: RunSummary {
                downloaded,
                failed,
                ..RunSummary::default()
            },
            halted,
        }
    }

    #[test]
    fn test_exit_outcome_success_when_no_failures() {
        assert_eq!(determine_exit_outcome(&report(3, 0, None)), ProcessExit::Success);
        assert_eq!(determine_exit_outcome(&report(0, 0, None)), ProcessExit::Success);
    }

    #[test]
    fn test_exit_outcome_partial_when_mixed() {
        assert_eq!(determine_exit_outcome(&report(2, 1, None)), ProcessExit::Partial);
    }

    #[test]
    fn test_exit_outcome_failure_when_all_failed() {
        assert_eq!(determine_exit_outcome(&report(0, 2, None)), ProcessExit::Failure);
    }

    #[test]
    fn test_exit_outcome_failure_when_halted() {
        assert_eq!(
            determine_exit_outcome(&report(5, 0, Some(RunHalt::Deadline))),
            ProcessExit::Failure
        );
    }
}
