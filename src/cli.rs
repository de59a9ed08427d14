//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use caseharvest_core::AppConfig;
use caseharvest_core::listing::parse_date;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Collect newly filed cases and download their complaints.
///
/// Each stage can run on its own (`collect`, then `download`) or together
/// (`run`). Settings come from `caseharvest.toml`, `.env` and `CASEHARVEST_*`
/// environment variables; the flags below override them.
#[derive(Parser, Debug)]
#[command(name = "caseharvest")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file (default: ./caseharvest.toml when present)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Maximum listing pages to walk (1-1000)
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub max_pages: Option<u32>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, global = true, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub max_retries: Option<u32>,

    /// First filing date to search (MM/DD/YYYY or YYYY-MM-DD; default: --date-to)
    #[arg(long, global = true, value_parser = parse_date)]
    pub date_from: Option<NaiveDate>,

    /// Last filing date to search (MM/DD/YYYY or YYYY-MM-DD; default: today)
    #[arg(long, global = true, value_parser = parse_date)]
    pub date_to: Option<NaiveDate>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Walk the listing and queue new cases without downloading
    Collect,

    /// Download complaints for queued cases
    Download {
        /// Process at most this many cases
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        limit: Option<u32>,
    },

    /// Collect and download in one pass
    Run,

    /// Inspect the processed-case ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum LedgerAction {
    /// Print every processed case id, sorted
    Show,

    /// Exit 0 when the case id is in the ledger, 1 otherwise
    Contains {
        /// Case id, e.g. "CA Superior|24-CV-001"
        case_id: String,
    },
}

impl Args {
    /// Default log level from the verbosity flags.
    #[must_use]
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Writes flag values over the loaded configuration.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(max_pages) = self.max_pages {
            config.walk.max_pages = max_pages;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
    }
}
