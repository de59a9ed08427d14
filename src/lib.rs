//! caseharvest core library
//!
//! Collects newly filed cases from an authenticated case-research platform
//! and stores each case's complaint document exactly once.
//!
//! # Architecture
//!
//! - [`session`] - login, session validity, re-login and cookie persistence
//! - [`listing`] - paginated walk over search results and row extraction
//! - [`ledger`] - durable set of processed case ids and duplicate filtering
//! - [`cases`] - SQLite store of collected cases awaiting download
//! - [`download`] - complaint resolution, fetch and verified upload
//! - [`storage`] - blob store for documents and run state
//! - [`coordinator`] - collect, download and full-run orchestration
//!
//! Supporting modules: [`config`], [`db`], [`retry`], [`snapshot`].

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cases;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod download;
pub mod ledger;
pub mod listing;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod storage;
mod user_agent;

// Re-export commonly used types
pub use cases::{CaseRecord, CaseStatus, CaseStore, CaseStoreError, StoredCase};
pub use config::{AppConfig, ConfigError, Credentials, LedgerBackend, StorageBackend};
pub use coordinator::{
    CoordinatorError, RunCoordinator, RunHalt, RunReport, RunSummary, open_ledger,
};
pub use db::{Database, DbError};
pub use download::{ComplaintDownloader, DownloadResult, DownloadStatus, FetchError};
pub use ledger::{Deduplicator, Ledger, LedgerError, ManifestLedger, SqliteLedger};
pub use listing::{
    ListingParser, ListingWalker, SearchFilters, Walk, WalkError, WalkOutcome, WalkStats,
};
pub use retry::{FailureType, RetryDecision, RetryPolicy};
pub use session::{AuthError, NavigationError, Page, SessionContext, SessionManager};
pub use storage::{DocumentStore, StorageError, StoredDocument};
