//! Run orchestration.
//!
//! A run is one sequential pass: acquire the session, walk the listing,
//! drop cases already in the ledger, download the rest one at a time and
//! commit each verified upload. The two halves are also exposed separately
//! ([`RunCoordinator::collect`] and [`RunCoordinator::download_pending`]) and
//! meet in the SQLite case store.
//!
//! Session loss, a broken walk, an unwritable ledger or case store, or the
//! run deadline end a run early. That is reported through [`RunReport::halted`]; the summary
//! still counts everything finished before the halt.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cases::{CaseRecord, CaseStatus, CaseStore, CaseStoreError};
use crate::config::{AppConfig, ConfigError, LedgerBackend};
use crate::db::{Database, DbError};
use crate::download::{ComplaintDownloader, DownloadResult, DownloadStatus};
use crate::ledger::{Deduplicator, Ledger, LedgerError, ManifestLedger, SqliteLedger};
use crate::listing::{ListingWalker, SearchFilters, WalkError};
use crate::session::{AuthError, SessionManager};
use crate::snapshot;
use crate::storage::{DocumentStore, StorageError};

/// Counters for one run or stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Cases considered: rows yielded by the walk, or pending cases read
    /// from the case store.
    pub scanned: usize,
    /// Cases already in the ledger.
    pub skipped_duplicate: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub not_found: usize,
    /// Cases left alone because they used up their attempts.
    pub skipped_exhausted: usize,
    pub malformed: usize,
    pub filtered_out: usize,
    pub pages: u32,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned={} skipped_duplicate={} downloaded={} not_found={} failed={} \
             skipped_exhausted={} malformed={} filtered_out={} pages={}",
            self.scanned,
            self.skipped_duplicate,
            self.downloaded,
            self.not_found,
            self.failed,
            self.skipped_exhausted,
            self.malformed,
            self.filtered_out,
            self.pages
        )
    }
}

/// Why a run stopped before finishing its work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunHalt {
    /// No session could be established or kept.
    Auth { reason: String },
    /// A results page kept failing.
    Walk { reason: String },
    /// The run timeout expired; no further cases were started.
    Deadline,
    /// A verified upload could not be recorded in the ledger.
    Ledger { reason: String },
    /// A download outcome could not be written to the case store.
    CaseStore { reason: String },
}

impl fmt::Display for RunHalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { reason } => write!(f, "session lost: {reason}"),
            Self::Walk { reason } => write!(f, "listing walk aborted: {reason}"),
            Self::Deadline => write!(f, "run deadline reached"),
            Self::Ledger { reason } => write!(f, "ledger write failed: {reason}"),
            Self::CaseStore { reason } => write!(f, "case store write failed: {reason}"),
        }
    }
}

impl RunHalt {
    fn auth(error: &AuthError) -> Self {
        Self::Auth {
            reason: error.to_string(),
        }
    }

    fn ledger(error: &LedgerError) -> Self {
        Self::Ledger {
            reason: error.to_string(),
        }
    }

    fn case_store(error: &CaseStoreError) -> Self {
        Self::CaseStore {
            reason: error.to_string(),
        }
    }

    fn from_walk(error: &WalkError) -> Self {
        match error {
            WalkError::Auth { .. } => Self::Auth {
                reason: error.to_string(),
            },
            WalkError::PageLoad { .. } => Self::Walk {
                reason: error.to_string(),
            },
        }
    }
}

/// Summary plus the reason the run stopped early, if it did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub halted: Option<RunHalt>,
}

impl RunReport {
    /// True when the run finished all its work.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
    }

    fn halt(&mut self, halt: RunHalt) {
        warn!(reason = %halt, "run halted");
        self.halted = Some(halt);
    }
}

/// Infrastructure failures that make a run impossible to account for.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("session setup failed: {0}")]
    Session(#[from] AuthError),

    #[error(transparent)]
    Cases(#[from] CaseStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Drives collect and download stages over one session.
pub struct RunCoordinator {
    session: SessionManager,
    walker: ListingWalker,
    ledger: Arc<dyn Ledger>,
    downloader: ComplaintDownloader,
    cases: CaseStore,
    max_attempts: u32,
    run_timeout: Option<Duration>,
    snapshot_dir: Option<PathBuf>,
}

impl fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("walker", &self.walker)
            .field("max_attempts", &self.max_attempts)
            .field("run_timeout", &self.run_timeout)
            .field("snapshot_dir", &self.snapshot_dir)
            .finish_non_exhaustive()
    }
}

/// Opens the configured ledger backend.
///
/// # Errors
///
/// Returns [`CoordinatorError`] when the database or blob store cannot be
/// opened.
pub async fn open_ledger(config: &AppConfig) -> Result<Arc<dyn Ledger>, CoordinatorError> {
    let ledger: Arc<dyn Ledger> = match config.ledger.backend {
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::new(
            Database::new(&config.ledger.database_path).await?,
        )),
        LedgerBackend::Manifest => Arc::new(ManifestLedger::new(
            DocumentStore::from_config(&config.storage)?,
            config.ledger.manifest_key.clone(),
        )),
    };
    Ok(ledger)
}

impl RunCoordinator {
    /// Assembles a coordinator from its parts with default limits: five
    /// attempts per case, no deadline, no snapshots.
    #[must_use]
    pub fn new(
        session: SessionManager,
        walker: ListingWalker,
        ledger: Arc<dyn Ledger>,
        downloader: ComplaintDownloader,
        cases: CaseStore,
    ) -> Self {
        Self {
            session,
            walker,
            ledger,
            downloader,
            cases,
            max_attempts: 5,
            run_timeout: None,
            snapshot_dir: None,
        }
    }

    /// Builds every component from configuration. No network request is
    /// made.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] when a component cannot be opened.
    #[instrument(skip(config))]
    pub async fn from_config(config: &AppConfig) -> Result<Self, CoordinatorError> {
        let store = DocumentStore::from_config(&config.storage)?;
        let db = Database::new(&config.ledger.database_path).await?;

        let ledger: Arc<dyn Ledger> = match config.ledger.backend {
            LedgerBackend::Sqlite => Arc::new(SqliteLedger::new(db.clone())),
            LedgerBackend::Manifest => Arc::new(ManifestLedger::new(
                store.clone(),
                config.ledger.manifest_key.clone(),
            )),
        };

        let policy = config.retry.policy();
        let session = SessionManager::new(&config.platform, config.credentials.clone(), policy.clone())?
            .with_state_store(store.clone(), config.storage.session_state_key.clone());
        let walker = ListingWalker::from_config(&config.platform, &config.walk)?;
        let downloader = ComplaintDownloader::new(store, policy);

        debug!(ledger = ?config.ledger.backend, "coordinator assembled");
        Ok(Self::new(session, walker, ledger, downloader, CaseStore::new(db))
            .with_max_attempts(config.run.max_attempts)
            .with_run_timeout(Some(Duration::from_secs(config.run.run_timeout_secs)))
            .with_snapshot_dir(config.run.snapshot_dir.clone()))
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whole-run deadline; `None` disables it.
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Directory for collect snapshots; `None` disables them.
    #[must_use]
    pub fn with_snapshot_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.snapshot_dir = dir;
        self
    }

    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    #[must_use]
    pub fn cases(&self) -> &CaseStore {
        &self.cases
    }

    #[must_use]
    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Collect stage: walk the listing, drop ledger hits and queue the rest
    /// in the case store. Nothing is downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] when the ledger or case store fails.
    #[instrument(skip(self, filters), fields(from = %filters.date_from, to = %filters.date_to))]
    pub async fn collect(&mut self, filters: &SearchFilters) -> Result<RunReport, CoordinatorError> {
        let mut report = RunReport::default();
        if let Err(e) = self.session.acquire().await {
            report.halt(RunHalt::auth(&e));
            return Ok(report);
        }

        let dedup = Deduplicator::load(Arc::clone(&self.ledger)).await?;
        let (fresh, walk_error) = self.walk_new(&dedup, filters, &mut report.summary).await?;

        self.write_snapshot(filters, &fresh);
        if let Some(e) = walk_error {
            report.halt(RunHalt::from_walk(&e));
        }
        info!(summary = %report.summary, "collect finished");
        Ok(report)
    }

    /// Download stage: fetch every pending case in the store, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] when the ledger or case store fails.
    #[instrument(skip(self))]
    pub async fn download_pending(
        &mut self,
        limit: Option<u32>,
    ) -> Result<RunReport, CoordinatorError> {
        let deadline = self.deadline();
        let mut report = RunReport::default();
        if let Err(e) = self.session.acquire().await {
            report.halt(RunHalt::auth(&e));
            return Ok(report);
        }

        let mut dedup = Deduplicator::load(Arc::clone(&self.ledger)).await?;
        let pending = self.cases.pending(limit, self.max_attempts).await?;
        report.summary.scanned = pending.len();
        report.summary.skipped_exhausted =
            usize::try_from(self.cases.count_exhausted(self.max_attempts).await?)
                .unwrap_or(usize::MAX);
        info!(pending = pending.len(), "downloading pending cases");

        for record in &pending {
            if dedup.is_processed(&record.case_id) {
                // Committed elsewhere; drop it from the queue so it stops
                // taking a slot under the limit.
                if let Err(e) = self.cases.mark_processed(&record.case_id).await {
                    report.halt(RunHalt::case_store(&e));
                    break;
                }
                report.summary.skipped_duplicate += 1;
                continue;
            }
            let halt = self
                .process_case(&mut dedup, record, deadline, &mut report.summary)
                .await;
            if let Some(halt) = halt {
                report.halt(halt);
                break;
            }
        }

        info!(summary = %report.summary, "download finished");
        Ok(report)
    }

    /// One full pass: collect and download in a single session.
    ///
    /// Safe to run repeatedly: cases committed by an earlier run are skipped.
    /// When the walk fails, rows it already produced are queued in the case
    /// store and nothing is downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] when the ledger or case store fails.
    #[instrument(skip(self, filters), fields(from = %filters.date_from, to = %filters.date_to))]
    pub async fn run_once(&mut self, filters: &SearchFilters) -> Result<RunReport, CoordinatorError> {
        let deadline = self.deadline();
        let mut report = RunReport::default();
        if let Err(e) = self.session.acquire().await {
            report.halt(RunHalt::auth(&e));
            return Ok(report);
        }

        let mut dedup = Deduplicator::load(Arc::clone(&self.ledger)).await?;
        let (fresh, walk_error) = self.walk_new(&dedup, filters, &mut report.summary).await?;
        self.write_snapshot(filters, &fresh);

        if let Some(e) = walk_error {
            report.halt(RunHalt::from_walk(&e));
            info!(summary = %report.summary, "run finished without downloads");
            return Ok(report);
        }

        for record in &fresh {
            let stored = match self.cases.get(&record.case_id).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    report.halt(RunHalt::case_store(&e));
                    break;
                }
            };
            if stored.status == CaseStatus::Downloaded {
                // Stored earlier but missing from this ledger.
                if let Err(e) = dedup.commit(&record.case_id).await {
                    report.halt(RunHalt::ledger(&e));
                    break;
                }
                report.summary.skipped_duplicate += 1;
                continue;
            }
            if stored.attempt_count >= self.max_attempts {
                debug!(case_id = %record.case_id, attempts = stored.attempt_count, "attempts exhausted");
                report.summary.skipped_exhausted += 1;
                continue;
            }
            let halt = self
                .process_case(&mut dedup, record, deadline, &mut report.summary)
                .await;
            if let Some(halt) = halt {
                report.halt(halt);
                break;
            }
        }

        info!(summary = %report.summary, "run finished");
        Ok(report)
    }

    fn deadline(&self) -> Option<Instant> {
        self.run_timeout.map(|t| Instant::now() + t)
    }

    /// Walks the listing, counts everything, filters against the ledger and
    /// upserts the new rows into the case store.
    async fn walk_new(
        &mut self,
        dedup: &Deduplicator,
        filters: &SearchFilters,
        summary: &mut RunSummary,
    ) -> Result<(Vec<CaseRecord>, Option<WalkError>), CoordinatorError> {
        let outcome = self.walker.walk(&mut self.session, filters).drain().await;

        summary.pages = outcome.stats.pages;
        summary.malformed = outcome.stats.malformed;
        summary.filtered_out = outcome.stats.filtered_out;
        summary.scanned = outcome.records.len();

        let (fresh, skipped) = dedup.filter_new(outcome.records);
        summary.skipped_duplicate += skipped;

        let mut inserted = 0usize;
        for record in &fresh {
            if self.cases.upsert(record).await? {
                inserted += 1;
            }
        }
        info!(
            scanned = summary.scanned,
            new = fresh.len(),
            inserted,
            skipped,
            "listing collected"
        );
        Ok((fresh, outcome.error))
    }

    fn write_snapshot(&self, filters: &SearchFilters, records: &[CaseRecord]) {
        let Some(dir) = &self.snapshot_dir else {
            return;
        };
        match snapshot::write_snapshot(dir, &filters.snapshot_label(), records) {
            Ok(path) => info!(path = %path.display(), rows = records.len(), "snapshot written"),
            Err(e) => warn!(error = %e, "failed to write snapshot"),
        }
    }

    /// Downloads one case and records the outcome. Returns the halt reason
    /// when the run must stop.
    async fn process_case(
        &mut self,
        dedup: &mut Deduplicator,
        record: &CaseRecord,
        deadline: Option<Instant>,
        summary: &mut RunSummary,
    ) -> Option<RunHalt> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(RunHalt::Deadline);
        }

        match self.downloader.fetch(&mut self.session, record).await {
            Ok(result) => self.record_result(dedup, &result, summary).await,
            Err(e) => Some(RunHalt::auth(&e)),
        }
    }

    /// Writes one outcome to the case store, committing successes to the
    /// ledger. Nothing is counted unless the write succeeded.
    async fn record_result(
        &self,
        dedup: &mut Deduplicator,
        result: &DownloadResult,
        summary: &mut RunSummary,
    ) -> Option<RunHalt> {
        let case_id = result.case_id.as_str();
        let (status, error) = match (result.status, &result.storage_key, &result.content_hash) {
            (DownloadStatus::Ok, Some(key), Some(hash)) => {
                let location = result.document_location().unwrap_or(key);
                if let Err(e) = self
                    .cases
                    .mark_downloaded(case_id, key, hash, result.byte_size, location)
                    .await
                {
                    return Some(RunHalt::case_store(&e));
                }
                if let Err(e) = dedup.commit(case_id).await {
                    return Some(RunHalt::ledger(&e));
                }
                summary.downloaded += 1;
                return None;
            }
            (DownloadStatus::Ok, ..) => {
                warn!(case_id, "ok result without a stored document");
                (DownloadStatus::Failed, "no stored document for ok result")
            }
            (status, ..) => (status, result.error.as_deref().unwrap_or("")),
        };

        if let Err(e) = self
            .cases
            .record_attempt(case_id, status.case_status(), error)
            .await
        {
            return Some(RunHalt::case_store(&e));
        }
        if status == DownloadStatus::NotFound {
            summary.not_found += 1;
        } else {
            summary.failed += 1;
        }
        None
    }
}
