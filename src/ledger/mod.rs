//! Processed-case ledger and duplicate filtering.
//!
//! The ledger is the durable set of case ids whose complaint has been stored.
//! It is read once at the start of a run and appended to after each verified
//! upload. Two backends are provided: a table in the SQLite database and a
//! plain-text manifest object in the blob store.

mod manifest;
mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use manifest::ManifestLedger;
pub use sqlite::SqliteLedger;

use crate::cases::CaseRecord;
use crate::storage::StorageError;

/// Ledger persistence errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Durable, upsertable set of processed case ids.
///
/// Single writer; concurrent writers resolve as last-writer-wins.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Every processed case id. An absent ledger is empty.
    async fn load(&self) -> Result<HashSet<String>, LedgerError>;

    async fn contains(&self, case_id: &str) -> Result<bool, LedgerError>;

    /// Marks `case_id` processed. Committing an id twice is a no-op.
    async fn commit(&self, case_id: &str) -> Result<(), LedgerError>;
}

/// Splits listing output into new and already-processed cases.
pub struct Deduplicator {
    ledger: Arc<dyn Ledger>,
    processed: HashSet<String>,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("processed", &self.processed.len())
            .finish_non_exhaustive()
    }
}

impl Deduplicator {
    /// Reads the ledger into memory.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger cannot be read.
    #[instrument(skip(ledger))]
    pub async fn load(ledger: Arc<dyn Ledger>) -> Result<Self, LedgerError> {
        let processed = ledger.load().await?;
        info!(processed = processed.len(), "ledger loaded");
        Ok(Self { ledger, processed })
    }

    /// Records whose case id is not in the ledger, in input order, plus the
    /// number skipped. A case id repeated within `records` is kept once.
    #[must_use]
    pub fn filter_new(&self, records: Vec<CaseRecord>) -> (Vec<CaseRecord>, usize) {
        let total = records.len();
        let mut seen = HashSet::new();
        let fresh: Vec<CaseRecord> = records
            .into_iter()
            .filter(|r| !self.processed.contains(&r.case_id) && seen.insert(r.case_id.clone()))
            .collect();
        let skipped = total - fresh.len();
        debug!(total, new = fresh.len(), skipped, "filtered against ledger");
        (fresh, skipped)
    }

    #[must_use]
    pub fn is_processed(&self, case_id: &str) -> bool {
        self.processed.contains(case_id)
    }

    /// Number of processed ids known to this run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    /// Marks `case_id` processed in the ledger and in memory.
    ///
    /// Call only after the complaint is verified in storage.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the ledger write fails; the in-memory set
    /// is left unchanged in that case.
    #[instrument(skip(self))]
    pub async fn commit(&mut self, case_id: &str) -> Result<(), LedgerError> {
        if self.processed.contains(case_id) {
            return Ok(());
        }
        self.ledger.commit(case_id).await?;
        self.processed.insert(case_id.to_string());
        Ok(())
    }
}
