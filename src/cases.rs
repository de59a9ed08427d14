//! Case records and the pending-case store.
//!
//! The collect stage upserts every case it keeps into the `cases` table; the
//! download stage reads the ones still lacking a document. Failed and
//! not-found attempts are counted per case so a case that keeps failing is
//! eventually left alone.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::db::Database;

/// Longest `last_error` kept per case, in characters.
pub const MAX_ERROR_CHARS: usize = 2000;

/// One case as listed by the platform.
///
/// `case_id` is the dedup key. `document_url` is where the stored complaint
/// can be found once downloaded; while it is unset the case is pending
/// download. `complaint_link` is the platform's own document link when the
/// listing exposes one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: String,
    pub case_title: String,
    pub filing_date: String,
    pub jurisdiction: String,
    pub listing_url: String,
    pub document_url: Option<String>,
    pub complaint_link: Option<String>,
    pub docket_number: String,
    pub defendant: String,
    pub nature_of_suit: String,
    pub cause: String,
    pub complaint_label: String,
    pub date_hit: String,
}

impl CaseRecord {
    /// `"<court>|<docket>"`, the platform-stable identifier of a case.
    #[must_use]
    pub fn make_id(court: &str, docket_number: &str) -> String {
        format!("{}|{}", court.trim(), docket_number.trim())
    }

    #[must_use]
    pub fn is_pending_download(&self) -> bool {
        self.document_url.is_none()
    }
}

/// Download state of a stored case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Downloaded,
    NotFound,
    Failed,
}

impl CaseStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloaded" => Ok(Self::Downloaded),
            "not_found" => Ok(Self::NotFound),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid case status: {s}")),
        }
    }
}

/// Case-store errors.
#[derive(Debug, Error)]
pub enum CaseStoreError {
    #[error("case store query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("case not found: {case_id}")]
    NotFound { case_id: String },

    #[error("case {case_id} has unreadable state: {reason}")]
    Corrupt { case_id: String, reason: String },
}

/// A case row with its download bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCase {
    pub record: CaseRecord,
    pub status: CaseStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub storage_key: Option<String>,
    pub content_hash: Option<String>,
    pub byte_size: Option<u64>,
}

#[derive(Debug, FromRow)]
struct CaseRow {
    case_id: String,
    case_title: String,
    filing_date: String,
    jurisdiction: String,
    listing_url: String,
    document_url: Option<String>,
    complaint_link: Option<String>,
    docket_number: String,
    defendant: String,
    nature_of_suit: String,
    cause: String,
    complaint_label: String,
    date_hit: String,
    status: String,
    attempt_count: i64,
    last_error: Option<String>,
    storage_key: Option<String>,
    content_hash: Option<String>,
    byte_size: Option<i64>,
}

impl CaseRow {
    fn into_record(self) -> CaseRecord {
        CaseRecord {
            case_id: self.case_id,
            case_title: self.case_title,
            filing_date: self.filing_date,
            jurisdiction: self.jurisdiction,
            listing_url: self.listing_url,
            document_url: self.document_url,
            complaint_link: self.complaint_link,
            docket_number: self.docket_number,
            defendant: self.defendant,
            nature_of_suit: self.nature_of_suit,
            cause: self.cause,
            complaint_label: self.complaint_label,
            date_hit: self.date_hit,
        }
    }

    fn into_stored(self) -> Result<StoredCase, CaseStoreError> {
        let status = self
            .status
            .parse::<CaseStatus>()
            .map_err(|reason| CaseStoreError::Corrupt {
                case_id: self.case_id.clone(),
                reason,
            })?;
        let attempt_count = u32::try_from(self.attempt_count).unwrap_or(0);
        let byte_size = self.byte_size.and_then(|b| u64::try_from(b).ok());
        let last_error = self.last_error.clone();
        let storage_key = self.storage_key.clone();
        let content_hash = self.content_hash.clone();
        Ok(StoredCase {
            record: self.into_record(),
            status,
            attempt_count,
            last_error,
            storage_key,
            content_hash,
            byte_size,
        })
    }
}

const SELECT_COLUMNS: &str = "case_id, case_title, filing_date, jurisdiction, listing_url, \
     document_url, complaint_link, docket_number, defendant, nature_of_suit, cause, \
     complaint_label, date_hit, status, attempt_count, last_error, storage_key, \
     content_hash, byte_size";

/// SQLite-backed store of collected cases.
#[derive(Debug, Clone)]
pub struct CaseStore {
    db: Database,
}

impl CaseStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a newly collected case or refreshes the listing fields of a
    /// known one. Download state is never touched. Returns `true` when the
    /// case was new.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::Database`] if a statement fails.
    #[instrument(skip(self, record), fields(case_id = %record.case_id))]
    pub async fn upsert(&self, record: &CaseRecord) -> Result<bool, CaseStoreError> {
        let inserted = sqlx::query(
            r"INSERT OR IGNORE INTO cases (
                  case_id, case_title, filing_date, jurisdiction, listing_url,
                  complaint_link, docket_number, defendant, nature_of_suit, cause,
                  complaint_label, date_hit
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.case_id)
        .bind(&record.case_title)
        .bind(&record.filing_date)
        .bind(&record.jurisdiction)
        .bind(&record.listing_url)
        .bind(&record.complaint_link)
        .bind(&record.docket_number)
        .bind(&record.defendant)
        .bind(&record.nature_of_suit)
        .bind(&record.cause)
        .bind(&record.complaint_label)
        .bind(&record.date_hit)
        .execute(self.db.pool())
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            sqlx::query(
                r"UPDATE cases
                  SET case_title = ?, filing_date = ?, jurisdiction = ?, listing_url = ?,
                      complaint_link = COALESCE(?, complaint_link),
                      docket_number = ?, defendant = ?, nature_of_suit = ?, cause = ?,
                      complaint_label = ?, date_hit = ?, updated_at = datetime('now')
                  WHERE case_id = ?",
            )
            .bind(&record.case_title)
            .bind(&record.filing_date)
            .bind(&record.jurisdiction)
            .bind(&record.listing_url)
            .bind(&record.complaint_link)
            .bind(&record.docket_number)
            .bind(&record.defendant)
            .bind(&record.nature_of_suit)
            .bind(&record.cause)
            .bind(&record.complaint_label)
            .bind(&record.date_hit)
            .bind(&record.case_id)
            .execute(self.db.pool())
            .await?;
        }

        debug!(inserted, "case upserted");
        Ok(inserted)
    }

    /// Cases still lacking a document with fewer than `max_attempts`
    /// attempts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn pending(
        &self,
        limit: Option<u32>,
        max_attempts: u32,
    ) -> Result<Vec<CaseRecord>, CaseStoreError> {
        let limit = limit.map_or(-1, i64::from);
        let rows = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM cases
             WHERE status != ? AND document_url IS NULL AND attempt_count < ?
             ORDER BY created_at ASC, case_id ASC
             LIMIT ?"
        ))
        .bind(CaseStatus::Downloaded.as_str())
        .bind(i64::from(max_attempts))
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.into_iter().map(CaseRow::into_record).collect())
    }

    /// Number of undownloaded cases that have used up their attempts.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::Database`] if the query fails.
    pub async fn count_exhausted(&self, max_attempts: u32) -> Result<u64, CaseStoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r"SELECT COUNT(*) FROM cases
              WHERE status != ? AND document_url IS NULL AND attempt_count >= ?",
        )
        .bind(CaseStatus::Downloaded.as_str())
        .bind(i64::from(max_attempts))
        .fetch_one(self.db.pool())
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Records a stored complaint and clears any previous error.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::NotFound`] for an unknown case.
    #[instrument(skip(self, content_hash, document_url))]
    pub async fn mark_downloaded(
        &self,
        case_id: &str,
        storage_key: &str,
        content_hash: &str,
        byte_size: u64,
        document_url: &str,
    ) -> Result<(), CaseStoreError> {
        let result = sqlx::query(
            r"UPDATE cases
              SET status = ?, storage_key = ?, content_hash = ?, byte_size = ?,
                  document_url = ?, last_error = NULL, updated_at = datetime('now')
              WHERE case_id = ?",
        )
        .bind(CaseStatus::Downloaded.as_str())
        .bind(storage_key)
        .bind(content_hash)
        .bind(i64::try_from(byte_size).unwrap_or(i64::MAX))
        .bind(document_url)
        .bind(case_id)
        .execute(self.db.pool())
        .await?;

        check_affected(case_id, result.rows_affected())
    }

    /// Takes a case already in the ledger out of the pending queue. The
    /// document was stored by another run, so no location is recorded here.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::NotFound`] for an unknown case.
    #[instrument(skip(self))]
    pub async fn mark_processed(&self, case_id: &str) -> Result<(), CaseStoreError> {
        let result = sqlx::query(
            r"UPDATE cases
              SET status = ?, last_error = NULL, updated_at = datetime('now')
              WHERE case_id = ?",
        )
        .bind(CaseStatus::Downloaded.as_str())
        .bind(case_id)
        .execute(self.db.pool())
        .await?;

        check_affected(case_id, result.rows_affected())
    }

    /// Counts one unsuccessful download attempt.
    ///
    /// `error` is truncated to [`MAX_ERROR_CHARS`] characters.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::NotFound`] for an unknown case.
    #[instrument(skip(self, error))]
    pub async fn record_attempt(
        &self,
        case_id: &str,
        status: CaseStatus,
        error: &str,
    ) -> Result<(), CaseStoreError> {
        let truncated: String = error.chars().take(MAX_ERROR_CHARS).collect();
        let result = sqlx::query(
            r"UPDATE cases
              SET status = ?, attempt_count = attempt_count + 1, last_error = ?,
                  updated_at = datetime('now')
              WHERE case_id = ?",
        )
        .bind(status.as_str())
        .bind(truncated)
        .bind(case_id)
        .execute(self.db.pool())
        .await?;

        check_affected(case_id, result.rows_affected())
    }

    /// Looks up a case with its bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`CaseStoreError::Database`] or [`CaseStoreError::Corrupt`].
    pub async fn get(&self, case_id: &str) -> Result<Option<StoredCase>, CaseStoreError> {
        let row = sqlx::query_as::<_, CaseRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM cases WHERE case_id = ?"
        ))
        .bind(case_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(CaseRow::into_stored).transpose()
    }
}

fn check_affected(case_id: &str, rows_affected: u64) -> Result<(), CaseStoreError> {
    if rows_affected == 0 {
        return Err(CaseStoreError::NotFound {
            case_id: case_id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(court: &str, docket: &str) -> CaseRecord {
        CaseRecord {
            case_id: CaseRecord::make_id(court, docket),
            case_title: format!("People v. {docket}"),
            jurisdiction: court.to_string(),
            docket_number: docket.to_string(),
            listing_url: "https://courts.example.com/alerts".to_string(),
            ..CaseRecord::default()
        }
    }

    async fn store() -> CaseStore {
        CaseStore::new(Database::new_in_memory().await.unwrap())
    }

    #[test]
    fn test_case_record_make_id_trims_parts() {
        assert_eq!(CaseRecord::make_id(" CA Sup ", " 24-1 "), "CA Sup|24-1");
    }

    #[test]
    fn test_case_status_roundtrip() {
        for status in [
            CaseStatus::Pending,
            CaseStatus::Downloaded,
            CaseStatus::NotFound,
            CaseStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CaseStatus>().unwrap(), status);
        }
        assert!("done".parse::<CaseStatus>().is_err());
    }

    #[tokio::test]
    async fn test_upsert_reports_new_then_existing() {
        let store = store().await;
        let mut case = record("CA", "1");
        assert!(store.upsert(&case).await.unwrap());

        case.case_title = "Renamed".to_string();
        assert!(!store.upsert(&case).await.unwrap());

        let stored = store.get("CA|1").await.unwrap().unwrap();
        assert_eq!(stored.record.case_title, "Renamed");
        assert_eq!(stored.status, CaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_upsert_preserves_download_state() {
        let store = store().await;
        store.upsert(&record("CA", "1")).await.unwrap();
        store
            .mark_downloaded("CA|1", "complaints/CA_1/CA_1_complaint.pdf", "abc", 10, "k")
            .await
            .unwrap();

        store.upsert(&record("CA", "1")).await.unwrap();
        let stored = store.get("CA|1").await.unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::Downloaded);
        assert_eq!(stored.record.document_url.as_deref(), Some("k"));
        assert_eq!(stored.byte_size, Some(10));
    }

    #[tokio::test]
    async fn test_pending_excludes_downloaded_and_exhausted() {
        let store = store().await;
        for docket in ["1", "2", "3"] {
            store.upsert(&record("CA", docket)).await.unwrap();
        }
        store
            .mark_downloaded("CA|1", "key", "hash", 1, "key")
            .await
            .unwrap();
        for _ in 0..2 {
            store
                .record_attempt("CA|2", CaseStatus::Failed, "timeout")
                .await
                .unwrap();
        }

        let pending = store.pending(None, 2).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|c| c.case_id.as_str()).collect();
        assert_eq!(ids, vec!["CA|3"]);
        assert_eq!(store.count_exhausted(2).await.unwrap(), 1);

        let pending = store.pending(None, 5).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_respects_limit() {
        let store = store().await;
        for docket in ["1", "2", "3"] {
            store.upsert(&record("CA", docket)).await.unwrap();
        }
        assert_eq!(store.pending(Some(2), 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_processed_leaves_pending_queue() {
        let store = store().await;
        for docket in ["1", "2"] {
            store.upsert(&record("CA", docket)).await.unwrap();
        }
        store.mark_processed("CA|1").await.unwrap();

        let pending = store.pending(Some(1), 5).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].case_id, "CA|2");

        let stored = store.get("CA|1").await.unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::Downloaded);
        assert!(stored.storage_key.is_none());
    }

    #[tokio::test]
    async fn test_record_attempt_truncates_error() {
        let store = store().await;
        store.upsert(&record("CA", "1")).await.unwrap();
        let long = "x".repeat(MAX_ERROR_CHARS + 500);
        store
            .record_attempt("CA|1", CaseStatus::NotFound, &long)
            .await
            .unwrap();

        let stored = store.get("CA|1").await.unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::NotFound);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_error.unwrap().chars().count(), MAX_ERROR_CHARS);
    }

    #[tokio::test]
    async fn test_mark_unknown_case_is_not_found() {
        let store = store().await;
        let err = store
            .record_attempt("nope", CaseStatus::Failed, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, CaseStoreError::NotFound { .. }));
    }
}
