//! Complaint download.
//!
//! For one case: find the complaint (the listing's own link, or the free
//! complaint proceeding on the case detail page), fetch it under the active
//! session, check it is a PDF, store it under the case-addressed key and
//! verify the upload. Absent or access-denied documents are `not_found`;
//! exhausted retries are `failed`. Only a lost session is an error.

mod resolve;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use resolve::{PDF_MAGIC, find_complaint_link, looks_like_pdf};

use crate::cases::{CaseRecord, CaseStatus};
use crate::retry::{FailureType, RetryDecision, RetryPolicy};
use crate::session::{AuthError, RetrievalError, SessionManager};
use crate::storage::{DocumentStore, StoredDocument};

/// HTTP statuses that mean "this document is not available to us".
const NOT_FOUND_STATUSES: [u16; 4] = [401, 403, 404, 410];

/// Outcome of one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Ok,
    NotFound,
    Failed,
}

impl DownloadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
        }
    }

    /// Case-store status this outcome leaves behind.
    #[must_use]
    pub fn case_status(&self) -> CaseStatus {
        match self {
            Self::Ok => CaseStatus::Downloaded,
            Self::NotFound => CaseStatus::NotFound,
            Self::Failed => CaseStatus::Failed,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-case download report.
///
/// For `ok`, the document exists at `storage_key` and `content_hash` is the
/// SHA-256 of the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    pub case_id: String,
    pub status: DownloadStatus,
    pub storage_key: Option<String>,
    pub content_hash: Option<String>,
    pub byte_size: u64,
    pub fetched_at: DateTime<Utc>,
    /// Document requests made, including the final one.
    pub attempts: u32,
    /// Why the case is `not_found` or `failed`.
    pub error: Option<String>,
    /// Public location of the stored document, when configured.
    pub public_url: Option<String>,
}

impl DownloadResult {
    fn stored(case_id: &str, stored: StoredDocument, attempts: u32, public_url: Option<String>) -> Self {
        Self {
            case_id: case_id.to_string(),
            status: DownloadStatus::Ok,
            storage_key: Some(stored.key),
            content_hash: Some(stored.content_hash),
            byte_size: stored.byte_size,
            fetched_at: Utc::now(),
            attempts,
            error: None,
            public_url,
        }
    }

    fn unsuccessful(case_id: &str, status: DownloadStatus, attempts: u32, error: String) -> Self {
        Self {
            case_id: case_id.to_string(),
            status,
            storage_key: None,
            content_hash: None,
            byte_size: 0,
            fetched_at: Utc::now(),
            attempts,
            error: Some(error),
            public_url: None,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == DownloadStatus::Ok
    }

    /// Where downstream consumers find the document: the public URL when
    /// configured, else the storage key.
    #[must_use]
    pub fn document_location(&self) -> Option<&str> {
        self.public_url.as_deref().or(self.storage_key.as_deref())
    }
}

/// Why a case did not end `ok`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The session is gone; the run cannot continue.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// No document, or access denied. Recorded, not retried.
    #[error("no complaint for {case_id}: {reason}")]
    NotFound {
        case_id: String,
        attempts: u32,
        reason: String,
    },

    /// Retries exhausted on fetch or upload.
    #[error("complaint download failed for {case_id} after {attempts} attempt(s): {reason}")]
    Failed {
        case_id: String,
        attempts: u32,
        reason: String,
    },
}

impl FetchError {
    fn not_found(case_id: &str, attempts: u32, reason: impl Into<String>) -> Self {
        Self::NotFound {
            case_id: case_id.to_string(),
            attempts,
            reason: reason.into(),
        }
    }

    fn failed(case_id: &str, attempts: u32, reason: impl Into<String>) -> Self {
        Self::Failed {
            case_id: case_id.to_string(),
            attempts,
            reason: reason.into(),
        }
    }

    fn from_retrieval(case_id: &str, error: RetrievalError) -> Self {
        match error {
            RetrievalError::Auth(e) => Self::Auth(e),
            e if e.status().is_some_and(|s| NOT_FOUND_STATUSES.contains(&s)) => {
                Self::not_found(case_id, e.attempts(), e.to_string())
            }
            e => Self::failed(case_id, e.attempts(), e.to_string()),
        }
    }
}

/// Fetches and stores complaints for individual cases.
#[derive(Debug, Clone)]
pub struct ComplaintDownloader {
    store: DocumentStore,
    storage_policy: RetryPolicy,
}

impl ComplaintDownloader {
    /// `storage_policy` bounds upload retries; fetch retries follow the
    /// session's own policy.
    #[must_use]
    pub fn new(store: DocumentStore, storage_policy: RetryPolicy) -> Self {
        Self {
            store,
            storage_policy,
        }
    }

    #[must_use]
    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Downloads `record`'s complaint.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] only when the session cannot be kept alive;
    /// every other outcome is reported in the [`DownloadResult`].
    #[instrument(skip(self, session, record), fields(case_id = %record.case_id))]
    pub async fn fetch(
        &self,
        session: &mut SessionManager,
        record: &CaseRecord,
    ) -> Result<DownloadResult, AuthError> {
        match self.fetch_inner(session, record).await {
            Ok((stored, attempts)) => {
                let public_url = self.store.public_url(&stored.key);
                info!(
                    key = %stored.key,
                    bytes = stored.byte_size,
                    reused = stored.reused,
                    "complaint stored"
                );
                Ok(DownloadResult::stored(
                    &record.case_id,
                    stored,
                    attempts,
                    public_url,
                ))
            }
            Err(FetchError::Auth(e)) => Err(e),
            Err(FetchError::NotFound {
                attempts, reason, ..
            }) => {
                info!(attempts, reason = %reason, "no complaint available");
                Ok(DownloadResult::unsuccessful(
                    &record.case_id,
                    DownloadStatus::NotFound,
                    attempts,
                    reason,
                ))
            }
            Err(FetchError::Failed {
                attempts, reason, ..
            }) => {
                warn!(attempts, reason = %reason, "complaint download failed");
                Ok(DownloadResult::unsuccessful(
                    &record.case_id,
                    DownloadStatus::Failed,
                    attempts,
                    reason,
                ))
            }
        }
    }

    async fn fetch_inner(
        &self,
        session: &mut SessionManager,
        record: &CaseRecord,
    ) -> Result<(StoredDocument, u32), FetchError> {
        let document_url = self.resolve_document_url(session, record).await?;
        debug!(url = %document_url, "fetching complaint");

        let retrieved = session
            .get_with_retry(&document_url, |page| {
                if looks_like_pdf(&page.body) {
                    Ok(())
                } else {
                    Err(format!(
                        "response is not a PDF (content-type {})",
                        page.content_type.as_deref().unwrap_or("unknown")
                    ))
                }
            })
            .await
            .map_err(|e| FetchError::from_retrieval(&record.case_id, e))?;

        let stored = self
            .store_with_retry(&record.case_id, retrieved.page.body)
            .await?;
        Ok((stored, retrieved.attempts))
    }

    async fn resolve_document_url(
        &self,
        session: &mut SessionManager,
        record: &CaseRecord,
    ) -> Result<Url, FetchError> {
        if let Some(link) = &record.complaint_link {
            return session
                .origin()
                .join(link)
                .map_err(|e| {
                    FetchError::not_found(&record.case_id, 0, format!("bad link {link}: {e}"))
                });
        }

        let detail_url = session.origin().join(&record.listing_url).map_err(|e| {
            FetchError::not_found(
                &record.case_id,
                0,
                format!("bad case page {}: {e}", record.listing_url),
            )
        })?;
        let retrieved = session
            .get_with_retry(&detail_url, |_| Ok(()))
            .await
            .map_err(|e| FetchError::from_retrieval(&record.case_id, e))?;

        find_complaint_link(&retrieved.page.text(), &retrieved.page.url).ok_or_else(|| {
            FetchError::not_found(
                &record.case_id,
                retrieved.attempts,
                "no free COMPLAINT proceeding on case page",
            )
        })
    }

    async fn store_with_retry(
        &self,
        case_id: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredDocument, FetchError> {
        let mut attempt = 1;
        loop {
            let error = match self.store.put_document(case_id, bytes.clone()).await {
                Ok(stored) => return Ok(stored),
                Err(e) => e,
            };
            match self
                .storage_policy
                .should_retry(FailureType::Transient, attempt)
            {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(attempt, error = %error, "upload failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } => {
                    return Err(FetchError::failed(
                        case_id,
                        attempt,
                        format!("upload failed: {error}"),
                    ));
                }
            }
        }
    }
}
