//! Session and navigation errors.

use std::time::Duration;

use thiserror::Error;

use crate::retry::{FailureType, classify_http_status};

/// A single request made through the session failed.
#[derive(Debug, Error)]
pub enum NavigationError {
    /// DNS, connect, TLS or body-read failure.
    #[error("network error requesting {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read timeout.
    #[error("timeout requesting {url}")]
    Timeout { url: String },

    /// Non-success HTTP status.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Parsed `Retry-After`, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// The target could not be turned into a request URL.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// A request was attempted before `acquire()` succeeded.
    #[error("no active session for {url}")]
    NoSession { url: String },
}

impl NavigationError {
    /// Wraps a reqwest error, separating timeouts from other network errors.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<Duration>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Retry classification of this failure.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => FailureType::Transient,
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::InvalidUrl { .. } | Self::NoSession { .. } => FailureType::Permanent,
        }
    }

    /// Server-requested wait, for 429 responses.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status, when the server answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The session could not be established. Fatal for the run.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No username or password configured.
    #[error("platform credentials are not configured")]
    MissingCredentials,

    /// The platform kept showing the login page after the retry budget.
    #[error("login rejected after {attempts} attempt(s)")]
    Rejected { attempts: u32 },

    /// The login endpoint could not be reached after the retry budget.
    #[error("login failed after {attempts} attempt(s): {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: NavigationError,
    },

    /// The HTTP client could not be built.
    #[error("failed to build session client: {0}")]
    Client(#[source] reqwest::Error),

    /// Base URL or paths do not form valid URLs.
    #[error("invalid platform URL: {0}")]
    InvalidUrl(String),

    /// Session expired again right after being re-established.
    #[error("session expired again after re-login while requesting {url}")]
    Expired { url: String },
}

/// [`super::SessionManager::get_with_retry`] gave up.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Re-login failed or the session died twice; fatal for the run.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The last request failed and the retry budget is spent, or the failure
    /// was permanent.
    #[error("giving up on {url} after {attempts} attempt(s): {source}")]
    Failed {
        url: String,
        attempts: u32,
        #[source]
        source: NavigationError,
    },

    /// The server answered but the content was unusable on every attempt.
    #[error("unusable response from {url} after {attempts} attempt(s): {reason}")]
    Unusable {
        url: String,
        attempts: u32,
        reason: String,
    },
}

impl RetrievalError {
    /// Attempts made before giving up (zero for auth failures).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Auth(_) => 0,
            Self::Failed { attempts, .. } | Self::Unusable { attempts, .. } => *attempts,
        }
    }

    /// HTTP status of the final failure, if there was one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Failed { source, .. } => source.status(),
            _ => None,
        }
    }
}
