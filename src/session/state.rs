//! Cookie material persisted between runs.
//!
//! Only the `name=value` pairs the jar would send to the platform origin are
//! kept. Restored cookies are scoped to that origin with the root path.

use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::storage::{DocumentStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PersistedSession {
    /// Origin the cookies belong to.
    pub origin: String,
    /// `name=value` pairs.
    pub cookies: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSession {
    /// Snapshot of the cookies `jar` holds for `origin`; `None` when empty.
    pub fn capture(jar: &Jar, origin: &Url) -> Option<Self> {
        let header = jar.cookies(origin)?;
        let header = header.to_str().ok()?;
        let cookies: Vec<String> = header
            .split(';')
            .map(str::trim)
            .filter(|pair| pair.contains('='))
            .map(ToString::to_string)
            .collect();
        if cookies.is_empty() {
            return None;
        }
        Some(Self {
            origin: origin_of(origin),
            cookies,
            saved_at: Utc::now(),
        })
    }

    /// Loads the cookies into `jar`. Returns how many were restored.
    pub fn restore_into(&self, jar: &Jar, origin: &Url) -> usize {
        if self.origin != origin_of(origin) {
            debug!(
                saved = %self.origin,
                current = %origin_of(origin),
                "persisted session belongs to another origin"
            );
            return 0;
        }
        let root = origin.join("/").unwrap_or_else(|_| origin.clone());
        for cookie in &self.cookies {
            jar.add_cookie_str(&format!("{cookie}; Path=/"), &root);
        }
        self.cookies.len()
    }
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Reads persisted state; unreadable JSON is treated as absent.
pub(crate) async fn load(
    store: &DocumentStore,
    key: &str,
) -> Result<Option<PersistedSession>, StorageError> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!(key, error = %e, "ignoring unreadable session state");
            Ok(None)
        }
    }
}

pub(crate) async fn save(
    store: &DocumentStore,
    key: &str,
    state: &PersistedSession,
) -> Result<(), StorageError> {
    // Serializing plain strings and a timestamp cannot fail.
    let bytes = serde_json::to_vec_pretty(state).unwrap_or_default();
    store.put(key, bytes).await
}
