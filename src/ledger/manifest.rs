use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Ledger, LedgerError};
use crate::storage::DocumentStore;

/// Ledger kept as one case id per line in a blob-store object.
///
/// The whole manifest is rewritten on each new commit, so the last writer wins.
#[derive(Debug)]
pub struct ManifestLedger {
    store: DocumentStore,
    key: String,
    cache: Mutex<Option<BTreeSet<String>>>,
}

impl ManifestLedger {
    #[must_use]
    pub fn new(store: DocumentStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            cache: Mutex::new(None),
        }
    }

    async fn read(&self) -> Result<BTreeSet<String>, LedgerError> {
        let Some(bytes) = self.store.get(&self.key).await? else {
            debug!(key = %self.key, "no manifest yet");
            return Ok(BTreeSet::new());
        };
        let text = String::from_utf8(bytes).unwrap_or_else(|e| {
            warn!(key = %self.key, "manifest is not valid UTF-8; reading lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        });
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }
}

#[async_trait]
impl Ledger for ManifestLedger {
    async fn load(&self) -> Result<HashSet<String>, LedgerError> {
        let ids = self.read().await?;
        let set = ids.iter().cloned().collect();
        *self.cache.lock().await = Some(ids);
        Ok(set)
    }

    async fn contains(&self, case_id: &str) -> Result<bool, LedgerError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read().await?);
        }
        Ok(cache.as_ref().is_some_and(|ids| ids.contains(case_id)))
    }

    async fn commit(&self, case_id: &str) -> Result<(), LedgerError> {
        let mut cache = self.cache.lock().await;
        let mut ids = match cache.take() {
            Some(ids) => ids,
            None => self.read().await?,
        };
        if !ids.insert(case_id.to_string()) {
            *cache = Some(ids);
            return Ok(());
        }

        let mut body = ids.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        body.push('\n');
        let written = self.store.put(&self.key, body.into_bytes()).await;
        if written.is_err() {
            ids.remove(case_id);
        }
        *cache = Some(ids);
        written?;
        debug!(case_id, "manifest updated");
        Ok(())
    }
}
