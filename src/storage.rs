//! Durable blob storage for complaint documents and small state objects.
//!
//! Backed by [`object_store`]: a local directory, Cloudflare R2 through the S3
//! API, or process memory. Complaint keys are derived from the case id only
//! (optionally suffixed with a short content hash), so downstream consumers can
//! find a document from the case id alone.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::{StorageBackend, StorageConfig};
use crate::listing::compile_static_regex;

/// Prefix under which complaint documents live.
pub const COMPLAINTS_PREFIX: &str = "complaints";

/// Hex characters of the content hash appended to keys when enabled.
const KEY_HASH_LEN: usize = 12;

static UNSAFE_KEY_CHARS: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"[^A-Za-z0-9._-]+"));

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be constructed from configuration.
    #[error("failed to configure {backend} storage: {source}")]
    Configure {
        backend: &'static str,
        #[source]
        source: object_store::Error,
    },

    /// Local storage root could not be created.
    #[error("failed to create storage root {path}: {source}")]
    Root {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A backend call failed.
    #[error("storage {op} failed for {key}: {source}")]
    Backend {
        op: &'static str,
        key: String,
        #[source]
        source: object_store::Error,
    },

    /// The object read back after an upload does not match what was sent.
    #[error("stored object {key} has {actual} bytes, expected {expected}")]
    SizeMismatch { key: String, expected: u64, actual: u64 },
}

impl StorageError {
    fn backend(op: &'static str, key: &ObjectPath, source: object_store::Error) -> Self {
        Self::Backend {
            op,
            key: key.to_string(),
            source,
        }
    }
}

/// Result of a verified document upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub key: String,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub content_hash: String,
    pub byte_size: u64,
    /// Identical bytes were already present; nothing was uploaded.
    pub reused: bool,
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Case id with every run of characters outside `[A-Za-z0-9._-]` replaced by `_`.
#[must_use]
pub fn safe_id(case_id: &str) -> String {
    UNSAFE_KEY_CHARS.replace_all(case_id.trim(), "_").into_owned()
}

/// Storage key for a case's complaint.
///
/// `complaints/<safe_id>/<safe_id>_complaint.pdf`, or
/// `complaints/<safe_id>/<safe_id>_complaint_<hash12>.pdf` when a hash is given.
#[must_use]
pub fn document_key(case_id: &str, content_hash: Option<&str>) -> String {
    let id = safe_id(case_id);
    match content_hash {
        Some(hash) => {
            let short = &hash[..hash.len().min(KEY_HASH_LEN)];
            format!("{COMPLAINTS_PREFIX}/{id}/{id}_complaint_{short}.pdf")
        }
        None => format!("{COMPLAINTS_PREFIX}/{id}/{id}_complaint.pdf"),
    }
}

/// Blob store handle shared by the downloader, the manifest ledger and
/// session persistence.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    inner: Arc<dyn ObjectStore>,
    public_base_url: Option<String>,
    key_includes_hash: bool,
}

impl DocumentStore {
    /// Wraps an existing object store.
    #[must_use]
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            public_base_url: None,
            key_includes_hash: false,
        }
    }

    /// Process-local store; contents vanish with the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Store rooted at a local directory, created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Root`] or [`StorageError::Configure`].
    pub fn local(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|source| StorageError::Root {
            path: root.display().to_string(),
            source,
        })?;
        let fs = LocalFileSystem::new_with_prefix(root).map_err(|source| {
            StorageError::Configure {
                backend: "local",
                source,
            }
        })?;
        Ok(Self::new(Arc::new(fs)))
    }

    /// Builds the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Configure`] when the backend rejects its
    /// settings, or [`StorageError::Root`] for an unusable local root.
    #[instrument(skip(config), fields(backend = ?config.backend))]
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let store = match config.backend {
            StorageBackend::Local => Self::local(&config.root)?,
            StorageBackend::Memory => Self::in_memory(),
            StorageBackend::R2 => {
                let s3 = AmazonS3Builder::new()
                    .with_bucket_name(&config.bucket)
                    .with_access_key_id(&config.access_key_id)
                    .with_secret_access_key(&config.secret_access_key)
                    .with_endpoint(config.endpoint_url())
                    .with_region("auto")
                    .build()
                    .map_err(|source| StorageError::Configure {
                        backend: "r2",
                        source,
                    })?;
                Self::new(Arc::new(s3))
            }
        };
        info!("document store ready");
        Ok(store
            .with_public_base_url(config.public_base_url.clone())
            .with_key_includes_hash(config.key_includes_hash))
    }

    #[must_use]
    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn with_key_includes_hash(mut self, enabled: bool) -> Self {
        self.key_includes_hash = enabled;
        self
    }

    /// Key under which `case_id`'s complaint with `hash` is stored.
    #[must_use]
    pub fn key_for(&self, case_id: &str, hash: &str) -> String {
        document_key(case_id, self.key_includes_hash.then_some(hash))
    }

    /// Public URL of `key`, when a public base URL is configured.
    #[must_use]
    pub fn public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{key}"))
    }

    /// Reads an object, `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] for failures other than not-found.
    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = ObjectPath::from(key);
        let result = match self.inner.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => return Err(StorageError::backend("get", &path, source)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|source| StorageError::backend("read", &path, source))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Writes an object unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`].
    #[instrument(level = "debug", skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = ObjectPath::from(key);
        self.inner
            .put(&path, PutPayload::from(bytes))
            .await
            .map_err(|source| StorageError::backend("put", &path, source))?;
        Ok(())
    }

    /// Stores a complaint for `case_id` and verifies it landed.
    ///
    /// When the derived key already holds identical bytes the upload is
    /// skipped. After an upload the object's size is read back and compared.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] or [`StorageError::SizeMismatch`].
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn put_document(
        &self,
        case_id: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredDocument, StorageError> {
        let hash = content_hash(&bytes);
        let key = self.key_for(case_id, &hash);
        let byte_size = bytes.len() as u64;

        if let Some(existing) = self.get(&key).await?
            && content_hash(&existing) == hash
        {
            debug!(key = %key, "identical document already stored");
            return Ok(StoredDocument {
                key,
                content_hash: hash,
                byte_size,
                reused: true,
            });
        }

        self.put(&key, bytes).await?;

        let path = ObjectPath::from(key.as_str());
        let meta = self
            .inner
            .head(&path)
            .await
            .map_err(|source| StorageError::backend("head", &path, source))?;
        let actual = u64::try_from(meta.size).unwrap_or(u64::MAX);
        if actual != byte_size {
            return Err(StorageError::SizeMismatch {
                key,
                expected: byte_size,
                actual,
            });
        }

        debug!(key = %key, bytes = byte_size, "document stored");
        Ok(StoredDocument {
            key,
            content_hash: hash,
            byte_size,
            reused: false,
        })
    }
}
