//! Layered configuration.
//!
//! Sources, highest priority first:
//! 1. `CASEHARVEST_*` environment variables, `__` separating sections
//!    (`CASEHARVEST_STORAGE__BUCKET` -> `storage.bucket`). A `.env` file is
//!    loaded first when present.
//! 2. A TOML file (explicit path, or `caseharvest.toml` in the working dir).
//! 3. Built-in defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::retry::RetryPolicy;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "caseharvest.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CASEHARVEST_";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed or a value had the wrong type.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// An explicitly requested config file does not exist.
    #[error("config file not found: {0}")]
    MissingFile(PathBuf),

    /// A value is out of range or inconsistent.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub walk: WalkConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub run: RunConfig,
}

/// Where the case-research platform lives and how its pages look.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Platform origin, e.g. `https://courtlink.example.com`.
    pub base_url: String,
    /// Page probed to decide whether a restored session is still alive.
    pub landing_path: String,
    /// Form endpoint receiving the credentials.
    pub login_path: String,
    /// First page of the case-search / alert results.
    pub search_path: String,
    pub username_field: String,
    pub password_field: String,
    /// Substring present only on the login page.
    pub login_marker: String,
    /// Saved alert whose results are walked.
    pub alert_name: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Best-effort lifetime of a fresh session.
    pub session_ttl_secs: u64,
    /// Minimum gap between consecutive platform requests.
    pub request_delay_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            landing_path: "/".to_string(),
            login_path: "/signin".to_string(),
            search_path: "/alerts/results".to_string(),
            username_field: "userid".to_string(),
            password_field: "password".to_string(),
            login_marker: r#"id="userid""#.to_string(),
            alert_name: None,
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
            session_ttl_secs: 3600,
            request_delay_ms: 500,
        }
    }
}

impl PlatformConfig {
    /// Parses `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the URL is empty or malformed.
    pub fn base(&self) -> Result<Url, ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::invalid(
                "platform.base_url",
                "must be set (CASEHARVEST_PLATFORM__BASE_URL)",
            ));
        }
        Url::parse(self.base_url.trim())
            .map_err(|e| ConfigError::invalid("platform.base_url", e.to_string()))
    }

    /// Resolves a configured path against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the base URL or the join fails.
    pub fn join(&self, path: &str) -> Result<Url, ConfigError> {
        self.base()?
            .join(path)
            .map_err(|e| ConfigError::invalid("platform", format!("cannot join '{path}': {e}")))
    }
}

/// Platform login. Values are never logged.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// True when both username and password are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.username.trim().is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Listing walk limits and row filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    pub max_pages: u32,
    /// Natures of suit to keep; empty keeps everything.
    pub allowed_natures: Vec<String>,
    /// Keep only rows whose complaint column advertises a free copy.
    pub require_free_complaint: bool,
    pub first_participant_only: bool,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            allowed_natures: Vec::new(),
            require_free_complaint: true,
            first_participant_only: true,
        }
    }
}

/// Backoff settings shared by login, page loads, fetches and uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::retry::DEFAULT_MAX_RETRIES,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            max_jitter_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Builds the runtime policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_retries(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Duration::from_millis(self.max_jitter_ms),
        )
    }
}

/// Blob store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory on local disk.
    #[default]
    Local,
    /// Cloudflare R2 (S3 API).
    R2,
    /// Process memory; nothing survives the run.
    Memory,
}

/// Document and session-state storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend.
    pub root: PathBuf,
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// Custom S3 endpoint; built from `account_id` when empty.
    pub endpoint: String,
    /// Public URL prefix under which stored keys are reachable.
    pub public_base_url: Option<String>,
    /// Append a short content hash to document keys.
    pub key_includes_hash: bool,
    pub session_state_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("data/documents"),
            account_id: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            bucket: String::new(),
            endpoint: String::new(),
            public_base_url: None,
            key_includes_hash: false,
            session_state_key: "state/session.json".to_string(),
        }
    }
}

impl StorageConfig {
    /// S3 endpoint for the R2 backend.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.is_empty() {
            format!("https://{}.r2.cloudflarestorage.com", self.account_id)
        } else {
            self.endpoint.clone()
        }
    }
}

/// Ledger persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// `processed_cases` table in the SQLite database.
    #[default]
    Sqlite,
    /// One case id per line in an object of the blob store.
    Manifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    /// SQLite file holding the ledger (sqlite backend) and the case store.
    pub database_path: PathBuf,
    pub manifest_key: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            database_path: PathBuf::from("data/caseharvest.db"),
            manifest_key: "state/processed_cases.txt".to_string(),
        }
    }
}

/// Whole-run limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Download attempts per case across runs before it is left alone.
    pub max_attempts: u32,
    pub run_timeout_secs: u64,
    /// Cap on cases processed by one download stage; `None` processes all.
    pub download_limit: Option<u32>,
    /// Where collect snapshots go; `None` disables them.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            run_timeout_secs: 15 * 60,
            download_limit: None,
            snapshot_dir: Some(PathBuf::from("data/snapshots")),
        }
    }
}

impl AppConfig {
    /// Builds the provider chain without touching `.env`.
    ///
    /// `config_path` overrides the default `caseharvest.toml` lookup.
    #[must_use]
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let file = config_path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads `.env` (if any), then all providers, then validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingFile`] for an explicit path that does not
    /// exist, [`ConfigError::Load`] for provider errors and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => debug!(error = %e, "ignoring unreadable .env"),
        }

        if let Some(path) = config_path
            && !path.exists()
        {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }

        let config: Self = Self::figment(config_path)
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.platform.base()?;
        for (field, value) in [
            ("platform.connect_timeout_secs", self.platform.connect_timeout_secs),
            ("platform.request_timeout_secs", self.platform.request_timeout_secs),
        ] {
            if !(1..=3600).contains(&value) {
                return Err(ConfigError::invalid(field, format!("{value} not in 1..=3600")));
            }
        }
        if self.platform.login_marker.trim().is_empty() {
            return Err(ConfigError::invalid("platform.login_marker", "must not be empty"));
        }
        if !(1..=1000).contains(&self.walk.max_pages) {
            return Err(ConfigError::invalid(
                "walk.max_pages",
                format!("{} not in 1..=1000", self.walk.max_pages),
            ));
        }
        if self.retry.max_retries > 10 {
            return Err(ConfigError::invalid(
                "retry.max_retries",
                format!("{} not in 0..=10", self.retry.max_retries),
            ));
        }
        if self.run.max_attempts == 0 {
            return Err(ConfigError::invalid("run.max_attempts", "must be at least 1"));
        }
        if self.run.run_timeout_secs == 0 {
            return Err(ConfigError::invalid("run.run_timeout_secs", "must be at least 1"));
        }
        if self.storage.backend == StorageBackend::R2 {
            for (field, value) in [
                ("storage.bucket", &self.storage.bucket),
                ("storage.access_key_id", &self.storage.access_key_id),
                ("storage.secret_access_key", &self.storage.secret_access_key),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::invalid(field, "required for the r2 backend"));
                }
            }
            if self.storage.account_id.trim().is_empty() && self.storage.endpoint.trim().is_empty()
            {
                return Err(ConfigError::invalid(
                    "storage.account_id",
                    "account_id or endpoint is required for the r2 backend",
                ));
            }
        }
        Ok(())
    }
}
