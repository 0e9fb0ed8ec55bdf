//! Configuration module
//!
//! Environment-driven settings for the upload queue, the processing
//! dispatcher, the status synchronizer and the storage backend. Every
//! sub-config has a `Default` so components can be built in tests without
//! touching the environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

const UPLOAD_POOL_SIZE: usize = 3;
const UPLOAD_MAX_RETRIES: u32 = 3;
const UPLOAD_RETRY_BASE_DELAY_MS: u64 = 1000;
const MAX_DOCUMENT_SIZE_MB: u64 = 50;

const DISPATCH_SIGNED_URL_TTL_SECS: u64 = 3600;
const DISPATCH_BACKOFF_BASE_MS: u64 = 1000;
const DISPATCH_BACKOFF_CAP_MS: u64 = 30_000;

const SYNC_BACKOFF_BASE_SECS: u64 = 2;
const SYNC_BACKOFF_CAP_SECS: u64 = 30;
const SYNC_MAX_ATTEMPTS: u32 = 5;
const SYNC_SNAPSHOT_PAGE_SIZE: i64 = 500;

const DEV_SIGNING_SECRET: &str = "docflow-development-signing-secret";

/// Content types accepted for ingestion when `DOCUMENT_ALLOWED_CONTENT_TYPES` is unset.
pub const DEFAULT_DOCUMENT_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/markdown",
    "text/x-markdown",
    "text/csv",
    "text/html",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/rtf",
    "application/vnd.oasis.opendocument.text",
];

/// Upload queue settings
#[derive(Clone, Debug)]
pub struct UploadConfig {
    /// Maximum number of tasks in `Uploading` at once.
    pub pool_size: usize,
    /// Cap on transport retries per task, automatic and explicit combined.
    pub max_retries: u32,
    /// Linear backoff unit: the n-th automatic retry waits `n * retry_base_delay`.
    pub retry_base_delay: Duration,
    pub max_file_size_bytes: u64,
    pub allowed_content_types: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pool_size: UPLOAD_POOL_SIZE,
            max_retries: UPLOAD_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(UPLOAD_RETRY_BASE_DELAY_MS),
            max_file_size_bytes: MAX_DOCUMENT_SIZE_MB * 1024 * 1024,
            allowed_content_types: DEFAULT_DOCUMENT_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Processing dispatcher settings
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Lifetime of the retrieval URL handed to the processing engine.
    pub signed_url_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Permit endpoints on private or loopback addresses (local engines, tests).
    pub allow_private_endpoints: bool,
    /// Feature name used to resolve the processing endpoint.
    pub feature: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            signed_url_ttl: Duration::from_secs(DISPATCH_SIGNED_URL_TTL_SECS),
            backoff_base: Duration::from_millis(DISPATCH_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DISPATCH_BACKOFF_CAP_MS),
            allow_private_endpoints: false,
            feature: "knowledge_base".to_string(),
        }
    }
}

/// Status synchronizer settings
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Consecutive reconnect failures before giving up.
    pub max_attempts: u32,
    /// Poll the record store while the channel is down.
    pub poll_fallback: bool,
    pub snapshot_page_size: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(SYNC_BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(SYNC_BACKOFF_CAP_SECS),
            max_attempts: SYNC_MAX_ATTEMPTS,
            poll_fallback: true,
            snapshot_page_size: SYNC_SNAPSHOT_PAGE_SIZE,
        }
    }
}

/// Where uploaded objects are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Filesystem under `LOCAL_STORAGE_PATH`.
    Local,
    /// Process memory; objects vanish on exit.
    Memory,
}

impl StorageBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageBackend::Local => "local",
            StorageBackend::Memory => "memory",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!(
                "STORAGE_BACKEND must be `local` or `memory`, got `{}`",
                other
            )),
        }
    }
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Storage backend settings
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_path: Option<String>,
    pub base_url: String,
    /// HMAC key for signed retrieval URLs.
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            local_path: None,
            base_url: "http://localhost:8080/files".to_string(),
            signing_secret: DEV_SIGNING_SECRET.to_string(),
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: String,
    pub upload: UploadConfig,
    pub dispatch: DispatchConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    /// PostgreSQL connection string; in-memory collaborators are used when unset.
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            upload: UploadConfig::default(),
            dispatch: DispatchConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            database_url: None,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    env::var(key)
        .map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| default.iter().map(|s| s.to_string()).collect())
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let upload = UploadConfig {
            pool_size: env_or("UPLOAD_POOL_SIZE", UPLOAD_POOL_SIZE),
            max_retries: env_or("UPLOAD_MAX_RETRIES", UPLOAD_MAX_RETRIES),
            retry_base_delay: Duration::from_millis(env_or(
                "UPLOAD_RETRY_BASE_DELAY_MS",
                UPLOAD_RETRY_BASE_DELAY_MS,
            )),
            max_file_size_bytes: env_or("MAX_DOCUMENT_SIZE_MB", MAX_DOCUMENT_SIZE_MB) * 1024 * 1024,
            allowed_content_types: env_list(
                "DOCUMENT_ALLOWED_CONTENT_TYPES",
                DEFAULT_DOCUMENT_CONTENT_TYPES,
            ),
        };

        let dispatch = DispatchConfig {
            signed_url_ttl: Duration::from_secs(env_or(
                "DISPATCH_SIGNED_URL_TTL_SECS",
                DISPATCH_SIGNED_URL_TTL_SECS,
            )),
            backoff_base: Duration::from_millis(env_or(
                "DISPATCH_BACKOFF_BASE_MS",
                DISPATCH_BACKOFF_BASE_MS,
            )),
            backoff_cap: Duration::from_millis(env_or(
                "DISPATCH_BACKOFF_CAP_MS",
                DISPATCH_BACKOFF_CAP_MS,
            )),
            allow_private_endpoints: env_or("DISPATCH_ALLOW_PRIVATE_ENDPOINTS", false),
            feature: env::var("DISPATCH_FEATURE").unwrap_or_else(|_| "knowledge_base".to_string()),
        };

        let sync = SyncConfig {
            backoff_base: Duration::from_secs(env_or("SYNC_BACKOFF_BASE_SECS", SYNC_BACKOFF_BASE_SECS)),
            backoff_cap: Duration::from_secs(env_or("SYNC_BACKOFF_CAP_SECS", SYNC_BACKOFF_CAP_SECS)),
            max_attempts: env_or("SYNC_MAX_ATTEMPTS", SYNC_MAX_ATTEMPTS),
            poll_fallback: env_or("SYNC_POLL_FALLBACK", true),
            snapshot_page_size: env_or("SYNC_SNAPSHOT_PAGE_SIZE", SYNC_SNAPSHOT_PAGE_SIZE),
        };

        let backend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse::<StorageBackend>()?;
        let storage = StorageConfig {
            backend,
            local_path: env::var("LOCAL_STORAGE_PATH").ok(),
            base_url: env::var("LOCAL_STORAGE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/files".to_string()),
            signing_secret: env::var("STORAGE_SIGNING_SECRET")
                .unwrap_or_else(|_| DEV_SIGNING_SECRET.to_string()),
        };

        Ok(Config {
            environment,
            upload,
            dispatch,
            sync,
            storage,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.upload.pool_size == 0 {
            return Err(anyhow::anyhow!("UPLOAD_POOL_SIZE must be at least 1"));
        }
        if self.upload.max_file_size_bytes == 0 {
            return Err(anyhow::anyhow!("MAX_DOCUMENT_SIZE_MB must be at least 1"));
        }
        if self.upload.allowed_content_types.is_empty() {
            return Err(anyhow::anyhow!(
                "DOCUMENT_ALLOWED_CONTENT_TYPES must list at least one content type"
            ));
        }

        if self.dispatch.backoff_cap < self.dispatch.backoff_base {
            return Err(anyhow::anyhow!(
                "DISPATCH_BACKOFF_CAP_MS must not be lower than DISPATCH_BACKOFF_BASE_MS"
            ));
        }
        if self.dispatch.signed_url_ttl.is_zero() {
            return Err(anyhow::anyhow!("DISPATCH_SIGNED_URL_TTL_SECS must be positive"));
        }

        if self.sync.max_attempts == 0 {
            return Err(anyhow::anyhow!("SYNC_MAX_ATTEMPTS must be at least 1"));
        }
        if self.sync.backoff_cap < self.sync.backoff_base {
            return Err(anyhow::anyhow!(
                "SYNC_BACKOFF_CAP_SECS must not be lower than SYNC_BACKOFF_BASE_SECS"
            ));
        }
        if self.sync.snapshot_page_size <= 0 {
            return Err(anyhow::anyhow!("SYNC_SNAPSHOT_PAGE_SIZE must be positive"));
        }

        if self.storage.backend == StorageBackend::Local && self.storage.local_path.is_none() {
            return Err(anyhow::anyhow!(
                "LOCAL_STORAGE_PATH must be set when using local storage backend"
            ));
        }
        if self.is_production() && self.storage.signing_secret == DEV_SIGNING_SECRET {
            return Err(anyhow::anyhow!(
                "STORAGE_SIGNING_SECRET must be set in production"
            ));
        }
        if self.storage.signing_secret.len() < 16 {
            return Err(anyhow::anyhow!(
                "STORAGE_SIGNING_SECRET must be at least 16 characters long"
            ));
        }

        Ok(())
    }
}
