//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use crate::signing::SignedUrl;
use crate::StorageBackend;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Transfer cancelled: {0}")]
    Cancelled(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    /// Whether the failure came from the transfer itself and may succeed on a retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::UploadFailed(_) | StorageError::BackendError(_) | StorageError::IoError(_)
        )
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Progress callback, invoked with the cumulative number of bytes written.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Source stream handed to `put_object`.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Storage abstraction trait
///
/// All backends write objects at caller-chosen keys (see the crate root for the
/// key layout) and hand out time-limited signed URLs for retrieval.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream `reader` to `key`, reporting progress after every chunk.
    ///
    /// The transfer checks `cancel` between chunks and returns
    /// `StorageError::Cancelled` when it fires. A partially written object may
    /// remain; callers clean it up with `delete_object`.
    async fn put_object(
        &self,
        key: &str,
        reader: ObjectReader,
        content_length: Option<u64>,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> StorageResult<String>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    /// Issue a signed retrieval URL valid for `ttl`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> StorageResult<SignedUrl>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}
