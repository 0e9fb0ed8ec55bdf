//! Error types module
//!
//! `IngestError` is the taxonomy shared by the upload queue, dispatcher and
//! synchronizer. Backend crates keep their own `thiserror` enums and convert
//! into it at the service boundary.

use std::io;

use uuid::Uuid;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected errors such as validation rejections
    Debug,
    /// Recoverable issues: transport failures, missing endpoints, lost subscriptions
    Warn,
    /// Unexpected failures
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// File rejected before upload. Terminal, shown to the user as-is.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Upload-layer failure, retried up to the configured cap.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No active processing endpoint for the scope. Reported, not fatal.
    #[error("No active processing endpoint: {0}")]
    DispatchUnconfigured(String),

    /// Every attempt to reach the processing endpoint failed.
    #[error("Dispatch failed after {attempts} attempt(s): {message}")]
    DispatchFailure { message: String, attempts: u32 },

    /// Change-notification channel failure.
    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {id} cannot {action} while {status}")]
    InvalidState {
        id: Uuid,
        action: &'static str,
        status: String,
    },

    #[error("Record store error: {0}")]
    RecordStore(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type IngestResult<T> = Result<T, IngestError>;

impl IngestError {
    /// Machine-readable error code (e.g. "TRANSPORT_ERROR")
    pub fn error_code(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "VALIDATION_ERROR",
            IngestError::Transport(_) => "TRANSPORT_ERROR",
            IngestError::DispatchUnconfigured(_) => "DISPATCH_UNCONFIGURED",
            IngestError::DispatchFailure { .. } => "DISPATCH_FAILURE",
            IngestError::Subscription(_) => "SUBSCRIPTION_ERROR",
            IngestError::NotFound(_) => "NOT_FOUND",
            IngestError::InvalidState { .. } => "INVALID_STATE",
            IngestError::RecordStore(_) => "RECORD_STORE_ERROR",
            IngestError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            IngestError::Transport(_)
            | IngestError::DispatchFailure { .. }
            | IngestError::Subscription(_)
            | IngestError::RecordStore(_) => true,
            IngestError::Validation(_)
            | IngestError::DispatchUnconfigured(_)
            | IngestError::NotFound(_)
            | IngestError::InvalidState { .. }
            | IngestError::Internal(_) => false,
        }
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            IngestError::Validation(_)
            | IngestError::NotFound(_)
            | IngestError::InvalidState { .. } => LogLevel::Debug,
            IngestError::Transport(_)
            | IngestError::DispatchUnconfigured(_)
            | IngestError::DispatchFailure { .. }
            | IngestError::Subscription(_) => LogLevel::Warn,
            IngestError::RecordStore(_) | IngestError::Internal(_) => LogLevel::Error,
        }
    }

    /// Message suitable for a progress event or a record's `error_message`.
    pub fn client_message(&self) -> String {
        match self {
            IngestError::Validation(reason) => reason.clone(),
            IngestError::Internal(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Internal(format!("{:#}", err))
    }
}

impl From<io::Error> for IngestError {
    fn from(err: io::Error) -> Self {
        IngestError::Transport(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Internal(format!("JSON error: {}", err))
    }
}
