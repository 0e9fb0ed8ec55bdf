//! Docflow Core Library
//!
//! This crate provides the domain models, error taxonomy and configuration
//! shared by every docflow component: the upload queue, the processing
//! dispatcher, the status synchronizer and the collaborator backends.

pub mod backoff;
pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::{
    Config, DispatchConfig, StorageBackend, StorageConfig, SyncConfig, UploadConfig,
};
pub use error::{IngestError, IngestResult, LogLevel};
