//! Docflow Storage Library
//!
//! Storage client abstraction for uploaded documents, with a local
//! filesystem backend and an in-memory backend.
//!
//! # Storage key format
//!
//! `documents/{tenant_id}/{collection_id}/{file_id}/{sanitized_filename}`
//!
//! Keys must not contain `..` or a leading `/`. Key generation is centralized in
//! the `keys` module so all backends stay consistent.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-memory")]
pub mod memory;
pub mod signing;
pub mod traits;
mod transfer;

// Re-export commonly used types
pub use docflow_core::StorageBackend;
pub use factory::create_storage;
pub use keys::{generate_object_key, sanitize_filename};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-memory")]
pub use memory::MemoryStorage;
pub use signing::{SignedUrl, UrlSigner};
pub use traits::{ObjectReader, ProgressFn, Storage, StorageError, StorageResult};
