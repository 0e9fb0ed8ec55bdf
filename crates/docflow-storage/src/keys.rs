//! Shared key generation for storage backends.
//!
//! Key format: `documents/{tenant_id}/{collection_id}/{file_id}/{sanitized_filename}`.

use crate::traits::{StorageError, StorageResult};
use uuid::Uuid;

const MAX_FILENAME_LENGTH: usize = 255;

/// Reduce a user-supplied file name to `[A-Za-z0-9._-]`.
///
/// Directory components are dropped; names containing `..` or that end up
/// shorter than three characters become `file`.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);
    if base.contains("..") {
        return "file".to_string();
    }
    let sanitized: String = base
        .chars()
        .take(MAX_FILENAME_LENGTH)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.trim_matches('_').is_empty() || sanitized.len() < 3 {
        "file".to_string()
    } else {
        sanitized
    }
}

/// Generate the storage key for one uploaded document.
pub fn generate_object_key(
    tenant_id: Uuid,
    collection_id: Uuid,
    file_id: Uuid,
    filename: &str,
) -> String {
    format!(
        "documents/{}/{}/{}/{}",
        tenant_id,
        collection_id,
        file_id,
        sanitize_filename(filename)
    )
}

/// Reject keys that could escape a backend's root.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.contains("..") || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(
            "Storage key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}
