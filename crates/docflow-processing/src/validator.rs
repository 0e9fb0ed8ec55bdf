use docflow_core::models::SourceFile;
use docflow_core::UploadConfig;
use serde::Serialize;
use std::path::Path;

/// Why a document was rejected before upload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("File is empty")]
    EmptyFile,

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    #[error("Content type {content_type} does not match extension '.{extension}'")]
    ContentTypeMismatch {
        content_type: String,
        extension: String,
    },

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
}

/// A file that passed validation, with its content type normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

/// Document validator
///
/// A total function over file metadata: no I/O, no panics, same answer for
/// the same input.
#[derive(Debug, Clone)]
pub struct DocumentValidator {
    max_file_size: u64,
    allowed_content_types: Vec<String>,
}

impl DocumentValidator {
    pub fn new(max_file_size: u64, allowed_content_types: Vec<String>) -> Self {
        Self {
            max_file_size,
            allowed_content_types: allowed_content_types
                .into_iter()
                .map(|ct| normalize_content_type(&ct))
                .collect(),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.max_file_size_bytes,
            config.allowed_content_types.clone(),
        )
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn validate_file_size(&self, size: u64) -> Result<(), ValidationError> {
        if size == 0 {
            return Err(ValidationError::EmptyFile);
        }
        if size > self.max_file_size {
            return Err(ValidationError::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    pub fn validate_content_type(&self, content_type: &str) -> Result<String, ValidationError> {
        let normalized = normalize_content_type(content_type);
        if !self.allowed_content_types.iter().any(|ct| ct == &normalized) {
            return Err(ValidationError::UnsupportedContentType {
                content_type: content_type.to_string(),
            });
        }
        Ok(normalized)
    }

    /// Reject a declared type that contradicts a known extension. Unknown or
    /// missing extensions are not cross-checked.
    pub fn validate_extension_content_type_match(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<(), ValidationError> {
        let Some(extension) = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
        else {
            return Ok(());
        };

        let expected: &[&str] = match extension.as_str() {
            "pdf" => &["application/pdf"],
            "txt" | "text" | "log" => &["text/plain"],
            "md" | "markdown" => &["text/markdown", "text/x-markdown", "text/plain"],
            "csv" => &["text/csv", "text/plain"],
            "html" | "htm" => &["text/html"],
            "doc" => &["application/msword"],
            "docx" => &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"],
            "rtf" => &["application/rtf", "text/rtf"],
            "odt" => &["application/vnd.oasis.opendocument.text"],
            _ => return Ok(()),
        };

        let normalized = normalize_content_type(content_type);
        if !expected.iter().any(|ct| *ct == normalized) {
            return Err(ValidationError::ContentTypeMismatch {
                content_type: content_type.to_string(),
                extension,
            });
        }
        Ok(())
    }

    /// Validate name, size and declared content type.
    pub fn validate(
        &self,
        file_name: &str,
        size: u64,
        content_type: &str,
    ) -> Result<Accepted, ValidationError> {
        if file_name.trim().is_empty() {
            return Err(ValidationError::InvalidFilename(
                "file name is empty".to_string(),
            ));
        }
        self.validate_file_size(size)?;
        let content_type = self.validate_content_type(content_type)?;
        self.validate_extension_content_type_match(file_name, &content_type)?;
        Ok(Accepted {
            file_name: file_name.to_string(),
            content_type,
            size,
        })
    }

    pub fn validate_source(&self, file: &SourceFile) -> Result<Accepted, ValidationError> {
        self.validate(&file.name, file.size, &file.content_type)
    }
}

impl Default for DocumentValidator {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

/// Lowercase and drop parameters: `Text/Plain; charset=UTF-8` becomes `text/plain`.
fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}
