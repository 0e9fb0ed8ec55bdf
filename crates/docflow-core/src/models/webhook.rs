use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Processing endpoint configuration, read-only to the ingestion core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Feature this endpoint serves, e.g. `knowledge_base`.
    pub feature: String,
    pub url: String,
    pub timeout_seconds: u64,
    /// Total number of HTTP attempts per dispatch (at least one is always made).
    pub retry_attempts: u32,
    pub is_active: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub signing_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn new(tenant_id: Uuid, feature: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            feature: feature.into(),
            url: url.into(),
            timeout_seconds: 30,
            retry_attempts: 3,
            is_active: true,
            headers: HashMap::new(),
            signing_secret: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }
}

/// Scope a dispatch resolves its endpoint in: a tenant plus the feature name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchScope {
    pub tenant_id: Uuid,
    pub feature: String,
}

impl DispatchScope {
    pub fn new(tenant_id: Uuid, feature: impl Into<String>) -> Self {
        Self {
            tenant_id,
            feature: feature.into(),
        }
    }
}

/// Body posted to the processing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingJobPayload {
    pub event: String,
    pub file_id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size: i64,
    pub storage_path: String,
    /// Time-limited signed URL the engine downloads the object from.
    pub download_url: String,
    pub download_url_expires_at: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
}

/// Whether the processing job was started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// The engine accepted the job; the record is `processing`.
    Started,
    /// No active endpoint for the scope; the record stays `pending`.
    Unconfigured,
    /// Every attempt failed; the record is `error`.
    Failed,
}

/// Structured result of a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub message: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl DispatchOutcome {
    pub fn started(attempts: u32) -> Self {
        Self {
            status: DispatchStatus::Started,
            message: Some("Processing started".to_string()),
            error: None,
            attempts,
        }
    }

    pub fn unconfigured(message: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Unconfigured,
            message: Some(message.into()),
            error: None,
            attempts: 0,
        }
    }

    pub fn failed(error: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: DispatchStatus::Failed,
            message: None,
            error: Some(error.into()),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Started
    }
}
