use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Durable processing status of a file record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ProcessingStatus {
    /// Whether an automatic (non user-initiated) write may move `self` to `next`.
    ///
    /// A completed record is never regressed automatically; only an explicit
    /// retry may move it back to `pending`.
    pub fn allows_automatic_transition(self, next: ProcessingStatus) -> bool {
        self != ProcessingStatus::Completed || next == ProcessingStatus::Completed
    }
}

impl Display for ProcessingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ProcessingStatus::Pending => write!(f, "pending"),
            ProcessingStatus::Processing => write!(f, "processing"),
            ProcessingStatus::Completed => write!(f, "completed"),
            ProcessingStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "error" => Ok(ProcessingStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid processing status: {}", s)),
        }
    }
}

/// Persisted row describing one uploaded file and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FileRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: Uuid,
    pub file_name: String,
    pub storage_path: String,
    pub size: i64,
    pub content_type: String,
    pub processing_status: ProcessingStatus,
    /// Counters reported by the external engine; passed through untouched.
    pub chunk_count: Option<i32>,
    pub vector_count: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a record.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub collection_id: Uuid,
    pub file_name: String,
    pub storage_path: String,
    pub size: i64,
    pub content_type: String,
}

impl NewFileRecord {
    pub fn into_record(self, now: DateTime<Utc>) -> FileRecord {
        FileRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            collection_id: self.collection_id,
            file_name: self.file_name,
            storage_path: self.storage_path,
            size: self.size,
            content_type: self.content_type,
            processing_status: ProcessingStatus::Pending,
            chunk_count: None,
            vector_count: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct FileRecordPatch {
    pub processing_status: Option<ProcessingStatus>,
    pub error_message: Option<Option<String>>,
    pub storage_path: Option<String>,
    pub chunk_count: Option<Option<i32>>,
    pub vector_count: Option<Option<i32>>,
}

impl FileRecordPatch {
    pub fn status(status: ProcessingStatus) -> Self {
        Self {
            processing_status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.processing_status.is_none()
            && self.error_message.is_none()
            && self.storage_path.is_none()
            && self.chunk_count.is_none()
            && self.vector_count.is_none()
    }

    /// Apply to a record in place, honouring the guard. Returns whether anything changed.
    pub fn apply_to(&self, record: &mut FileRecord, guard: StatusGuard, now: DateTime<Utc>) -> bool {
        if guard == StatusGuard::Automatic
            && record.processing_status == ProcessingStatus::Completed
            && self
                .processing_status
                .map(|s| s != ProcessingStatus::Completed)
                .unwrap_or(false)
        {
            // Completed records only accept counter updates from automatic writers.
            let mut changed = false;
            if let Some(chunks) = self.chunk_count {
                record.chunk_count = chunks;
                changed = true;
            }
            if let Some(vectors) = self.vector_count {
                record.vector_count = vectors;
                changed = true;
            }
            if changed {
                record.updated_at = now;
            }
            return changed;
        }

        if let Some(status) = self.processing_status {
            record.processing_status = status;
        }
        if let Some(message) = &self.error_message {
            record.error_message = message.clone();
        }
        if let Some(path) = &self.storage_path {
            record.storage_path = path.clone();
        }
        if let Some(chunks) = self.chunk_count {
            record.chunk_count = chunks;
        }
        if let Some(vectors) = self.vector_count {
            record.vector_count = vectors;
        }
        let changed = !self.is_empty();
        if changed {
            record.updated_at = now;
        }
        changed
    }
}

/// Who is writing a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusGuard {
    /// Pipeline writes; never regress a completed record.
    Automatic,
    /// User-initiated retry; may move any record back to pending.
    Explicit,
}

/// Filter for record queries. `tenant_id` is mandatory: every query is tenant scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub tenant_id: Uuid,
    pub collection_id: Option<Uuid>,
    pub processing_status: Option<ProcessingStatus>,
}

impl RecordFilter {
    pub fn tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            collection_id: None,
            processing_status: None,
        }
    }

    pub fn with_collection(mut self, collection_id: Uuid) -> Self {
        self.collection_id = Some(collection_id);
        self
    }

    pub fn with_status(mut self, status: ProcessingStatus) -> Self {
        self.processing_status = Some(status);
        self
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        record.tenant_id == self.tenant_id
            && self
                .collection_id
                .map(|c| c == record.collection_id)
                .unwrap_or(true)
            && self
                .processing_status
                .map(|s| s == record.processing_status)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Pagination {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.max(1),
            offset: offset.max(0),
        }
    }

    pub fn next(self) -> Self {
        Self {
            limit: self.limit,
            offset: self.offset + self.limit,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One dispatch attempt, appended to the processing log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub file_id: Uuid,
    pub tenant_id: Uuid,
    pub attempt: i32,
    pub status_code: Option<i32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}
