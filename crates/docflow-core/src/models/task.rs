use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle status of an in-memory upload task.
///
/// Forward order: `Queued → Validating → Uploading → AwaitingProcessing → Succeeded`.
/// `Failed` may be reached from any non-terminal step, `Cancelled` from any
/// non-terminal step, and `Failed → Queued` is the only backward edge (retry).
/// `Failed → Cancelled` is legal only while an automatic retry is pending; see
/// [`FileTask::can_transition_to`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Validating,
    Uploading,
    AwaitingProcessing,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Validating => 1,
            TaskStatus::Uploading => 2,
            TaskStatus::AwaitingProcessing => 3,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled => 4,
        }
    }

    /// Terminal for the in-memory lifecycle. `Failed` still admits an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Validating | TaskStatus::Uploading | TaskStatus::AwaitingProcessing
        )
    }

    /// Whether moving from `self` to `next` respects the task lifecycle.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Failed, TaskStatus::Queued) => true,
            (TaskStatus::Failed, TaskStatus::Cancelled) => true,
            (from, _) if from.is_terminal() => false,
            (_, TaskStatus::Failed) | (_, TaskStatus::Cancelled) => true,
            (_, TaskStatus::Succeeded) => self == TaskStatus::AwaitingProcessing,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Validating => write!(f, "validating"),
            TaskStatus::Uploading => write!(f, "uploading"),
            TaskStatus::AwaitingProcessing => write!(f, "awaiting_processing"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "validating" => Ok(TaskStatus::Validating),
            "uploading" => Ok(TaskStatus::Uploading),
            "awaiting_processing" => Ok(TaskStatus::AwaitingProcessing),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// Why a task ended up `Failed`. Decides whether an explicit retry is legal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureKind {
    /// Rejected by the validator or the source could not be read. Never retried.
    Validation,
    /// Storage transfer failed after automatic retries were exhausted.
    Transport,
    /// The processing dispatch exhausted its attempts.
    Dispatch,
}

impl TaskFailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, TaskFailureKind::Validation)
    }
}

/// Where the bytes of a submitted file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// A user-selected file handed to the queue.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub source: FileSource,
}

impl SourceFile {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            content_type: content_type.into(),
            source: FileSource::Bytes(data.into()),
        }
    }

    pub fn from_path(
        path: impl Into<PathBuf>,
        size: u64,
        content_type: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Self {
            name,
            size,
            content_type: content_type.into(),
            source: FileSource::Path(path),
        }
    }
}

/// Target of a batch: tenant, knowledge-base collection and the processing
/// feature whose webhook config should receive the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub tenant_id: Uuid,
    pub collection_id: Uuid,
    pub feature: String,
}

impl Destination {
    pub fn new(tenant_id: Uuid, collection_id: Uuid, feature: impl Into<String>) -> Self {
        Self {
            tenant_id,
            collection_id,
            feature: feature.into(),
        }
    }
}

/// One file's upload/processing lifecycle while it is owned by the queue.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub id: Uuid,
    pub source: SourceFile,
    pub destination: Destination,
    /// Durable record id, assigned once the upload has been recorded.
    pub record_id: Option<Uuid>,
    pub storage_path: Option<String>,
    pub status: TaskStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_kind: Option<TaskFailureKind>,
    /// Informational outcome, e.g. "no processor configured".
    pub message: Option<String>,
    /// Set while an automatic transport retry is waiting out its backoff.
    pub retry_scheduled_at: Option<DateTime<Utc>>,
}

impl FileTask {
    pub fn new(source: SourceFile, destination: Destination) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            record_id: None,
            storage_path: None,
            status: TaskStatus::Queued,
            progress: 0,
            retry_count: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_error: None,
            failure_kind: None,
            message: None,
            retry_scheduled_at: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.source.size
    }

    pub fn content_type(&self) -> &str {
        &self.source.content_type
    }

    pub fn file_name(&self) -> &str {
        &self.source.name
    }

    /// Lifecycle check that also knows about pending automatic retries: a
    /// settled failure can no longer be cancelled.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.status == TaskStatus::Failed && next == TaskStatus::Cancelled {
            return self.retry_scheduled_at.is_some();
        }
        self.status.can_transition_to(next)
    }

    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.status == TaskStatus::Failed
            && self.retry_scheduled_at.is_none()
            && self.retry_count < max_retries
            && self.failure_kind.map(|k| k.is_retryable()).unwrap_or(true)
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            file_name: self.source.name.clone(),
            status: self.status,
            error: self.last_error.clone(),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            file_name: self.source.name.clone(),
            tenant_id: self.destination.tenant_id,
            collection_id: self.destination.collection_id,
            record_id: self.record_id,
            size: self.source.size,
            content_type: self.source.content_type.clone(),
            status: self.status,
            progress: self.progress,
            retry_count: self.retry_count,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            last_error: self.last_error.clone(),
            failure_kind: self.failure_kind,
            message: self.message.clone(),
        }
    }
}

/// Returned by `enqueue_batch` for each submitted file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: Uuid,
    pub file_name: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

/// Read-only copy of a task, safe to hand to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub file_name: String,
    pub tenant_id: Uuid,
    pub collection_id: Uuid,
    pub record_id: Option<Uuid>,
    pub size: u64,
    pub content_type: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_kind: Option<TaskFailureKind>,
    pub message: Option<String>,
}
