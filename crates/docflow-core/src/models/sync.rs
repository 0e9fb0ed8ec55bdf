use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

use super::file_record::{FileRecord, ProcessingStatus, RecordFilter};
use super::task::TaskStatus;

/// Tenant-bounded subset of records a synchronizer watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncScope {
    pub tenant_id: Uuid,
    pub collection_id: Option<Uuid>,
}

impl SyncScope {
    pub fn tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            collection_id: None,
        }
    }

    pub fn collection(tenant_id: Uuid, collection_id: Uuid) -> Self {
        Self {
            tenant_id,
            collection_id: Some(collection_id),
        }
    }

    pub fn filter(&self) -> RecordFilter {
        RecordFilter {
            tenant_id: self.tenant_id,
            collection_id: self.collection_id,
            processing_status: None,
        }
    }
}

/// One row change as delivered by the change-notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordChange {
    pub old: Option<FileRecord>,
    pub new: Option<FileRecord>,
}

impl RecordChange {
    pub fn record_id(&self) -> Option<Uuid> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|record| record.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DeltaKind {
    Inserted,
    Updated,
    Deleted,
    /// An update whose processing status changed. Drives user-visible notifications.
    StatusTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },
}

/// Old/new pair for a single record change, stamped with the record's `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecordDelta {
    pub record_id: Uuid,
    pub kind: DeltaKind,
    pub old: Option<FileRecord>,
    pub new: Option<FileRecord>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecordDelta {
    pub fn is_status_transition(&self) -> bool {
        matches!(self.kind, DeltaKind::StatusTransition { .. })
    }
}

/// Output of a synchronizer handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum SyncUpdate {
    /// Full read of every record in scope; always the first update.
    Snapshot(Vec<FileRecord>),
    Delta(FileRecordDelta),
}

/// Connectivity state of one watched scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Reconnecting,
}

impl ConnState {
    pub fn is_connected(self) -> bool {
        self == ConnState::Connected
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ConnState::Disconnected => write!(f, "disconnected"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
            ConnState::Degraded => write!(f, "degraded"),
            ConnState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Connectivity event for the UI (`{connected, lastError?}` plus the state itself).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityEvent {
    pub state: ConnState,
    pub connected: bool,
    pub last_error: Option<String>,
    /// Set once reconnect attempts are exhausted; the UI should offer a manual reconnect.
    pub max_reconnects_exceeded: bool,
    pub at: DateTime<Utc>,
}

/// In-memory connectivity bookkeeping for one scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionState {
    pub scope: SyncScope,
    pub state: ConnState,
    pub connected: bool,
    pub last_update_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl SubscriptionState {
    pub fn new(scope: SyncScope) -> Self {
        Self {
            scope,
            state: ConnState::Disconnected,
            connected: false,
            last_update_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Progress event published by the upload queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}
