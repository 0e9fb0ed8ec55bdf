//! Collaborator traits
//!
//! Backends implement these; the upload queue, dispatcher and synchronizer
//! only ever see the traits.

use async_trait::async_trait;
use docflow_core::models::{
    DispatchScope, FileRecord, FileRecordPatch, NewFileRecord, Pagination, ProcessingLogEntry,
    RecordChange, RecordFilter, StatusGuard, WebhookConfig,
};
use docflow_core::IngestError;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Record already exists: {0}")]
    Conflict(Uuid),

    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Record store backend error: {0}")]
    Backend(String),
}

impl From<RecordStoreError> for IngestError {
    fn from(err: RecordStoreError) -> Self {
        match err {
            RecordStoreError::NotFound(id) => IngestError::NotFound(format!("file record {}", id)),
            other => IngestError::RecordStore(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChangeFeedError {
    #[error("Failed to connect to change feed: {0}")]
    Connect(String),

    #[error("Change feed closed: {0}")]
    Closed(String),

    #[error("Change feed lagged, {0} notifications dropped")]
    Lagged(u64),

    #[error("Malformed change notification: {0}")]
    Decode(String),
}

impl From<ChangeFeedError> for IngestError {
    fn from(err: ChangeFeedError) -> Self {
        IngestError::Subscription(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No config exists for the scope.
    #[error("No processing endpoint configured for feature '{0}'")]
    NotFound(String),

    /// A config exists but is switched off.
    #[error("Processing endpoint for feature '{0}' is inactive")]
    Inactive(String),

    #[error("Webhook resolver backend error: {0}")]
    Backend(String),
}

/// Stream of `{old, new}` row pairs. An `Err` item or the end of the stream
/// means the subscription is gone and must be re-established.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RecordChange, ChangeFeedError>> + Send>>;

/// Durable store of file records and their processing log.
#[async_trait]
pub trait FileRecordStore: Send + Sync {
    /// Insert a new record in `pending` status and return its id.
    async fn insert(&self, record: NewFileRecord) -> Result<Uuid, RecordStoreError>;

    /// Apply a partial update atomically.
    ///
    /// With `StatusGuard::Automatic` a `completed` record keeps its status
    /// whatever the patch says. Returns the record as stored afterwards.
    async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: FileRecordPatch,
        guard: StatusGuard,
    ) -> Result<FileRecord, RecordStoreError>;

    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<FileRecord>, RecordStoreError>;

    /// Records matching `filter`, oldest first.
    async fn query(
        &self,
        filter: &RecordFilter,
        pagination: Pagination,
    ) -> Result<Vec<FileRecord>, RecordStoreError>;

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, RecordStoreError>;

    async fn append_processing_log(
        &self,
        entry: ProcessingLogEntry,
    ) -> Result<(), RecordStoreError>;

    async fn list_processing_log(
        &self,
        tenant_id: Uuid,
        file_id: Uuid,
    ) -> Result<Vec<ProcessingLogEntry>, RecordStoreError>;
}

/// Change-notification channel over the record store.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: &RecordFilter) -> Result<ChangeStream, ChangeFeedError>;
}

/// Looks up the processing endpoint for a tenant/feature.
#[async_trait]
pub trait WebhookResolver: Send + Sync {
    /// Exactly the config registered for the scope, and only if active.
    async fn resolve_active_config(
        &self,
        scope: &DispatchScope,
    ) -> Result<WebhookConfig, ResolveError>;
}

/// Whether a change concerns a record inside `filter`'s tenant and collection.
///
/// The status part of the filter is ignored so that records moving out of a
/// status are still observed.
pub fn change_matches(filter: &RecordFilter, change: &RecordChange) -> bool {
    let Some(record) = change.new.as_ref().or(change.old.as_ref()) else {
        return false;
    };
    record.tenant_id == filter.tenant_id
        && filter
            .collection_id
            .map(|c| c == record.collection_id)
            .unwrap_or(true)
}
