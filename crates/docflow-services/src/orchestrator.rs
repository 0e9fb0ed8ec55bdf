//! Orchestration facade
//!
//! Wires the upload queue, the processing dispatcher and the status
//! synchronizer together and exposes the operations a UI layer calls. Holds
//! nothing but references to those components.

use anyhow::Context;
use docflow_core::config::Config;
use docflow_core::models::{
    Destination, DispatchOutcome, DispatchScope, DispatchStatus, FileRecord, FileRecordPatch,
    ProcessingStatus, ProgressEvent, SourceFile, StatusGuard, SyncScope, TaskHandle, TaskSnapshot,
};
use docflow_core::{IngestError, IngestResult};
use docflow_db::{ChangeFeed, FileRecordStore, WebhookResolver};
use docflow_infra::{JobTransport, ProcessingDispatcher, ReqwestTransport};
use docflow_storage::Storage;
use docflow_worker::{DispatchContext, UploadQueue};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sync::{StatusSynchronizer, SyncHandle};

/// External collaborators the core is wired against.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub records: Arc<dyn FileRecordStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub resolver: Arc<dyn WebhookResolver>,
}

#[derive(Clone)]
pub struct Orchestrator {
    queue: UploadQueue,
    synchronizer: StatusSynchronizer,
    dispatcher: Arc<dyn DispatchContext>,
    records: Arc<dyn FileRecordStore>,
    /// Records with a `retry_processing` dispatch in flight.
    reprocessing: Arc<Mutex<HashSet<Uuid>>>,
}

/// Releases a record's reprocessing slot when dropped.
struct ReprocessingSlot {
    reprocessing: Arc<Mutex<HashSet<Uuid>>>,
    record_id: Uuid,
}

impl Drop for ReprocessingSlot {
    fn drop(&mut self) {
        self.reprocessing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.record_id);
    }
}

impl Orchestrator {
    pub fn new(
        queue: UploadQueue,
        synchronizer: StatusSynchronizer,
        dispatcher: Arc<dyn DispatchContext>,
        records: Arc<dyn FileRecordStore>,
    ) -> Self {
        Self {
            queue,
            synchronizer,
            dispatcher,
            records,
            reprocessing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Build every component from configuration, dispatching over HTTP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(config: &Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        let transport: Arc<dyn JobTransport> =
            Arc::new(ReqwestTransport::new().context("Failed to build dispatch transport")?);
        Ok(Self::with_transport(config, collaborators, transport))
    }

    pub fn with_transport(
        config: &Config,
        collaborators: Collaborators,
        transport: Arc<dyn JobTransport>,
    ) -> Self {
        let Collaborators {
            storage,
            records,
            feed,
            resolver,
        } = collaborators;

        let dispatcher: Arc<dyn DispatchContext> = Arc::new(ProcessingDispatcher::new(
            resolver,
            Arc::clone(&records),
            Arc::clone(&storage),
            transport,
            config.dispatch.clone(),
        ));
        let queue = UploadQueue::new(
            config.upload.clone(),
            storage,
            Arc::clone(&records),
            Arc::clone(&dispatcher),
        );
        let synchronizer = StatusSynchronizer::new(Arc::clone(&records), feed, config.sync.clone());

        Self::new(queue, synchronizer, dispatcher, records)
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Validate and enqueue files for one destination.
    pub fn submit_batch(
        &self,
        files: Vec<SourceFile>,
        destination: Destination,
    ) -> IngestResult<Vec<TaskHandle>> {
        self.queue.enqueue_batch(files, destination)
    }

    pub fn cancel_task(&self, id: Uuid) -> IngestResult<TaskSnapshot> {
        self.queue.cancel(id)
    }

    /// Re-enqueue a failed task. Refused while its record is being reprocessed.
    pub fn retry_task(&self, id: Uuid) -> IngestResult<TaskHandle> {
        let reprocessing = self.reprocessing();
        if reprocessing.contains(&id) {
            return Err(IngestError::InvalidState {
                id,
                action: "retry",
                status: "reprocessing".to_string(),
            });
        }
        self.queue.retry(id)
    }

    /// Drop settled tasks once the UI has seen their final state. Failed
    /// tasks that can still be retried are kept. Returns how many were removed.
    pub fn discard_finished(&self) -> usize {
        let removed = self.queue.prune_finished();
        tracing::debug!(removed, "Discarded finished tasks");
        removed
    }

    /// Snapshot of every task the queue knows about, in submission order.
    pub fn current_state(&self) -> Vec<TaskSnapshot> {
        self.queue.progress()
    }

    pub fn progress_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.queue.progress_events()
    }

    pub fn subscribe(&self, scope: SyncScope) -> SyncHandle {
        self.synchronizer.start(scope)
    }

    pub async fn unsubscribe(&self, handle: SyncHandle) {
        self.synchronizer.stop(handle).await
    }

    pub fn reconnect(&self, handle: &mut SyncHandle) -> bool {
        self.synchronizer.reconnect(handle)
    }

    /// Reset a persisted record to `pending` and dispatch it again.
    ///
    /// This is how work stranded by a restart, a missing endpoint or an
    /// exhausted dispatch resumes. An unconfigured endpoint is reported in the
    /// returned outcome; a failed dispatch is an error. Refused while an
    /// upload task still owns the record or another reprocessing of it runs.
    #[tracing::instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn retry_processing(
        &self,
        record_id: Uuid,
        scope: &DispatchScope,
    ) -> IngestResult<DispatchOutcome> {
        let _slot = self.claim_reprocessing(record_id)?;
        let record = self.reset_to_pending(record_id, scope.tenant_id).await?;
        let outcome = self
            .dispatcher
            .dispatch(&record, scope, &CancellationToken::new())
            .await;

        match outcome.status {
            DispatchStatus::Started | DispatchStatus::Unconfigured => Ok(outcome),
            DispatchStatus::Failed => Err(IngestError::DispatchFailure {
                message: outcome.error.unwrap_or_default(),
                attempts: outcome.attempts,
            }),
        }
    }

    fn reprocessing(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.reprocessing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim_reprocessing(&self, record_id: Uuid) -> IngestResult<ReprocessingSlot> {
        let mut reprocessing = self.reprocessing();
        if reprocessing.contains(&record_id) {
            return Err(IngestError::InvalidState {
                id: record_id,
                action: "retry processing",
                status: "reprocessing".to_string(),
            });
        }
        if let Some(task) = self.queue.live_task(record_id) {
            return Err(IngestError::InvalidState {
                id: record_id,
                action: "retry processing",
                status: task.status.to_string(),
            });
        }
        reprocessing.insert(record_id);
        Ok(ReprocessingSlot {
            reprocessing: Arc::clone(&self.reprocessing),
            record_id,
        })
    }

    async fn reset_to_pending(&self, record_id: Uuid, tenant_id: Uuid) -> IngestResult<FileRecord> {
        let record = self
            .records
            .get(tenant_id, record_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("file record {}", record_id)))?;

        if record.processing_status == ProcessingStatus::Processing {
            return Err(IngestError::InvalidState {
                id: record_id,
                action: "retry processing",
                status: record.processing_status.to_string(),
            });
        }

        let patch = FileRecordPatch::status(ProcessingStatus::Pending).clear_error();
        let record = self
            .records
            .update(tenant_id, record_id, patch, StatusGuard::Explicit)
            .await?;
        tracing::info!(record_id = %record_id, "Record reset to pending for reprocessing");
        Ok(record)
    }

    /// Wait until no task is queued or in flight.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docflow_core::models::NewFileRecord;
    use docflow_db::InMemoryRecordStore;
    use docflow_storage::MemoryStorage;
    use std::time::Duration;

    struct CountingDispatch {
        outcome: DispatchOutcome,
        delay: Duration,
        calls: Mutex<Vec<(Uuid, ProcessingStatus)>>,
    }

    #[async_trait]
    impl DispatchContext for CountingDispatch {
        async fn dispatch(
            &self,
            record: &FileRecord,
            _scope: &DispatchScope,
            _cancel: &CancellationToken,
        ) -> DispatchOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((record.id, record.processing_status));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone()
        }
    }

    fn orchestrator(
        store: &Arc<InMemoryRecordStore>,
        outcome: DispatchOutcome,
    ) -> (Orchestrator, Arc<CountingDispatch>) {
        slow_orchestrator(store, outcome, Duration::ZERO)
    }

    fn slow_orchestrator(
        store: &Arc<InMemoryRecordStore>,
        outcome: DispatchOutcome,
        delay: Duration,
    ) -> (Orchestrator, Arc<CountingDispatch>) {
        let dispatch = Arc::new(CountingDispatch {
            outcome,
            delay,
            calls: Mutex::new(Vec::new()),
        });
        let config = Config::default();
        let queue = UploadQueue::new(
            config.upload.clone(),
            Arc::new(MemoryStorage::new("secret")),
            store.clone(),
            dispatch.clone(),
        );
        let synchronizer = StatusSynchronizer::new(store.clone(), store.clone(), config.sync);
        (
            Orchestrator::new(queue, synchronizer, dispatch.clone(), store.clone()),
            dispatch,
        )
    }

    async fn recorded(store: &InMemoryRecordStore, tenant_id: Uuid, status: ProcessingStatus) -> Uuid {
        let id = store
            .insert(NewFileRecord {
                id: Uuid::new_v4(),
                tenant_id,
                collection_id: Uuid::new_v4(),
                file_name: "report.pdf".to_string(),
                storage_path: "documents/report.pdf".to_string(),
                size: 2048,
                content_type: "application/pdf".to_string(),
            })
            .await
            .unwrap();
        let patch = FileRecordPatch::status(status).with_error("engine crashed");
        store
            .update(tenant_id, id, patch, StatusGuard::Explicit)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn retry_processing_resets_then_dispatches() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = recorded(&store, tenant, ProcessingStatus::Error).await;
        let (orchestrator, dispatch) = orchestrator(&store, DispatchOutcome::started(1));

        let outcome = orchestrator
            .retry_processing(id, &DispatchScope::new(tenant, "knowledge_base"))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            *dispatch.calls.lock().unwrap(),
            vec![(id, ProcessingStatus::Pending)]
        );

        let record = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(record.processing_status, ProcessingStatus::Pending);
        assert!(record.error_message.is_none());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn retry_processing_may_reprocess_completed_records() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = recorded(&store, tenant, ProcessingStatus::Completed).await;
        let (orchestrator, dispatch) = orchestrator(&store, DispatchOutcome::started(1));

        orchestrator
            .retry_processing(id, &DispatchScope::new(tenant, "knowledge_base"))
            .await
            .unwrap();
        assert_eq!(dispatch.calls.lock().unwrap().len(), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn retry_processing_rejects_records_being_processed() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = recorded(&store, tenant, ProcessingStatus::Processing).await;
        let (orchestrator, dispatch) = orchestrator(&store, DispatchOutcome::started(1));

        let err = orchestrator
            .retry_processing(id, &DispatchScope::new(tenant, "knowledge_base"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidState { .. }), "{:?}", err);
        assert!(dispatch.calls.lock().unwrap().is_empty());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn retry_processing_is_tenant_scoped() {
        let store = Arc::new(InMemoryRecordStore::new());
        let id = recorded(&store, Uuid::new_v4(), ProcessingStatus::Error).await;
        let (orchestrator, _) = orchestrator(&store, DispatchOutcome::started(1));

        let err = orchestrator
            .retry_processing(id, &DispatchScope::new(Uuid::new_v4(), "knowledge_base"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)), "{:?}", err);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reprocessing_is_an_error() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = recorded(&store, tenant, ProcessingStatus::Error).await;
        let (orchestrator, _) = orchestrator(
            &store,
            DispatchOutcome::failed("Processing endpoint returned HTTP 500: boom", 3),
        );

        let err = orchestrator
            .retry_processing(id, &DispatchScope::new(tenant, "knowledge_base"))
            .await
            .unwrap_err();
        match err {
            IngestError::DispatchFailure { message, attempts } => {
                assert_eq!(attempts, 3);
                assert!(message.contains("HTTP 500"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn one_reprocessing_per_record_at_a_time() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = recorded(&store, tenant, ProcessingStatus::Error).await;
        let (orchestrator, dispatch) =
            slow_orchestrator(&store, DispatchOutcome::started(1), Duration::from_secs(5));
        let scope = DispatchScope::new(tenant, "knowledge_base");

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let scope = scope.clone();
            async move { orchestrator.retry_processing(id, &scope).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = orchestrator.retry_processing(id, &scope).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidState { .. }), "{:?}", err);
        let err = orchestrator.retry_task(id).unwrap_err();
        assert!(matches!(err, IngestError::InvalidState { .. }), "{:?}", err);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(dispatch.calls.lock().unwrap().len(), 1);

        // The slot is free again once the first dispatch returned.
        orchestrator.retry_processing(id, &scope).await.unwrap();
        assert_eq!(dispatch.calls.lock().unwrap().len(), 2);
        orchestrator.shutdown().await;
    }
}
