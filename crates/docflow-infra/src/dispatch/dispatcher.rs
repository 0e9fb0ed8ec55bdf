use chrono::Utc;
use docflow_core::backoff;
use docflow_core::models::{
    DispatchOutcome, DispatchScope, FileRecord, FileRecordPatch, ProcessingJobPayload,
    ProcessingLogEntry, ProcessingStatus, StatusGuard, WebhookConfig,
};
use docflow_core::DispatchConfig;
use docflow_db::{FileRecordStore, ResolveError, WebhookResolver};
use docflow_storage::Storage;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::endpoint::validate_endpoint;
use super::transport::{JobTransport, TransportError};

/// Event name carried by every job payload.
pub const JOB_EVENT: &str = "document.uploaded";

/// Starts external processing for uploaded files.
///
/// A dispatch resolves the endpoint for the scope, posts a job with a signed
/// retrieval URL, retries failed attempts with capped exponential backoff and
/// writes the result onto the file record. It never waits for processing to
/// finish: the engine reports completion by updating the record itself.
#[derive(Clone)]
pub struct ProcessingDispatcher {
    resolver: Arc<dyn WebhookResolver>,
    records: Arc<dyn FileRecordStore>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn JobTransport>,
    config: DispatchConfig,
}

impl ProcessingDispatcher {
    pub fn new(
        resolver: Arc<dyn WebhookResolver>,
        records: Arc<dyn FileRecordStore>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn JobTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            resolver,
            records,
            storage,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Scope for a tenant under the configured processing feature.
    pub fn scope_for(&self, tenant_id: Uuid) -> DispatchScope {
        DispatchScope::new(tenant_id, self.config.feature.clone())
    }

    /// Start processing for `record`.
    ///
    /// Once `cancel` fires no further attempt is started; an attempt already
    /// on the wire is allowed to finish.
    #[tracing::instrument(
        skip(self, record, cancel),
        fields(file_id = %record.id, tenant_id = %record.tenant_id, feature = %scope.feature)
    )]
    pub async fn dispatch(
        &self,
        record: &FileRecord,
        scope: &DispatchScope,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let config = match self.resolver.resolve_active_config(scope).await {
            Ok(config) => config,
            Err(err @ (ResolveError::NotFound(_) | ResolveError::Inactive(_))) => {
                let message = format!("{}; the file is stored but will not be processed automatically", err);
                tracing::info!(reason = %err, "No processing endpoint, leaving file pending");
                self.persist(
                    record,
                    FileRecordPatch::status(ProcessingStatus::Pending).with_error(message.clone()),
                )
                .await;
                return DispatchOutcome::unconfigured(message);
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to resolve processing endpoint");
                return self.fail(record, err.to_string(), 0).await;
            }
        };

        if let Err(err) = validate_endpoint(&config.url, self.config.allow_private_endpoints).await
        {
            tracing::warn!(url = %config.url, error = %err, "Processing endpoint rejected");
            return self
                .fail(record, format!("Processing endpoint rejected: {}", err), 0)
                .await;
        }

        let body = match self.build_payload(record).await {
            Ok(body) => body,
            Err(message) => {
                tracing::error!(error = %message, "Failed to build processing job");
                return self.fail(record, message, 0).await;
            }
        };

        self.send_with_retry(record, &config, &body, cancel).await
    }

    async fn send_with_retry(
        &self,
        record: &FileRecord,
        config: &WebhookConfig,
        body: &str,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let max_attempts = config.attempts();
        let timeout = config.timeout();
        let mut made = 0u32;
        let mut last_error = String::new();

        while made < max_attempts {
            if made > 0 {
                let delay =
                    backoff::exponential(self.config.backoff_base, self.config.backoff_cap, made - 1);
                tracing::debug!(attempt = made + 1, delay_ms = delay.as_millis() as u64, "Backing off before next dispatch attempt");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            made += 1;
            let started = Instant::now();
            let result = match tokio::time::timeout(
                timeout,
                self.transport.send(config, body, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            let duration_ms = started.elapsed().as_millis() as i64;
            self.log_attempt(record, made, &result, duration_ms).await;

            match result {
                Ok(status) => {
                    tracing::info!(attempt = made, status_code = status, duration_ms, "Processing job accepted");
                    self.persist(
                        record,
                        FileRecordPatch::status(ProcessingStatus::Processing).clear_error(),
                    )
                    .await;
                    return DispatchOutcome::started(made);
                }
                Err(err) => {
                    tracing::warn!(attempt = made, max_attempts, error = %err, duration_ms, "Dispatch attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        let message = if made < max_attempts {
            format!("Dispatch cancelled after {} attempt(s): {}", made, last_error)
        } else {
            last_error
        };
        self.fail(record, message, made).await
    }

    async fn build_payload(&self, record: &FileRecord) -> Result<String, String> {
        let signed = self
            .storage
            .signed_url(&record.storage_path, self.config.signed_url_ttl)
            .await
            .map_err(|e| format!("Failed to sign retrieval URL: {}", e))?;

        let payload = ProcessingJobPayload {
            event: JOB_EVENT.to_string(),
            file_id: record.id,
            tenant_id: record.tenant_id,
            collection_id: record.collection_id,
            file_name: record.file_name.clone(),
            content_type: record.content_type.clone(),
            size: record.size,
            storage_path: record.storage_path.clone(),
            download_url: signed.url,
            download_url_expires_at: signed.expires_at,
            requested_at: Utc::now(),
        };
        serde_json::to_string(&payload).map_err(|e| format!("Failed to serialize job: {}", e))
    }

    async fn fail(&self, record: &FileRecord, message: String, attempts: u32) -> DispatchOutcome {
        self.persist(
            record,
            FileRecordPatch::status(ProcessingStatus::Error).with_error(message.clone()),
        )
        .await;
        DispatchOutcome::failed(message, attempts)
    }

    async fn persist(&self, record: &FileRecord, patch: FileRecordPatch) {
        if let Err(e) = self
            .records
            .update(record.tenant_id, record.id, patch, StatusGuard::Automatic)
            .await
        {
            tracing::error!(file_id = %record.id, error = %e, "Failed to persist dispatch result");
        }
    }

    async fn log_attempt(
        &self,
        record: &FileRecord,
        attempt: u32,
        result: &Result<u16, TransportError>,
        duration_ms: i64,
    ) {
        let (status_code, error_message) = match result {
            Ok(status) => (Some(i32::from(*status)), None),
            Err(err) => (err.status_code().map(i32::from), Some(err.to_string())),
        };
        let entry = ProcessingLogEntry {
            id: Uuid::new_v4(),
            file_id: record.id,
            tenant_id: record.tenant_id,
            attempt: attempt as i32,
            status_code,
            success: result.is_ok(),
            error_message,
            duration_ms,
            created_at: Utc::now(),
        };
        if let Err(e) = self.records.append_processing_log(entry).await {
            tracing::warn!(file_id = %record.id, error = %e, "Failed to append processing log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docflow_core::models::NewFileRecord;
    use docflow_db::{InMemoryRecordStore, InMemoryWebhookResolver};
    use docflow_storage::{MemoryStorage, ObjectReader};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Step {
        Reply(Result<u16, TransportError>),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        steps: Mutex<VecDeque<Step>>,
        bodies: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                bodies: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobTransport for ScriptedTransport {
        async fn send(
            &self,
            _config: &WebhookConfig,
            body: &str,
            _timeout: Duration,
        ) -> Result<u16, TransportError> {
            self.bodies.lock().unwrap().push(body.to_string());
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(result)) => result,
                Some(Step::Hang) => std::future::pending::<Result<u16, TransportError>>().await,
                None => Ok(200),
            }
        }
    }

    struct Fixture {
        records: InMemoryRecordStore,
        resolver: InMemoryWebhookResolver,
        storage: MemoryStorage,
        record: FileRecord,
    }

    async fn fixture() -> Fixture {
        let records = InMemoryRecordStore::new();
        let resolver = InMemoryWebhookResolver::new();
        let storage = MemoryStorage::new("test-secret");

        let tenant_id = Uuid::new_v4();
        let collection_id = Uuid::new_v4();
        let id = Uuid::new_v4();
        let key = format!("documents/{}/{}/{}/guide.pdf", tenant_id, collection_id, id);
        let reader: ObjectReader = Box::pin(std::io::Cursor::new(b"%PDF-1.7".to_vec()));
        storage
            .put_object(&key, reader, Some(8), Arc::new(|_| {}), CancellationToken::new())
            .await
            .unwrap();

        records
            .insert(NewFileRecord {
                id,
                tenant_id,
                collection_id,
                file_name: "guide.pdf".to_string(),
                storage_path: key,
                size: 8,
                content_type: "application/pdf".to_string(),
            })
            .await
            .unwrap();
        let record = records.get(tenant_id, id).await.unwrap().unwrap();

        Fixture {
            records,
            resolver,
            storage,
            record,
        }
    }

    fn dispatcher(f: &Fixture, transport: Arc<ScriptedTransport>) -> ProcessingDispatcher {
        ProcessingDispatcher::new(
            Arc::new(f.resolver.clone()),
            Arc::new(f.records.clone()),
            Arc::new(f.storage.clone()),
            transport,
            DispatchConfig::default(),
        )
    }

    fn endpoint(f: &Fixture, attempts: u32) {
        let mut config =
            WebhookConfig::new(f.record.tenant_id, "knowledge_base", "https://93.184.216.34/jobs");
        config.retry_attempts = attempts;
        config.timeout_seconds = 30;
        f.resolver.upsert(config);
    }

    async fn stored(f: &Fixture) -> FileRecord {
        f.records
            .get(f.record.tenant_id, f.record.id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn first_success_marks_processing() {
        let f = fixture().await;
        endpoint(&f, 3);
        let transport = ScriptedTransport::new(vec![Step::Reply(Ok(202))]);
        let dispatcher = dispatcher(&f, transport.clone());

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert_eq!(stored(&f).await.processing_status, ProcessingStatus::Processing);

        let log = f
            .records
            .list_processing_log(f.record.tenant_id, f.record.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert_eq!(log[0].status_code, Some(202));
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_exhaust_three_attempts() {
        let f = fixture().await;
        endpoint(&f, 3);
        let transport = ScriptedTransport::new(vec![Step::Hang, Step::Hang, Step::Hang]);
        let dispatcher = dispatcher(&f, transport.clone());
        let started = Instant::now();

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls(), 3);
        // Three 30s timeouts plus 1s and 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(93));

        let record = stored(&f).await;
        assert_eq!(record.processing_status, ProcessingStatus::Error);
        assert_eq!(
            record.error_message.as_deref(),
            Some(TransportError::Timeout(Duration::from_secs(30)).to_string().as_str())
        );

        let log = f
            .records
            .list_processing_log(f.record.tenant_id, f.record.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|entry| !entry.success));
        assert_eq!(log[2].attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_server_error() {
        let f = fixture().await;
        endpoint(&f, 3);
        let transport = ScriptedTransport::new(vec![
            Step::Reply(Err(TransportError::Status {
                status: 503,
                body: "busy".to_string(),
            })),
            Step::Reply(Ok(200)),
        ]);
        let dispatcher = dispatcher(&f, transport.clone());

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 2);
        let record = stored(&f).await;
        assert_eq!(record.processing_status, ProcessingStatus::Processing);
        assert_eq!(record.error_message, None);
    }

    #[tokio::test]
    async fn no_endpoint_leaves_record_pending_with_message() {
        let f = fixture().await;
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = dispatcher(&f, transport.clone());

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, docflow_core::models::DispatchStatus::Unconfigured);
        assert_eq!(transport.calls(), 0);
        let record = stored(&f).await;
        assert_eq!(record.processing_status, ProcessingStatus::Pending);
        assert!(!record.error_message.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn inactive_endpoint_is_unconfigured() {
        let f = fixture().await;
        let mut config =
            WebhookConfig::new(f.record.tenant_id, "knowledge_base", "https://93.184.216.34/jobs");
        config.is_active = false;
        f.resolver.upsert(config);
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = dispatcher(&f, transport.clone());

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, docflow_core::models::DispatchStatus::Unconfigured);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn resolver_outage_is_a_failure() {
        let f = fixture().await;
        f.resolver.set_failing(true);
        let dispatcher = dispatcher(&f, ScriptedTransport::new(vec![]));

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, docflow_core::models::DispatchStatus::Failed);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(stored(&f).await.processing_status, ProcessingStatus::Error);
    }

    #[tokio::test]
    async fn private_endpoint_is_rejected_without_calling_it() {
        let f = fixture().await;
        f.resolver.upsert(WebhookConfig::new(
            f.record.tenant_id,
            "knowledge_base",
            "http://10.0.0.8/jobs",
        ));
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = dispatcher(&f, transport.clone());

        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, docflow_core::models::DispatchStatus::Failed);
        assert_eq!(transport.calls(), 0);
        let record = stored(&f).await;
        assert!(record
            .error_message
            .unwrap_or_default()
            .starts_with("Processing endpoint rejected"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_further_attempts() {
        let f = fixture().await;
        endpoint(&f, 5);
        let transport = ScriptedTransport::new(vec![Step::Reply(Err(TransportError::Connect(
            "connection refused".to_string(),
        )))]);
        let dispatcher = dispatcher(&f, transport.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        // The token is already cancelled: nothing is sent.
        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &cancel)
            .await;
        assert_eq!(outcome.attempts, 0);
        assert_eq!(transport.calls(), 0);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let outcome = dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &cancel)
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert!(outcome
            .error
            .unwrap_or_default()
            .starts_with("Dispatch cancelled after 1 attempt(s)"));
    }

    #[tokio::test]
    async fn payload_carries_a_valid_signed_url() {
        let f = fixture().await;
        endpoint(&f, 1);
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = dispatcher(&f, transport.clone());

        dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        let body = transport.bodies.lock().unwrap()[0].clone();
        let payload: ProcessingJobPayload = serde_json::from_str(&body).unwrap();
        assert_eq!(payload.event, JOB_EVENT);
        assert_eq!(payload.file_id, f.record.id);
        assert_eq!(payload.collection_id, f.record.collection_id);
        assert_eq!(
            f.storage.verify_signed_url(&payload.download_url).unwrap(),
            f.record.storage_path
        );
    }

    #[tokio::test]
    async fn completed_record_is_never_regressed() {
        let f = fixture().await;
        f.records
            .update(
                f.record.tenant_id,
                f.record.id,
                FileRecordPatch::status(ProcessingStatus::Completed),
                StatusGuard::Automatic,
            )
            .await
            .unwrap();
        f.resolver.set_failing(true);
        let dispatcher = dispatcher(&f, ScriptedTransport::new(vec![]));

        dispatcher
            .dispatch(&f.record, &dispatcher.scope_for(f.record.tenant_id), &CancellationToken::new())
            .await;

        assert_eq!(stored(&f).await.processing_status, ProcessingStatus::Completed);
    }
}
