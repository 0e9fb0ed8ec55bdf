//! One task's trip through a worker: pre-flight, upload, record, dispatch.
//!
//! Cancellation is checked at every transition. Once the record exists and
//! the task is `AwaitingProcessing`, a cancel only keeps further dispatch
//! attempts from starting.

use docflow_core::models::{
    DispatchOutcome, DispatchScope, DispatchStatus, FileRecord, FileRecordPatch, FileSource,
    FileTask, NewFileRecord, ProcessingStatus, StatusGuard, TaskFailureKind, TaskStatus,
};
use docflow_db::RecordStoreError;
use docflow_storage::{generate_object_key, ObjectReader, ProgressFn, StorageError};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::queue::Shared;

#[tracing::instrument(skip_all, fields(task_id = %task.id, file_name = %task.file_name()))]
pub(crate) async fn run(shared: &Arc<Shared>, task: FileTask, cancel: CancellationToken) {
    let id = task.id;

    if let Err(reason) = preflight(shared, &task).await {
        tracing::info!(reason = %reason, "Pre-flight check failed");
        shared.mark_failed(id, TaskFailureKind::Validation, reason);
        return;
    }
    if !advance(shared, id, TaskStatus::Uploading, &cancel) {
        return;
    }

    let key = generate_object_key(
        task.destination.tenant_id,
        task.destination.collection_id,
        task.id,
        task.file_name(),
    );
    let started = Instant::now();
    match upload(shared, &task, &key, &cancel).await {
        Ok(written) => {
            tracing::info!(
                key = %key,
                size_bytes = written,
                duration_ms = started.elapsed().as_millis() as u64,
                "Upload complete"
            );
        }
        Err(StorageError::Cancelled(_)) => {
            remove_object(shared, &key).await;
            shared.mark_cancelled(id);
            return;
        }
        Err(err) => {
            remove_object(shared, &key).await;
            shared.transport_failed(id, err.to_string());
            return;
        }
    }

    if cancel.is_cancelled() {
        remove_object(shared, &key).await;
        shared.mark_cancelled(id);
        return;
    }

    let record = match record_upload(shared, &task, &key).await {
        Ok(record) => record,
        Err(failure) => {
            tracing::warn!(error = %failure.error, recorded = failure.recorded, "Failed to record upload");
            if !failure.recorded {
                remove_object(shared, &key).await;
            }
            shared.transport_failed(id, failure.error.to_string());
            return;
        }
    };

    let awaiting = shared
        .with_task(id, |shared, entry| {
            entry.task.record_id = Some(record.id);
            entry.task.storage_path = Some(key.clone());
            entry.task.progress = 100;
            shared.set_status(&mut entry.task, TaskStatus::AwaitingProcessing)
        })
        .unwrap_or(false);
    if !awaiting {
        return;
    }
    if cancel.is_cancelled() {
        // The record stays pending; an explicit processing retry picks it up.
        shared.mark_cancelled(id);
        return;
    }

    let scope = DispatchScope::new(task.destination.tenant_id, task.destination.feature.clone());
    let outcome = shared.dispatcher.dispatch(&record, &scope, &cancel).await;
    finish(shared, id, outcome, cancel.is_cancelled());
}

/// Move to `next` unless the task was cancelled, in which case settle it.
fn advance(shared: &Shared, id: Uuid, next: TaskStatus, cancel: &CancellationToken) -> bool {
    shared
        .with_task(id, |shared, entry| {
            if cancel.is_cancelled() {
                shared.set_status(&mut entry.task, TaskStatus::Cancelled);
                return false;
            }
            shared.set_status(&mut entry.task, next)
        })
        .unwrap_or(false)
}

/// Re-check the file right before it is read. Failures here are not retried.
async fn preflight(shared: &Shared, task: &FileTask) -> Result<(), String> {
    shared
        .validator
        .validate_source(&task.source)
        .map_err(|e| e.to_string())?;

    if let FileSource::Path(path) = &task.source.source {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
        if !meta.is_file() {
            return Err(format!("{} is not a regular file", path.display()));
        }
        if meta.len() != task.size() {
            return Err(format!(
                "{} changed size since it was selected ({} -> {} bytes)",
                path.display(),
                task.size(),
                meta.len()
            ));
        }
    }
    Ok(())
}

async fn open_source(task: &FileTask) -> Result<ObjectReader, StorageError> {
    match &task.source.source {
        FileSource::Bytes(data) => Ok(Box::pin(std::io::Cursor::new(Arc::clone(data)))),
        FileSource::Path(path) => {
            let file = tokio::fs::File::open(path).await?;
            Ok(Box::pin(file))
        }
    }
}

async fn upload(
    shared: &Arc<Shared>,
    task: &FileTask,
    key: &str,
    cancel: &CancellationToken,
) -> Result<u64, StorageError> {
    let reader = open_source(task).await?;
    let id = task.id;
    let total = task.size().max(1);
    let progress_target = Arc::clone(shared);
    let on_progress: ProgressFn = Arc::new(move |written| {
        let percent = (written.min(total) * 100 / total) as u8;
        progress_target.report_progress(id, percent);
    });

    shared
        .storage
        .put_object(key, reader, Some(task.size()), on_progress, cancel.clone())
        .await?;
    Ok(task.size())
}

/// A failed record write. `recorded` is set when a record pointing at the
/// object exists anyway, so the object must stay.
struct RecordWriteFailure {
    error: RecordStoreError,
    recorded: bool,
}

/// Create the record, or reset it to `pending` when this is a re-run of a
/// file that was already recorded.
async fn record_upload(
    shared: &Shared,
    task: &FileTask,
    key: &str,
) -> Result<FileRecord, RecordWriteFailure> {
    let recorded = |error| RecordWriteFailure {
        error,
        recorded: true,
    };
    let tenant_id = task.destination.tenant_id;
    let new = NewFileRecord {
        id: task.id,
        tenant_id,
        collection_id: task.destination.collection_id,
        file_name: task.file_name().to_string(),
        storage_path: key.to_string(),
        size: i64::try_from(task.size()).unwrap_or(i64::MAX),
        content_type: task.content_type().to_string(),
    };

    match shared.records.insert(new).await {
        Ok(_) => {}
        Err(RecordStoreError::Conflict(_)) => {
            let patch = FileRecordPatch {
                storage_path: Some(key.to_string()),
                ..FileRecordPatch::status(ProcessingStatus::Pending).clear_error()
            };
            return shared
                .records
                .update(tenant_id, task.id, patch, StatusGuard::Explicit)
                .await
                .map_err(recorded);
        }
        Err(error) => {
            return Err(RecordWriteFailure {
                error,
                recorded: false,
            })
        }
    }

    shared
        .records
        .get(tenant_id, task.id)
        .await
        .map_err(recorded)?
        .ok_or(RecordStoreError::NotFound(task.id))
        .map_err(recorded)
}

async fn remove_object(shared: &Shared, key: &str) {
    if let Err(e) = shared.storage.delete_object(key).await {
        tracing::warn!(key = %key, error = %e, "Failed to remove partial upload");
    }
}

fn finish(shared: &Shared, id: Uuid, outcome: DispatchOutcome, cancelled: bool) {
    tracing::info!(
        status = ?outcome.status,
        attempts = outcome.attempts,
        cancelled,
        "Dispatch finished"
    );
    shared.with_task(id, |shared, entry| {
        let task = &mut entry.task;
        let next = match outcome.status {
            DispatchStatus::Started | DispatchStatus::Unconfigured => {
                task.message = outcome.message.clone();
                TaskStatus::Succeeded
            }
            DispatchStatus::Failed => {
                task.last_error = outcome.error.clone();
                task.failure_kind = Some(TaskFailureKind::Dispatch);
                TaskStatus::Failed
            }
        };
        let next = if cancelled { TaskStatus::Cancelled } else { next };
        shared.set_status(task, next);
    });
}
