//! Upload queue
//!
//! Tasks live in one table guarded by a mutex. Workers take the head of the
//! FIFO and move it to `Validating` under that same lock, so a task that is
//! cancelled while queued can never start. Retried tasks go to the tail.
//!
//! Shutdown: [`UploadQueue::shutdown`] stops workers from taking new tasks and
//! waits for the ones in flight to settle.

use chrono::Utc;
use docflow_core::backoff;
use docflow_core::models::{
    Destination, FileTask, ProgressEvent, SourceFile, TaskFailureKind, TaskHandle, TaskSnapshot,
    TaskStatus,
};
use docflow_core::{IngestError, IngestResult, UploadConfig};
use docflow_db::FileRecordStore;
use docflow_processing::DocumentValidator;
use docflow_storage::Storage;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::DispatchContext;
use crate::pipeline;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub(crate) struct TaskEntry {
    pub(crate) task: FileTask,
    pub(crate) cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) tasks: HashMap<Uuid, TaskEntry>,
    order: Vec<Uuid>,
    pending: VecDeque<Uuid>,
}

/// State shared between the queue handle, its workers and retry timers.
pub(crate) struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    /// Signalled whenever a task settles or drops a pending retry.
    settled: Notify,
    events: broadcast::Sender<ProgressEvent>,
    shutdown: CancellationToken,
    pub(crate) validator: DocumentValidator,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) records: Arc<dyn FileRecordStore>,
    pub(crate) dispatcher: Arc<dyn DispatchContext>,
    pub(crate) config: UploadConfig,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, task: &FileTask) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(ProgressEvent {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            error: task.last_error.clone(),
            message: task.message.clone(),
            at: Utc::now(),
        });
    }

    /// Move `task` to `next` and publish the change. Illegal moves are dropped.
    pub(crate) fn set_status(&self, task: &mut FileTask, next: TaskStatus) -> bool {
        if !task.can_transition_to(next) {
            tracing::warn!(
                task_id = %task.id,
                from = %task.status,
                to = %next,
                "Ignoring out-of-order task transition"
            );
            return false;
        }
        task.status = next;
        let now = Utc::now();
        match next {
            TaskStatus::Validating => task.started_at = Some(now),
            TaskStatus::Queued => task.ended_at = None,
            TaskStatus::Cancelled => {
                task.retry_scheduled_at = None;
                task.ended_at = Some(now);
            }
            status if status.is_terminal() && task.retry_scheduled_at.is_none() => {
                task.ended_at = Some(now)
            }
            _ => {}
        }
        tracing::debug!(task_id = %task.id, status = %task.status, "Task status changed");
        self.emit(task);
        if next.is_terminal() {
            self.settled.notify_waiters();
        }
        true
    }

    fn push_pending(&self, state: &mut QueueState, id: Uuid) {
        state.pending.push_back(id);
        self.wake.notify_one();
    }

    /// Pop the next runnable task and claim it for a worker.
    fn take_next(&self) -> Option<(FileTask, CancellationToken)> {
        let mut state = self.lock();
        while let Some(id) = state.pending.pop_front() {
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };
            if entry.task.status != TaskStatus::Queued || entry.cancel.is_cancelled() {
                continue;
            }
            self.set_status(&mut entry.task, TaskStatus::Validating);
            return Some((entry.task.clone(), entry.cancel.clone()));
        }
        None
    }

    /// Apply `f` to a task under the lock.
    pub(crate) fn with_task<R>(&self, id: Uuid, f: impl FnOnce(&Self, &mut TaskEntry) -> R) -> Option<R> {
        let mut state = self.lock();
        state.tasks.get_mut(&id).map(|entry| f(self, entry))
    }

    pub(crate) fn report_progress(&self, id: Uuid, percent: u8) {
        self.with_task(id, |shared, entry| {
            if entry.task.status == TaskStatus::Uploading && percent > entry.task.progress {
                entry.task.progress = percent;
                shared.emit(&entry.task);
            }
        });
    }

    pub(crate) fn mark_cancelled(&self, id: Uuid) {
        self.with_task(id, |shared, entry| {
            shared.set_status(&mut entry.task, TaskStatus::Cancelled);
        });
        tracing::info!(task_id = %id, "Task cancelled");
    }

    /// Terminal failure with no automatic retry.
    pub(crate) fn mark_failed(&self, id: Uuid, kind: TaskFailureKind, error: String) {
        self.with_task(id, |shared, entry| {
            entry.task.failure_kind = Some(kind);
            entry.task.last_error = Some(error);
            entry.task.retry_scheduled_at = None;
            shared.set_status(&mut entry.task, TaskStatus::Failed);
        });
    }

    /// Record a transport failure and either schedule an automatic retry or
    /// settle in `Failed` once the cap is reached.
    pub(crate) fn transport_failed(self: &Arc<Self>, id: Uuid, error: String) {
        let scheduled = self.with_task(id, |shared, entry| {
            if entry.cancel.is_cancelled() {
                shared.set_status(&mut entry.task, TaskStatus::Cancelled);
                return None;
            }
            let task = &mut entry.task;
            task.failure_kind = Some(TaskFailureKind::Transport);
            task.last_error = Some(error.clone());

            if task.retry_count >= shared.config.max_retries {
                task.retry_scheduled_at = None;
                shared.set_status(task, TaskStatus::Failed);
                tracing::warn!(
                    task_id = %id,
                    retry_count = task.retry_count,
                    error = %error,
                    "Upload failed, retries exhausted"
                );
                return None;
            }

            task.retry_count += 1;
            let delay = backoff::linear(shared.config.retry_base_delay, task.retry_count);
            task.retry_scheduled_at = Some(
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            );
            shared.set_status(task, TaskStatus::Failed);
            tracing::warn!(
                task_id = %id,
                attempt = task.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Upload failed, retry scheduled"
            );
            Some((delay, entry.cancel.clone()))
        });

        if let Some(Some((delay, cancel))) = scheduled {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = shared.shutdown.cancelled() => shared.abandon_retry(id),
                    _ = tokio::time::sleep(delay) => shared.requeue_after_backoff(id),
                }
            });
        }
    }

    fn requeue_after_backoff(&self, id: Uuid) {
        let mut state = self.lock();
        let Some(entry) = state.tasks.get_mut(&id) else {
            return;
        };
        if entry.task.status != TaskStatus::Failed
            || entry.task.retry_scheduled_at.is_none()
            || entry.cancel.is_cancelled()
        {
            return;
        }
        entry.task.retry_scheduled_at = None;
        entry.task.progress = 0;
        if self.set_status(&mut entry.task, TaskStatus::Queued) {
            self.push_pending(&mut state, id);
        }
    }

    fn abandon_retry(&self, id: Uuid) {
        self.with_task(id, |shared, entry| {
            if entry.task.retry_scheduled_at.take().is_some() {
                entry.task.ended_at = Some(Utc::now());
                shared.settled.notify_waiters();
            }
        });
    }
}

/// Bounded-concurrency upload queue.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct UploadQueue {
    shared: Arc<Shared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl UploadQueue {
    /// Create the queue and spawn `config.pool_size` workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: UploadConfig,
        storage: Arc<dyn Storage>,
        records: Arc<dyn FileRecordStore>,
        dispatcher: Arc<dyn DispatchContext>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pool_size = config.pool_size.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            settled: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
            validator: DocumentValidator::from_config(&config),
            storage,
            records,
            dispatcher,
            config,
        });

        let workers = (0..pool_size)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                tokio::spawn(worker_loop(shared, worker))
            })
            .collect();

        tracing::info!(pool_size, "Upload queue started");

        Self {
            shared,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.shared.config
    }

    /// Validate and enqueue a batch for one destination.
    ///
    /// Rejected files come back as `Failed` handles and never take a worker.
    #[tracing::instrument(skip(self, files), fields(tenant_id = %destination.tenant_id, files = files.len()))]
    pub fn enqueue_batch(
        &self,
        files: Vec<SourceFile>,
        destination: Destination,
    ) -> IngestResult<Vec<TaskHandle>> {
        if self.shared.shutdown.is_cancelled() {
            return Err(IngestError::Internal("upload queue is shut down".to_string()));
        }

        let mut state = self.shared.lock();
        let mut handles = Vec::with_capacity(files.len());

        for file in files {
            let verdict = self.shared.validator.validate_source(&file);
            let mut task = FileTask::new(file, destination.clone());
            let id = task.id;
            self.shared.emit(&task);

            match verdict {
                Ok(accepted) => {
                    task.source.content_type = accepted.content_type;
                    state.order.push(id);
                    state.tasks.insert(
                        id,
                        TaskEntry {
                            task: task.clone(),
                            cancel: CancellationToken::new(),
                        },
                    );
                    self.shared.push_pending(&mut state, id);
                }
                Err(reason) => {
                    tracing::debug!(task_id = %id, file_name = %task.file_name(), reason = %reason, "File rejected");
                    task.failure_kind = Some(TaskFailureKind::Validation);
                    task.last_error = Some(reason.to_string());
                    self.shared.set_status(&mut task, TaskStatus::Failed);
                    state.order.push(id);
                    state.tasks.insert(
                        id,
                        TaskEntry {
                            task: task.clone(),
                            cancel: CancellationToken::new(),
                        },
                    );
                }
            }
            handles.push(task.handle());
        }

        Ok(handles)
    }

    /// Snapshot of every known task, in submission order.
    pub fn progress(&self) -> Vec<TaskSnapshot> {
        let state = self.shared.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(|entry| entry.task.snapshot())
            .collect()
    }

    pub fn task(&self, id: Uuid) -> Option<TaskSnapshot> {
        self.shared.lock().tasks.get(&id).map(|entry| entry.task.snapshot())
    }

    /// Cancel a task. Queued tasks and failed ones waiting on an automatic
    /// retry are removed at once; in-flight tasks are signalled and become
    /// `Cancelled` when the worker acknowledges. Cancelling a cancelled task is
    /// a no-op. Settled failures keep their outcome.
    pub fn cancel(&self, id: Uuid) -> IngestResult<TaskSnapshot> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let entry = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| IngestError::NotFound(format!("task {}", id)))?;

        match entry.task.status {
            TaskStatus::Cancelled => {}
            TaskStatus::Queued | TaskStatus::Succeeded | TaskStatus::Failed => {
                if !entry.task.can_transition_to(TaskStatus::Cancelled) {
                    return Err(IngestError::InvalidState {
                        id,
                        action: "cancel",
                        status: entry.task.status.to_string(),
                    });
                }
                entry.cancel.cancel();
                self.shared.set_status(&mut entry.task, TaskStatus::Cancelled);
                state.pending.retain(|pending| *pending != id);
                tracing::info!(task_id = %id, "Task cancelled");
            }
            TaskStatus::Validating | TaskStatus::Uploading | TaskStatus::AwaitingProcessing => {
                tracing::info!(task_id = %id, status = %entry.task.status, "Cancelling in-flight task");
                entry.cancel.cancel();
            }
        }
        Ok(entry.task.snapshot())
    }

    /// Re-enqueue a failed task at the tail of the queue.
    ///
    /// Legal only for a `Failed` task with no automatic retry pending, a
    /// retryable failure and `retry_count < max_retries`.
    pub fn retry(&self, id: Uuid) -> IngestResult<TaskHandle> {
        if self.shared.shutdown.is_cancelled() {
            return Err(IngestError::Internal("upload queue is shut down".to_string()));
        }

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let entry = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| IngestError::NotFound(format!("task {}", id)))?;

        if !entry.task.can_retry(self.shared.config.max_retries) {
            return Err(IngestError::InvalidState {
                id,
                action: "retry",
                status: entry.task.status.to_string(),
            });
        }

        let task = &mut entry.task;
        task.retry_count += 1;
        task.progress = 0;
        task.last_error = None;
        task.failure_kind = None;
        task.message = None;
        entry.cancel = CancellationToken::new();
        self.shared.set_status(task, TaskStatus::Queued);
        let handle = task.handle();
        tracing::info!(task_id = %id, retry_count = task.retry_count, "Task re-enqueued");
        self.shared.push_pending(state, id);
        Ok(handle)
    }

    /// Drop finished tasks the UI no longer needs: succeeded, cancelled, and
    /// failed ones that can no longer be retried. Returns how many were removed.
    pub fn prune_finished(&self) -> usize {
        let max_retries = self.shared.config.max_retries;
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let before = state.tasks.len();
        state.tasks.retain(|_, entry| {
            let task = &entry.task;
            match task.status {
                TaskStatus::Succeeded | TaskStatus::Cancelled => false,
                TaskStatus::Failed => {
                    task.retry_scheduled_at.is_some() || task.can_retry(max_retries)
                }
                _ => true,
            }
        });
        let tasks = &state.tasks;
        state.order.retain(|id| tasks.contains_key(id));
        before - state.tasks.len()
    }

    /// Whether a task that has not settled yet owns `record_id`: it is queued,
    /// in flight, or failed with an automatic retry pending. Such a task will
    /// still dispatch the record itself.
    pub fn has_live_task(&self, record_id: Uuid) -> bool {
        self.live_task(record_id).is_some()
    }

    pub fn live_task(&self, record_id: Uuid) -> Option<TaskSnapshot> {
        self.shared
            .lock()
            .tasks
            .values()
            .map(|entry| &entry.task)
            .find(|task| {
                let owns = task.id == record_id || task.record_id == Some(record_id);
                owns && is_busy(task)
            })
            .map(FileTask::snapshot)
    }

    pub fn progress_events(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until no task is queued, in flight or waiting on a retry.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let busy = self
                .shared
                .lock()
                .tasks
                .values()
                .any(|entry| is_busy(&entry.task));
            if !busy {
                return;
            }
            settled.await;
        }
    }

    /// Stop taking new tasks and wait for in-flight ones to settle.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating upload queue shutdown");
        self.shared.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Upload worker ended abnormally");
            }
        }
        tracing::info!("Upload queue stopped");
    }
}

fn is_busy(task: &FileTask) -> bool {
    !task.status.is_terminal() || task.retry_scheduled_at.is_some()
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    tracing::debug!(worker, "Upload worker started");
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        match shared.take_next() {
            Some((task, cancel)) => pipeline::run(&shared, task, cancel).await,
            None => {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
            }
        }
    }
    tracing::debug!(worker, "Upload worker stopped");
}
