use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use docflow_core::models::{
    FileRecord, FileRecordPatch, NewFileRecord, Pagination, ProcessingLogEntry, RecordChange,
    RecordFilter, StatusGuard,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::traits::{
    change_matches, ChangeFeed, ChangeFeedError, ChangeStream, FileRecordStore, RecordStoreError,
};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    records: HashMap<Uuid, FileRecord>,
    processing_log: Vec<ProcessingLogEntry>,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next_subscriptions: AtomicU32,
    subscribe_attempts: AtomicU32,
}

/// Record store and change feed backed by process memory.
///
/// Every successful write is published on the change feed as an `{old, new}`
/// pair, the way a database trigger would.
#[derive(Clone)]
pub struct InMemoryRecordStore {
    tables: Arc<Mutex<Tables>>,
    changes: broadcast::Sender<RecordChange>,
    subscribers: Arc<Mutex<Vec<CancellationToken>>>,
    faults: Arc<Faults>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            changes,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Faults::default()),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), RecordStoreError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(RecordStoreError::Unavailable(
                "record store is unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn publish(&self, change: RecordChange) {
        // No receivers is fine: nobody is watching.
        let _ = self.changes.send(change);
    }

    /// Strictly increasing per record, even when the clock does not move.
    fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
        let now = Utc::now();
        if now > previous {
            now
        } else {
            previous + ChronoDuration::microseconds(1)
        }
    }

    /// Make reads and writes fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Refuse the next `n` subscription attempts.
    pub fn fail_next_subscriptions(&self, n: u32) {
        self.faults.fail_next_subscriptions.store(n, Ordering::SeqCst);
    }

    pub fn subscribe_attempts(&self) -> u32 {
        self.faults.subscribe_attempts.load(Ordering::SeqCst)
    }

    /// Drop every live subscription with a connection error.
    pub fn disconnect_subscribers(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for token in subscribers.drain(..) {
            token.cancel();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|token| !token.is_cancelled());
        subscribers.len()
    }

    /// Publish a raw change without touching the tables (replays, duplicates).
    pub fn inject_change(&self, change: RecordChange) {
        self.publish(change);
    }

    /// Insert a fully formed record, bypassing `insert`'s defaults.
    pub fn seed(&self, record: FileRecord) {
        self.tables().records.insert(record.id, record);
    }
}

#[async_trait]
impl FileRecordStore for InMemoryRecordStore {
    async fn insert(&self, record: NewFileRecord) -> Result<Uuid, RecordStoreError> {
        self.check_available()?;
        let record = record.into_record(Utc::now());
        let id = record.id;
        {
            let mut tables = self.tables();
            if tables.records.contains_key(&id) {
                return Err(RecordStoreError::Conflict(id));
            }
            tables.records.insert(id, record.clone());
        }
        tracing::debug!(record_id = %id, "File record inserted");
        self.publish(RecordChange {
            old: None,
            new: Some(record),
        });
        Ok(id)
    }

    async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: FileRecordPatch,
        guard: StatusGuard,
    ) -> Result<FileRecord, RecordStoreError> {
        self.check_available()?;
        let (old, new, changed) = {
            let mut tables = self.tables();
            let record = tables
                .records
                .get_mut(&id)
                .filter(|r| r.tenant_id == tenant_id)
                .ok_or(RecordStoreError::NotFound(id))?;
            let old = record.clone();
            let now = Self::next_timestamp(old.updated_at);
            let changed = patch.apply_to(record, guard, now);
            (old, record.clone(), changed)
        };

        if changed {
            self.publish(RecordChange {
                old: Some(old),
                new: Some(new.clone()),
            });
        } else if patch.processing_status.is_some() {
            tracing::debug!(
                record_id = %id,
                status = %new.processing_status,
                "Automatic status write ignored for completed record"
            );
        }
        Ok(new)
    }

    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<FileRecord>, RecordStoreError> {
        self.check_available()?;
        Ok(self
            .tables()
            .records
            .get(&id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        pagination: Pagination,
    ) -> Result<Vec<FileRecord>, RecordStoreError> {
        self.check_available()?;
        let mut rows: Vec<FileRecord> = self
            .tables()
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows
            .into_iter()
            .skip(pagination.offset.max(0) as usize)
            .take(pagination.limit.max(0) as usize)
            .collect())
    }

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, RecordStoreError> {
        self.check_available()?;
        let removed = {
            let mut tables = self.tables();
            match tables.records.get(&id) {
                Some(r) if r.tenant_id == tenant_id => tables.records.remove(&id),
                _ => None,
            }
        };
        match removed {
            Some(old) => {
                self.publish(RecordChange {
                    old: Some(old),
                    new: None,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_processing_log(
        &self,
        entry: ProcessingLogEntry,
    ) -> Result<(), RecordStoreError> {
        self.check_available()?;
        self.tables().processing_log.push(entry);
        Ok(())
    }

    async fn list_processing_log(
        &self,
        tenant_id: Uuid,
        file_id: Uuid,
    ) -> Result<Vec<ProcessingLogEntry>, RecordStoreError> {
        self.check_available()?;
        Ok(self
            .tables()
            .processing_log
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.file_id == file_id)
            .cloned()
            .collect())
    }
}

struct FeedState {
    receiver: broadcast::Receiver<RecordChange>,
    token: CancellationToken,
    _guard: DropGuard,
    filter: RecordFilter,
    done: bool,
}

#[async_trait]
impl ChangeFeed for InMemoryRecordStore {
    async fn subscribe(&self, filter: &RecordFilter) -> Result<ChangeStream, ChangeFeedError> {
        self.faults.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .faults
            .fail_next_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChangeFeedError::Connect("connection refused".to_string()));
        }

        let receiver = self.changes.subscribe();
        let token = CancellationToken::new();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(token.clone());

        // Dropping the stream releases the subscriber slot.
        let state = FeedState {
            receiver,
            _guard: token.clone().drop_guard(),
            token,
            filter: filter.clone(),
            done: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                tokio::select! {
                    biased;
                    _ = state.token.cancelled() => {
                        let err = ChangeFeedError::Closed("connection reset by peer".to_string());
                        state.done = true;
                        return Some((Err(err), state));
                    }
                    received = state.receiver.recv() => match received {
                        Ok(change) if change_matches(&state.filter, &change) => {
                            return Some((Ok(change), state));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            state.done = true;
                            return Some((Err(ChangeFeedError::Lagged(skipped)), state));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
