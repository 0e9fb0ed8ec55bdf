use chrono::Utc;
use docflow_core::backoff;
use docflow_core::config::SyncConfig;
use docflow_core::models::{
    ConnState, ConnectivityEvent, FileRecord, Pagination, RecordFilter, SubscriptionState,
    SyncScope, SyncUpdate,
};
use docflow_db::{ChangeFeed, ChangeStream, FileRecordStore, RecordStoreError};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::merger::DeltaMerger;

const UPDATE_BUFFER: usize = 256;
const CONNECTIVITY_BUFFER: usize = 32;

/// Keeps one scope's view of the record store current: a snapshot, then
/// deltas from the change feed, reconnecting with exponential backoff.
#[derive(Clone)]
pub struct StatusSynchronizer {
    records: Arc<dyn FileRecordStore>,
    feed: Arc<dyn ChangeFeed>,
    config: SyncConfig,
}

/// A live subscription. Dropping it stops the background task.
pub struct SyncHandle {
    scope: SyncScope,
    updates: mpsc::Receiver<SyncUpdate>,
    connectivity: mpsc::Receiver<ConnectivityEvent>,
    outputs: Outputs,
    state: Arc<Mutex<SubscriptionState>>,
    merger: Arc<Mutex<DeltaMerger>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Either output of a handle, for callers that watch both.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Update(SyncUpdate),
    Connectivity(ConnectivityEvent),
}

#[derive(Clone)]
struct Outputs {
    updates: mpsc::Sender<SyncUpdate>,
    connectivity: mpsc::Sender<ConnectivityEvent>,
}

impl StatusSynchronizer {
    pub fn new(
        records: Arc<dyn FileRecordStore>,
        feed: Arc<dyn ChangeFeed>,
        config: SyncConfig,
    ) -> Self {
        Self {
            records,
            feed,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start watching `scope`. The first update on the handle is always a
    /// snapshot of every record in scope.
    pub fn start(&self, scope: SyncScope) -> SyncHandle {
        let (update_tx, updates) = mpsc::channel(UPDATE_BUFFER);
        let (connectivity_tx, connectivity) = mpsc::channel(CONNECTIVITY_BUFFER);
        let mut handle = SyncHandle {
            state: Arc::new(Mutex::new(SubscriptionState::new(scope.clone()))),
            scope,
            updates,
            connectivity,
            outputs: Outputs {
                updates: update_tx,
                connectivity: connectivity_tx,
            },
            merger: Arc::new(Mutex::new(DeltaMerger::new())),
            stop: CancellationToken::new(),
            task: None,
        };
        self.spawn(&mut handle);
        handle
    }

    /// Tear the subscription down and discard its state.
    pub async fn stop(&self, mut handle: SyncHandle) {
        handle.stop.cancel();
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Synchronizer task ended abnormally");
            }
        }
        tracing::info!(tenant_id = %handle.scope.tenant_id, "Synchronizer stopped");
    }

    /// Restart a subscription that gave up after exhausting its reconnect
    /// attempts. Returns `false` if it is still running.
    pub fn reconnect(&self, handle: &mut SyncHandle) -> bool {
        if handle.is_running() {
            return false;
        }
        {
            let mut state = lock(&handle.state);
            state.consecutive_failures = 0;
            state.last_error = None;
        }
        handle.stop = CancellationToken::new();
        self.spawn(handle);
        true
    }

    fn spawn(&self, handle: &mut SyncHandle) {
        let runner = ScopeRunner {
            records: Arc::clone(&self.records),
            feed: Arc::clone(&self.feed),
            config: self.config.clone(),
            scope: handle.scope.clone(),
            filter: handle.scope.filter(),
            outputs: handle.outputs.clone(),
            state: Arc::clone(&handle.state),
            merger: Arc::clone(&handle.merger),
            stop: handle.stop.clone(),
        };
        handle.task = Some(tokio::spawn(runner.run()));
    }
}

impl SyncHandle {
    pub fn scope(&self) -> &SyncScope {
        &self.scope
    }

    /// Current connectivity bookkeeping.
    pub fn state(&self) -> SubscriptionState {
        lock(&self.state).clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn next_update(&mut self) -> Option<SyncUpdate> {
        self.updates.recv().await
    }

    pub fn try_next_update(&mut self) -> Option<SyncUpdate> {
        self.updates.try_recv().ok()
    }

    pub async fn next_connectivity(&mut self) -> Option<ConnectivityEvent> {
        self.connectivity.recv().await
    }

    pub fn try_next_connectivity(&mut self) -> Option<ConnectivityEvent> {
        self.connectivity.try_recv().ok()
    }

    /// Next record update or connectivity event, whichever comes first.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        tokio::select! {
            Some(update) = self.updates.recv() => Some(SyncEvent::Update(update)),
            Some(event) = self.connectivity.recv() => Some(SyncEvent::Connectivity(event)),
            else => None,
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Pump {
    Stopped,
    Failed(String),
}

struct ScopeRunner {
    records: Arc<dyn FileRecordStore>,
    feed: Arc<dyn ChangeFeed>,
    config: SyncConfig,
    scope: SyncScope,
    filter: RecordFilter,
    outputs: Outputs,
    state: Arc<Mutex<SubscriptionState>>,
    merger: Arc<Mutex<DeltaMerger>>,
    stop: CancellationToken,
}

impl ScopeRunner {
    #[tracing::instrument(skip_all, fields(tenant_id = %self.scope.tenant_id, collection_id = ?self.scope.collection_id))]
    async fn run(self) {
        if !self.set_state(ConnState::Connecting, None).await {
            return;
        }

        // Reconnect attempts since the last message actually received.
        let mut attempt: u32 = 0;
        let mut stream = match self.connect().await {
            Ok(stream) => Some(stream),
            Err(err) => {
                self.record_failure(&err);
                None
            }
        };

        loop {
            if let Some(live) = stream.take() {
                if !self.set_state(ConnState::Connected, None).await {
                    return;
                }
                match self.pump(live, &mut attempt).await {
                    Pump::Stopped => return,
                    Pump::Failed(err) => {
                        self.record_failure(&err);
                        if !self.set_state(ConnState::Degraded, Some(err)).await {
                            return;
                        }
                    }
                }
            }

            if attempt >= self.config.max_attempts {
                self.give_up(attempt).await;
                return;
            }
            if !self.set_state(ConnState::Reconnecting, None).await {
                return;
            }

            let delay = backoff::exponential(self.config.backoff_base, self.config.backoff_cap, attempt);
            tracing::info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting change feed");
            if self.config.poll_fallback && !self.poll_once().await {
                return;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            match self.connect().await {
                Ok(live) => stream = Some(live),
                Err(err) => self.record_failure(&err),
            }
        }
    }

    /// Subscribe, then read the snapshot (first connect) or catch up on what
    /// was missed (reconnect). Subscribing first means nothing falls in the gap;
    /// the merger drops the overlap.
    async fn connect(&self) -> Result<ChangeStream, String> {
        let stream = self
            .feed
            .subscribe(&self.filter)
            .await
            .map_err(|e| e.to_string())?;

        let seeded = lock(&self.merger).is_seeded();
        if seeded {
            if !self.catch_up().await.map_err(|e| e.to_string())? {
                return Err("stopped".to_string());
            }
        } else {
            let records = read_all(self.records.as_ref(), &self.filter, self.config.snapshot_page_size)
                .await
                .map_err(|e| e.to_string())?;
            tracing::info!(records = records.len(), "Snapshot loaded");
            lock(&self.merger).seed(&records);
            self.touch();
            self.emit_update(SyncUpdate::Snapshot(records)).await;
        }
        Ok(stream)
    }

    async fn pump(&self, mut stream: ChangeStream, attempt: &mut u32) -> Pump {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Pump::Stopped,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(change)) => {
                    if *attempt > 0 {
                        tracing::info!(attempts = *attempt, "Change feed healthy again");
                        *attempt = 0;
                        lock(&self.state).consecutive_failures = 0;
                    }
                    self.touch();
                    let delta = lock(&self.merger).apply(change);
                    if let Some(delta) = delta {
                        if !self.emit_update(SyncUpdate::Delta(delta)).await {
                            return Pump::Stopped;
                        }
                    }
                }
                Some(Err(err)) => return Pump::Failed(err.to_string()),
                None => return Pump::Failed("change feed closed".to_string()),
            }
        }
    }

    /// Re-read the scope and emit whatever changed while the feed was down.
    /// Returns `false` once stopped.
    async fn catch_up(&self) -> Result<bool, RecordStoreError> {
        let records = read_all(self.records.as_ref(), &self.filter, self.config.snapshot_page_size).await?;
        self.touch();
        for record in records {
            let delta = lock(&self.merger).observe(record);
            if let Some(delta) = delta {
                if !self.emit_update(SyncUpdate::Delta(delta)).await {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// One poll of the record store while the feed is down. Poll errors are
    /// logged and otherwise ignored. Returns `false` once stopped.
    async fn poll_once(&self) -> bool {
        match self.catch_up().await {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!(error = %e, "Polling fallback failed");
                lock(&self.state).last_error = Some(e.to_string());
                !self.stop.is_cancelled()
            }
        }
    }

    fn touch(&self) {
        lock(&self.state).last_update_at = Some(Utc::now());
    }

    fn record_failure(&self, error: &str) {
        let failures = {
            let mut state = lock(&self.state);
            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
            state.consecutive_failures
        };
        tracing::warn!(error = %error, consecutive_failures = failures, "Change feed failure");
    }

    async fn give_up(&self, attempts: u32) {
        tracing::error!(attempts, "Giving up on change feed; manual reconnect required");
        let event = {
            let mut state = lock(&self.state);
            state.state = ConnState::Disconnected;
            state.connected = false;
            connectivity_event(&state, true)
        };
        self.emit_connectivity(event).await;
    }

    /// Move to `next` and announce it. Repeated states are not re-announced.
    /// Returns `false` once stopped.
    async fn set_state(&self, next: ConnState, error: Option<String>) -> bool {
        let event = {
            let mut state = lock(&self.state);
            if let Some(error) = error {
                state.last_error = Some(error);
            }
            if state.state == next {
                None
            } else {
                state.state = next;
                state.connected = next.is_connected();
                Some(connectivity_event(&state, false))
            }
        };
        match event {
            Some(event) => {
                tracing::debug!(state = %next, "Connectivity changed");
                self.emit_connectivity(event).await
            }
            None => !self.stop.is_cancelled(),
        }
    }

    async fn emit_update(&self, update: SyncUpdate) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            sent = self.outputs.updates.send(update) => sent.is_ok(),
        }
    }

    async fn emit_connectivity(&self, event: ConnectivityEvent) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            sent = self.outputs.connectivity.send(event) => sent.is_ok(),
        }
    }
}

fn connectivity_event(state: &SubscriptionState, max_reconnects_exceeded: bool) -> ConnectivityEvent {
    ConnectivityEvent {
        state: state.state,
        connected: state.connected,
        last_error: state.last_error.clone(),
        max_reconnects_exceeded,
        at: Utc::now(),
    }
}

/// Page through every record matching `filter`.
pub(crate) async fn read_all(
    records: &dyn FileRecordStore,
    filter: &RecordFilter,
    page_size: i64,
) -> Result<Vec<FileRecord>, RecordStoreError> {
    let mut page = Pagination::new(page_size, 0);
    let mut all = Vec::new();
    loop {
        let batch = records.query(filter, page).await?;
        let len = batch.len() as i64;
        all.extend(batch);
        if len < page.limit {
            return Ok(all);
        }
        page = page.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::models::{
        DeltaKind, FileRecordPatch, NewFileRecord, ProcessingStatus, StatusGuard,
    };
    use docflow_db::InMemoryRecordStore;
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn synchronizer(store: &Arc<InMemoryRecordStore>, config: SyncConfig) -> StatusSynchronizer {
        StatusSynchronizer::new(store.clone(), store.clone(), config)
    }

    fn no_polling() -> SyncConfig {
        SyncConfig {
            poll_fallback: false,
            ..SyncConfig::default()
        }
    }

    async fn insert(store: &InMemoryRecordStore, tenant_id: Uuid, name: &str) -> Uuid {
        store
            .insert(NewFileRecord {
                id: Uuid::new_v4(),
                tenant_id,
                collection_id: Uuid::new_v4(),
                file_name: name.to_string(),
                storage_path: format!("documents/{}", name),
                size: 10,
                content_type: "text/plain".to_string(),
            })
            .await
            .unwrap()
    }

    async fn set_status(store: &InMemoryRecordStore, tenant_id: Uuid, id: Uuid, status: ProcessingStatus) {
        store
            .update(tenant_id, id, FileRecordPatch::status(status), StatusGuard::Automatic)
            .await
            .unwrap();
    }

    async fn expect_state(handle: &mut SyncHandle, state: ConnState) -> ConnectivityEvent {
        let event = tokio::time::timeout(Duration::from_secs(120), handle.next_connectivity())
            .await
            .expect("connectivity event")
            .expect("channel open");
        assert_eq!(event.state, state, "{:?}", event);
        event
    }

    async fn expect_delta(handle: &mut SyncHandle) -> docflow_core::models::FileRecordDelta {
        match tokio::time::timeout(Duration::from_secs(120), handle.next_update()).await {
            Ok(Some(SyncUpdate::Delta(delta))) => delta,
            other => panic!("expected a delta, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_comes_first_then_deltas() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let existing = insert(&store, tenant, "a.txt").await;
        insert(&store, Uuid::new_v4(), "other-tenant.txt").await;

        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(tenant));
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;

        match handle.next_update().await {
            Some(SyncUpdate::Snapshot(records)) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].id, existing);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        set_status(&store, tenant, existing, ProcessingStatus::Processing).await;
        let delta = expect_delta(&mut handle).await;
        assert_eq!(delta.record_id, existing);
        assert_eq!(
            delta.kind,
            DeltaKind::StatusTransition {
                from: ProcessingStatus::Pending,
                to: ProcessingStatus::Processing
            }
        );

        let added = insert(&store, tenant, "b.txt").await;
        let delta = expect_delta(&mut handle).await;
        assert_eq!((delta.record_id, delta.kind), (added, DeltaKind::Inserted));

        assert!(handle.state().connected);
        assert!(handle.state().last_update_at.is_some());
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_exponential_backoff() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(tenant));
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;

        store.fail_next_subscriptions(1);
        let dropped_at = Instant::now();
        store.disconnect_subscribers();

        let degraded = expect_state(&mut handle, ConnState::Degraded).await;
        assert!(!degraded.connected);
        assert!(degraded.last_error.is_some());
        expect_state(&mut handle, ConnState::Reconnecting).await;
        expect_state(&mut handle, ConnState::Connected).await;

        // 2s before the refused attempt, 4s before the one that succeeds.
        assert!(dropped_at.elapsed() >= Duration::from_secs(6));
        assert!(dropped_at.elapsed() < Duration::from_secs(7));
        assert_eq!(store.subscribe_attempts(), 3);
        assert!(handle.try_next_connectivity().is_none());
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_until_manual_reconnect() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(Uuid::new_v4()));
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;

        store.fail_next_subscriptions(100);
        store.disconnect_subscribers();
        expect_state(&mut handle, ConnState::Degraded).await;
        expect_state(&mut handle, ConnState::Reconnecting).await;
        let terminal = expect_state(&mut handle, ConnState::Disconnected).await;
        assert!(terminal.max_reconnects_exceeded);
        assert_eq!(store.subscribe_attempts(), 1 + sync.config().max_attempts);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(store.subscribe_attempts(), 1 + sync.config().max_attempts);
        assert!(!handle.is_running());

        store.fail_next_subscriptions(0);
        assert!(sync.reconnect(&mut handle));
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;
        assert!(!sync.reconnect(&mut handle));
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_message_after_reconnect_resets_backoff() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(tenant));
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;
        assert!(matches!(handle.next_update().await, Some(SyncUpdate::Snapshot(_))));

        store.fail_next_subscriptions(2);
        store.disconnect_subscribers();
        expect_state(&mut handle, ConnState::Degraded).await;
        expect_state(&mut handle, ConnState::Reconnecting).await;
        expect_state(&mut handle, ConnState::Connected).await;
        assert_eq!(handle.state().consecutive_failures, 3);

        insert(&store, tenant, "fresh.txt").await;
        expect_delta(&mut handle).await;
        assert_eq!(handle.state().consecutive_failures, 0);

        // Back to the base delay.
        let dropped_at = Instant::now();
        store.disconnect_subscribers();
        expect_state(&mut handle, ConnState::Degraded).await;
        expect_state(&mut handle, ConnState::Reconnecting).await;
        expect_state(&mut handle, ConnState::Connected).await;
        assert!(dropped_at.elapsed() < Duration::from_secs(3));
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn polls_while_the_feed_is_down() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = insert(&store, tenant, "a.txt").await;
        let sync = synchronizer(&store, SyncConfig::default());
        let mut handle = sync.start(SyncScope::tenant(tenant));
        assert!(matches!(handle.next_update().await, Some(SyncUpdate::Snapshot(_))));

        store.fail_next_subscriptions(3);
        store.disconnect_subscribers();
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;
        expect_state(&mut handle, ConnState::Degraded).await;
        expect_state(&mut handle, ConnState::Reconnecting).await;

        set_status(&store, tenant, id, ProcessingStatus::Completed).await;
        let delta = expect_delta(&mut handle).await;
        assert_eq!(
            delta.kind,
            DeltaKind::StatusTransition {
                from: ProcessingStatus::Pending,
                to: ProcessingStatus::Completed
            }
        );
        assert!(!handle.state().connected);

        // The same version is not delivered again once the feed is back.
        expect_state(&mut handle, ConnState::Connected).await;
        assert!(handle.try_next_update().is_none());
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn catches_up_on_changes_missed_while_down() {
        let store = Arc::new(InMemoryRecordStore::new());
        let tenant = Uuid::new_v4();
        let id = insert(&store, tenant, "a.txt").await;
        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(tenant));
        assert!(matches!(handle.next_update().await, Some(SyncUpdate::Snapshot(_))));

        store.disconnect_subscribers();
        set_status(&store, tenant, id, ProcessingStatus::Processing).await;

        let delta = expect_delta(&mut handle).await;
        assert_eq!(delta.record_id, id);
        assert!(delta.is_status_transition());
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn next_event_yields_both_outputs() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(Uuid::new_v4()));

        let mut states = Vec::new();
        let mut snapshot = false;
        while states.len() < 2 || !snapshot {
            match handle.next_event().await {
                Some(SyncEvent::Update(SyncUpdate::Snapshot(records))) => {
                    assert!(records.is_empty());
                    snapshot = true;
                }
                Some(SyncEvent::Connectivity(event)) => states.push(event.state),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(states, vec![ConnState::Connecting, ConnState::Connected]);
        sync.stop(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_the_subscription() {
        let store = Arc::new(InMemoryRecordStore::new());
        let sync = synchronizer(&store, no_polling());
        let mut handle = sync.start(SyncScope::tenant(Uuid::new_v4()));
        expect_state(&mut handle, ConnState::Connecting).await;
        expect_state(&mut handle, ConnState::Connected).await;
        assert_eq!(store.subscriber_count(), 1);

        sync.stop(handle).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.subscriber_count(), 0);
    }
}
