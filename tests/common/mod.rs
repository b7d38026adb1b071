#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use delivery_reconciler::{
    AdapterError, CreateState, DeliveryNotification, ExternalStatus, MessageSnapshot,
    MessageType, NotificationPublisher, PollerConfig, PublishError, ReconciliationPoller,
    SqliteStateStore, StateStore, StatusAdapter, StoreError, TrackedMessage, UnixTimeMs,
    UpdateState,
};
use url::Url;
use uuid::Uuid;

// ============================================================================
// Adapter
// ============================================================================

/// Returns whatever was scripted per reference; unscripted references fail
#[derive(Default)]
pub struct ScriptedAdapter {
    responses: Mutex<HashMap<Uuid, Result<Vec<ExternalStatus>, String>>>,
    hang: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, external_ref_id: Uuid, statuses: Vec<ExternalStatus>) {
        self.responses
            .lock()
            .unwrap()
            .insert(external_ref_id, Ok(statuses));
    }

    pub fn fail(&self, external_ref_id: Uuid, reason: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(external_ref_id, Err(reason.to_string()));
    }

    /// Make every fetch wait forever
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl StatusAdapter for ScriptedAdapter {
    async fn fetch_status(
        &self,
        external_ref_id: Uuid,
    ) -> Result<Vec<ExternalStatus>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&external_ref_id)
            .cloned();

        match response {
            Some(Ok(statuses)) => Ok(statuses),
            Some(Err(reason)) => Err(AdapterError::FetchFailure {
                external_ref_id,
                reason,
            }),
            None => Err(AdapterError::FetchFailure {
                external_ref_id,
                reason: "no scripted response".into(),
            }),
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(Uuid, DeliveryNotification)>>,
    payloads: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(Uuid, DeliveryNotification)> {
        self.published.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl NotificationPublisher for RecordingPublisher {
    async fn publish(
        &self,
        external_ref_id: Uuid,
        notification: &DeliveryNotification,
    ) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Failure {
                external_ref_id,
                reason: "Injected failure".into(),
            });
        }

        let payload = notification.to_json()?;
        self.payloads.lock().unwrap().push(payload);
        self.published
            .lock()
            .unwrap()
            .push((external_ref_id, notification.clone()));
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct FailableStore<S: StateStore> {
    inner: S,
    fail_state_changes: AtomicBool,
    fail_mark_polled: AtomicBool,
}

impl<S: StateStore> FailableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_state_changes: AtomicBool::new(false),
            fail_mark_polled: AtomicBool::new(false),
        }
    }

    pub fn set_fail_state_changes(&self, fail: bool) {
        self.fail_state_changes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mark_polled(&self, fail: bool) {
        self.fail_mark_polled.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl<S: StateStore> StateStore for FailableStore<S> {
    async fn create_initial_state(
        &self,
        create: CreateState,
    ) -> Result<MessageSnapshot, StoreError> {
        self.inner.create_initial_state(create).await
    }

    async fn record_state_change(
        &self,
        update: UpdateState,
    ) -> Result<MessageSnapshot, StoreError> {
        if self.fail_state_changes.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("Injected failure".into()));
        }
        self.inner.record_state_change(update).await
    }

    async fn get_snapshot(
        &self,
        external_ref_id: Uuid,
    ) -> Result<Option<MessageSnapshot>, StoreError> {
        self.inner.get_snapshot(external_ref_id).await
    }

    async fn find_pollable(
        &self,
        now: UnixTimeMs,
        min_poll_age: Duration,
        limit: usize,
    ) -> Result<Vec<TrackedMessage>, StoreError> {
        self.inner.find_pollable(now, min_poll_age, limit).await
    }

    async fn mark_polled(
        &self,
        external_ref_ids: &[Uuid],
        now: UnixTimeMs,
    ) -> Result<usize, StoreError> {
        if self.fail_mark_polled.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("Injected failure".into()));
        }
        self.inner.mark_polled(external_ref_ids, now).await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub struct Harness<S: StateStore + 'static> {
    pub store: Arc<S>,
    pub adapter: Arc<ScriptedAdapter>,
    pub publisher: Arc<RecordingPublisher>,
    pub poller: ReconciliationPoller,
}

impl Harness<SqliteStateStore> {
    pub fn new(config: PollerConfig) -> Self {
        Harness::with_store(SqliteStateStore::open_in_memory().unwrap(), config)
    }
}

impl Harness<FailableStore<SqliteStateStore>> {
    pub fn failable(config: PollerConfig) -> Self {
        Harness::with_store(
            FailableStore::new(SqliteStateStore::open_in_memory().unwrap()),
            config,
        )
    }
}

impl<S: StateStore + 'static> Harness<S> {
    pub fn with_store(store: S, config: PollerConfig) -> Self {
        let store = Arc::new(store);
        let adapter = Arc::new(ScriptedAdapter::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let poller = ReconciliationPoller::new(
            store.clone(),
            adapter.clone(),
            publisher.clone(),
            config,
        )
        .unwrap();

        Self {
            store,
            adapter,
            publisher,
            poller,
        }
    }

    pub async fn track(&self, n: usize) -> TrackedMessage {
        let url = Url::parse(&format!("https://dialogs.example.com/api/dialogs/{n}")).unwrap();
        self.store
            .create_initial_state(CreateState::new(MessageType::Dialog, Uuid::new_v4(), url))
            .await
            .unwrap()
            .message
    }

    pub async fn snapshot(&self, external_ref_id: Uuid) -> MessageSnapshot {
        self.store
            .get_snapshot(external_ref_id)
            .await
            .unwrap()
            .unwrap()
    }
}
