//! Reconciliation poller.
//!
//! Selects messages that have no transport state yet, fetches their external
//! status, resolves old and new delivery states and persists legal transitions.
//! Terminal transitions are followed by a best-effort notification.
//!
//! Batches run one after another; reconciliations inside a batch run
//! concurrently, bounded by a semaphore. Every message of a batch that was not
//! cancelled is marked polled in one bulk write once the batch has drained.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{latest_status, StatusAdapter};
use crate::config::PollerConfig;
use crate::error::{PollerError, StoreError};
use crate::evaluator;
use crate::metrics::PollerMetrics;
use crate::model::{DeliveryState, NextStateDecision, TrackedMessage, UnixTimeMs, UpdateState};
use crate::publisher::{DeliveryNotification, NotificationPublisher};
use crate::store::StateStore;

/// What happened to one message during a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Old and new signals resolve to the same state
    Unchanged(DeliveryState),
    Transitioned {
        from: DeliveryState,
        to: DeliveryState,
    },
    /// Evaluation or validation failed; nothing was persisted
    Invalid,
    FetchFailed,
    /// Another reconciliation of the same message committed first; nothing
    /// was persisted by this one
    Superseded,
    /// Cancellation was observed before anything was persisted
    Cancelled,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<(Uuid, ReconcileOutcome)>,
    pub marked_polled: usize,
}

impl BatchReport {
    pub fn outcome_for(&self, external_ref_id: Uuid) -> Option<ReconcileOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == external_ref_id)
            .map(|(_, outcome)| *outcome)
    }
}

pub struct ReconciliationPoller {
    reconciler: Reconciler,
    config: PollerConfig,
    semaphore: Arc<Semaphore>,
}

impl ReconciliationPoller {
    pub fn new(
        store: Arc<dyn StateStore>,
        adapter: Arc<dyn StatusAdapter>,
        publisher: Arc<dyn NotificationPublisher>,
        config: PollerConfig,
    ) -> Result<Self, PollerError> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_reconciliations));

        Ok(Self {
            reconciler: Reconciler {
                store,
                adapter,
                publisher,
                metrics: Arc::new(PollerMetrics::new()),
            },
            config,
            semaphore,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<PollerMetrics>) -> Self {
        self.reconciler.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<PollerMetrics> {
        Arc::clone(&self.reconciler.metrics)
    }

    /// Run cycles until `cancel` fires, pausing `cycle_interval` between them.
    /// A failed cycle is logged and retried after the same pause.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            fetch_limit = self.config.fetch_limit,
            max_concurrency = self.config.max_concurrent_reconciliations,
            "reconciliation poller starting"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(error) = self.run_cycle(&cancel).await {
                error!(error = %error, "reconciliation cycle failed");
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.cycle_interval) => {}
                () = cancel.cancelled() => break,
            }
        }

        info!("reconciliation poller stopped");
    }

    /// Process batches until selection comes back empty or `cancel` fires.
    /// Returns the number of messages processed.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<usize, PollerError> {
        // Fixed for the whole cycle so messages marked during it are not reselected
        let cycle_start = UnixTimeMs::now();
        let mut processed = 0;

        loop {
            if cancel.is_cancelled() {
                info!(processed, "reconciliation cycle cancelled");
                return Ok(processed);
            }

            let batch = self
                .reconciler
                .store
                .find_pollable(cycle_start, self.config.min_poll_age, self.config.fetch_limit)
                .await?;

            if batch.is_empty() {
                break;
            }

            debug!(batch_size = batch.len(), "processing reconciliation batch");
            let report = self.process_batch(batch, cancel).await?;
            processed += report.outcomes.len();
        }

        if processed > 0 {
            info!(processed, "reconciliation cycle exhausted");
        } else {
            debug!("nothing to reconcile");
        }
        Ok(processed)
    }

    /// Reconcile `messages` concurrently and mark them polled.
    ///
    /// Local failures (fetch, evaluation, validation, publish, a lost race on
    /// the same message) are recorded as outcomes. A persistence error does not stop the rest of the batch; the
    /// first one is returned after the batch has been marked polled.
    pub async fn process_batch(
        &self,
        messages: Vec<TrackedMessage>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, PollerError> {
        let batch_ids: Vec<Uuid> = messages.iter().map(|m| m.external_ref_id).collect();
        let mut tasks = JoinSet::new();

        for message in messages {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };
            let reconciler = self.reconciler.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let external_ref_id = message.external_ref_id;
                (external_ref_id, reconciler.reconcile(message, cancel).await)
            });
        }

        let mut outcomes = Vec::with_capacity(batch_ids.len());
        let mut first_error: Option<StoreError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((external_ref_id, Ok(outcome))) => outcomes.push((external_ref_id, outcome)),
                Ok((external_ref_id, Err(err))) => {
                    error!(%external_ref_id, error = %err, "persistence failed during reconciliation");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "reconciliation task failed");
                    first_error.get_or_insert(StoreError::Task(join_err.to_string()));
                }
            }
        }

        let cancelled: HashSet<Uuid> = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == ReconcileOutcome::Cancelled)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = HashSet::with_capacity(batch_ids.len());
        let polled: Vec<Uuid> = batch_ids
            .into_iter()
            .filter(|id| !cancelled.contains(id) && seen.insert(*id))
            .collect();

        let marked_polled = self
            .reconciler
            .store
            .mark_polled(&polled, UnixTimeMs::now())
            .await?;
        debug!(marked_polled, "batch marked polled");

        let metrics = &self.reconciler.metrics;
        PollerMetrics::incr(&metrics.batches_processed);
        PollerMetrics::add(&metrics.messages_polled, marked_polled as u64);

        if let Some(err) = first_error {
            return Err(err.into());
        }

        Ok(BatchReport {
            outcomes,
            marked_polled,
        })
    }

    /// Reconcile a single message without marking it polled.
    pub async fn reconcile_message(
        &self,
        message: TrackedMessage,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, StoreError> {
        self.reconciler.reconcile(message, cancel.clone()).await
    }
}

// ============================================================================
// Per-Message Reconciliation
// ============================================================================

#[derive(Clone)]
struct Reconciler {
    store: Arc<dyn StateStore>,
    adapter: Arc<dyn StatusAdapter>,
    publisher: Arc<dyn NotificationPublisher>,
    metrics: Arc<PollerMetrics>,
}

impl Reconciler {
    #[instrument(skip(self, message, cancel), fields(external_ref_id = %message.external_ref_id))]
    async fn reconcile(
        &self,
        message: TrackedMessage,
        cancel: CancellationToken,
    ) -> Result<ReconcileOutcome, StoreError> {
        if cancel.is_cancelled() {
            return Ok(ReconcileOutcome::Cancelled);
        }

        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(ReconcileOutcome::Cancelled),
            result = self.adapter.fetch_status(message.external_ref_id) => result,
        };

        let observed = match fetched.and_then(|statuses| {
            latest_status(message.external_ref_id, &statuses)
        }) {
            Ok(observed) => observed,
            Err(err) => {
                warn!(error = %err, "external status fetch failed");
                PollerMetrics::incr(&self.metrics.fetch_failures);
                return Ok(ReconcileOutcome::FetchFailed);
            }
        };

        debug!(
            "{}",
            message.format_external(Some(observed.transport_state), observed.receipt_status)
        );

        let resolved = evaluator::determine_next_state(
            &message,
            Some(observed.transport_state),
            observed.receipt_status,
        );
        let (current, decision) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                error!(
                    transport = ?observed.transport_state,
                    receipt = ?observed.receipt_status,
                    "{}",
                    err.with_message_context(&message)
                );
                debug!("{}", message.format_invalid_state());
                PollerMetrics::incr(&self.metrics.invalid);
                return Ok(ReconcileOutcome::Invalid);
            }
        };

        let target = match decision {
            NextStateDecision::Transition(
                to @ (DeliveryState::Pending | DeliveryState::Completed | DeliveryState::Rejected),
            ) => to,
            NextStateDecision::Unchanged
            | NextStateDecision::Transition(DeliveryState::New | DeliveryState::Invalid) => {
                debug!("{}", message.format_unchanged(current));
                PollerMetrics::incr(&self.metrics.unchanged);
                return Ok(ReconcileOutcome::Unchanged(current));
            }
        };

        if cancel.is_cancelled() {
            return Ok(ReconcileOutcome::Cancelled);
        }

        let update = UpdateState::from_observation(&message, &observed, UnixTimeMs::now());
        let snapshot = match self.store.record_state_change(update).await {
            Ok(snapshot) => snapshot,
            Err(StoreError::ConcurrentModification { .. }) => {
                warn!(
                    "{} skipped: signals changed since selection",
                    message.format_transition(target)
                );
                PollerMetrics::incr(&self.metrics.conflicts);
                return Ok(ReconcileOutcome::Superseded);
            }
            Err(err) => return Err(err),
        };
        PollerMetrics::incr(&self.metrics.transitions_recorded);

        match target {
            DeliveryState::Rejected => warn!("{}", message.format_transition(target)),
            _ => info!("{}", message.format_transition(target)),
        }

        // The transition is committed; notify even if cancellation arrived meanwhile
        if target.is_terminal() {
            if let Some(notification) =
                DeliveryNotification::for_terminal_state(&snapshot.message, target)
            {
                self.notify(&notification).await;
            }
        }

        Ok(ReconcileOutcome::Transitioned {
            from: current,
            to: target,
        })
    }

    async fn notify(&self, notification: &DeliveryNotification) {
        let external_ref_id = notification.external_ref_id();
        match self.publisher.publish(external_ref_id, notification).await {
            Ok(()) => {
                PollerMetrics::incr(&self.metrics.notifications_published);
            }
            Err(err) => {
                error!(%external_ref_id, error = %err, "notification publish failed");
                PollerMetrics::incr(&self.metrics.notification_failures);
            }
        }
    }
}
