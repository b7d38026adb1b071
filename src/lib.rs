//! Delivery reconciliation engine.
//!
//! Tracks outbound messages handed to an external delivery system, polls that
//! system for transport and receipt signals, resolves them into one internal
//! delivery state and persists every legal transition with an append-only
//! history.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod poller;
pub mod publisher;
pub mod store;

pub use adapter::StatusAdapter;
pub use config::PollerConfig;
pub use error::{
    AdapterError, ConfigError, EvaluationError, PollerError, PublishError, StateError, StoreError,
    TransitionError,
};
pub use metrics::{MetricsSnapshot, PollerMetrics};
pub use model::{
    CreateState, DeliveryState, ExternalStatus, MessageSnapshot, MessageType, NextStateDecision,
    ReceiptStatus, StateHistoryEntry, TrackedMessage, TransportState, UnixTimeMs, UpdateState,
};
pub use poller::{BatchReport, ReconcileOutcome, ReconciliationPoller};
pub use publisher::{DeliveryNotification, NotificationPublisher};
pub use store::{SqliteStateStore, StateStore};
