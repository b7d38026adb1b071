use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::model::{DeliveryState, ReceiptStatus, TrackedMessage, TransportState};

// ============================================================================
// Evaluation and Transition Errors
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("UnresolvableState(transport={transport_state:?}, receipt={receipt_status:?})")]
    UnresolvableState {
        transport_state: Option<TransportState>,
        receipt_status: Option<ReceiptStatus>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("IllegalTransition(from={from}, to={to})")]
    IllegalTransition {
        from: DeliveryState,
        to: DeliveryState,
    },
}

/// Business-rule failures that resolve a message to INVALID for one cycle
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl StateError {
    pub fn with_message_context(&self, message: &TrackedMessage) -> String {
        format!("Message {}: {}", message.external_ref_id, self)
    }
}

// ============================================================================
// Collaborator Errors
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("fetch failed for {external_ref_id}: {reason}")]
    FetchFailure { external_ref_id: Uuid, reason: String },

    #[error("no status returned for {external_ref_id}")]
    NoStatusReturned { external_ref_id: Uuid },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publish failed for {external_ref_id}: {reason}")]
    Failure { external_ref_id: Uuid, reason: String },

    #[error("notification serialization failed: {0}")]
    Serialization(String),
}

// ============================================================================
// Persistence Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),

    #[error(
        "external reference {external_ref_id} already tracked by {existing_message_id} (new message {new_message_id})"
    )]
    ConflictingExternalReferenceId {
        external_ref_id: Uuid,
        existing_message_id: Uuid,
        new_message_id: Uuid,
    },

    #[error(
        "external url {external_message_url} already tracked by {existing_message_id} (new message {new_message_id})"
    )]
    ConflictingExternalMessageUrl {
        external_message_url: Url,
        existing_message_id: Uuid,
        new_message_id: Uuid,
    },

    #[error("concurrent modification of message {external_ref_id}")]
    ConcurrentModification { external_ref_id: Uuid },

    #[error("corrupted row: column {column}, value {value:?}")]
    CorruptedRow { column: &'static str, value: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

// ============================================================================
// Configuration and Poller Errors
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
