use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PublishError;
use crate::model::{DeliveryState, ReceiptStatus, TrackedMessage, TransportState, UnixTimeMs};

/// Downstream notification emitted when a message reaches a terminal state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryNotification {
    Completed {
        external_ref_id: Uuid,
        receipt_status: ReceiptStatus,
        occurred_at: UnixTimeMs,
    },
    Rejected {
        external_ref_id: Uuid,
        transport_state: Option<TransportState>,
        receipt_status: Option<ReceiptStatus>,
        occurred_at: UnixTimeMs,
    },
}

impl DeliveryNotification {
    /// Build the notification for a message that has just been persisted in
    /// `state`. Only terminal states produce one.
    pub fn for_terminal_state(
        message: &TrackedMessage,
        state: DeliveryState,
    ) -> Option<Self> {
        match state {
            DeliveryState::Completed => {
                message
                    .receipt_status
                    .map(|receipt_status| DeliveryNotification::Completed {
                        external_ref_id: message.external_ref_id,
                        receipt_status,
                        occurred_at: message.last_state_change,
                    })
            }
            DeliveryState::Rejected => Some(DeliveryNotification::Rejected {
                external_ref_id: message.external_ref_id,
                transport_state: message.transport_state,
                receipt_status: message.receipt_status,
                occurred_at: message.last_state_change,
            }),
            DeliveryState::New | DeliveryState::Pending | DeliveryState::Invalid => None,
        }
    }

    pub fn external_ref_id(&self) -> Uuid {
        match self {
            DeliveryNotification::Completed {
                external_ref_id, ..
            }
            | DeliveryNotification::Rejected {
                external_ref_id, ..
            } => *external_ref_id,
        }
    }

    pub fn to_json(&self) -> Result<String, PublishError> {
        serde_json::to_string(self).map_err(|e| PublishError::Serialization(e.to_string()))
    }
}

/// Best-effort sink for terminal outcomes. A failure here never undoes the
/// state change that triggered it.
#[async_trait::async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(
        &self,
        external_ref_id: Uuid,
        notification: &DeliveryNotification,
    ) -> Result<(), PublishError>;
}
