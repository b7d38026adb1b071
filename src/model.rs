use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    /// Point in time `age` before `self`, clamped at the epoch.
    pub fn saturating_sub(self, age: Duration) -> Self {
        let age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(age_ms))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ============================================================================
// External Signals
// ============================================================================

/// Domain category of a tracked message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Dialog,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Dialog => "DIALOG",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DIALOG" => Some(MessageType::Dialog),
            _ => None,
        }
    }
}

/// Transport-level delivery signal reported by the external system
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    Acknowledged,
    Unconfirmed,
    Rejected,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Acknowledged => "ACKNOWLEDGED",
            TransportState::Unconfirmed => "UNCONFIRMED",
            TransportState::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACKNOWLEDGED" => Some(TransportState::Acknowledged),
            "UNCONFIRMED" => Some(TransportState::Unconfirmed),
            "REJECTED" => Some(TransportState::Rejected),
            _ => None,
        }
    }
}

/// Application-level receipt status, reported separately from transport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Ok,
    OkWithPartialError,
    Rejected,
    Unknown,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Ok => "OK",
            ReceiptStatus::OkWithPartialError => "OK_WITH_PARTIAL_ERROR",
            ReceiptStatus::Rejected => "REJECTED",
            ReceiptStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OK" => Some(ReceiptStatus::Ok),
            "OK_WITH_PARTIAL_ERROR" => Some(ReceiptStatus::OkWithPartialError),
            "REJECTED" => Some(ReceiptStatus::Rejected),
            "UNKNOWN" => Some(ReceiptStatus::Unknown),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReceiptStatus::Ok | ReceiptStatus::OkWithPartialError)
    }
}

/// One observation returned by the external status adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalStatus {
    pub transport_state: TransportState,
    pub receipt_status: Option<ReceiptStatus>,
}

impl ExternalStatus {
    pub fn new(transport_state: TransportState, receipt_status: Option<ReceiptStatus>) -> Self {
        Self {
            transport_state,
            receipt_status,
        }
    }
}

// ============================================================================
// Internal State Machine
// ============================================================================

/// Internal delivery state derived from the two external signals.
///
/// `Invalid` marks a failed evaluation for a single cycle and is never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    New,
    Pending,
    Completed,
    Rejected,
    Invalid,
}

impl DeliveryState {
    pub const ALL: [DeliveryState; 5] = [
        DeliveryState::New,
        DeliveryState::Pending,
        DeliveryState::Completed,
        DeliveryState::Rejected,
        DeliveryState::Invalid,
    ];

    pub fn state_name(&self) -> &'static str {
        match self {
            DeliveryState::New => "NEW",
            DeliveryState::Pending => "PENDING",
            DeliveryState::Completed => "COMPLETED",
            DeliveryState::Rejected => "REJECTED",
            DeliveryState::Invalid => "INVALID",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Completed | DeliveryState::Rejected)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// Result of comparing the persisted and freshly observed resolutions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStateDecision {
    Unchanged,
    Transition(DeliveryState),
}

// ============================================================================
// Persisted Records
// ============================================================================

/// Current state of one externally dispatched message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedMessage {
    pub id: Uuid,
    pub message_type: MessageType,
    pub external_ref_id: Uuid,
    pub external_message_url: Url,
    pub transport_state: Option<TransportState>,
    pub receipt_status: Option<ReceiptStatus>,
    pub last_state_change: UnixTimeMs,
    pub last_polled_at: Option<UnixTimeMs>,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

impl TrackedMessage {
    pub fn format_unchanged(&self, state: DeliveryState) -> String {
        format!("{} unchanged ({})", self.log_prefix(), state)
    }

    pub fn format_transition(&self, to: DeliveryState) -> String {
        format!("{} -> {}", self.log_prefix(), to)
    }

    pub fn format_invalid_state(&self) -> String {
        format!("{} entered INVALID state", self.log_prefix())
    }

    pub fn format_external(
        &self,
        transport_state: Option<TransportState>,
        receipt_status: Option<ReceiptStatus>,
    ) -> String {
        format!(
            "{} externalUpdate(transport={:?}, receipt={:?})",
            self.log_prefix(),
            transport_state,
            receipt_status
        )
    }

    fn log_prefix(&self) -> String {
        format!("Message {}", self.external_ref_id)
    }
}

/// One accepted transition, append-only
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub id: i64,
    pub message_id: Uuid,
    pub old_transport_state: Option<TransportState>,
    pub new_transport_state: Option<TransportState>,
    pub old_receipt_status: Option<ReceiptStatus>,
    pub new_receipt_status: Option<ReceiptStatus>,
    pub changed_at: UnixTimeMs,
}

impl StateHistoryEntry {
    /// True for the null-to-null entry written at creation
    pub fn is_baseline(&self) -> bool {
        self.old_transport_state.is_none()
            && self.new_transport_state.is_none()
            && self.old_receipt_status.is_none()
            && self.new_receipt_status.is_none()
    }
}

/// A tracked message together with its full history, oldest first
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub message: TrackedMessage,
    pub history: Vec<StateHistoryEntry>,
}

// ============================================================================
// Write Commands
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateState {
    pub id: Uuid,
    pub message_type: MessageType,
    pub external_ref_id: Uuid,
    pub external_message_url: Url,
    pub occurred_at: UnixTimeMs,
}

impl CreateState {
    pub fn new(message_type: MessageType, external_ref_id: Uuid, external_message_url: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            external_ref_id,
            external_message_url,
            occurred_at: UnixTimeMs::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn at(mut self, occurred_at: UnixTimeMs) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Signal change for an existing message.
///
/// The `old_*` fields must match what is currently stored; the store rejects the
/// write otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateState {
    pub message_type: MessageType,
    pub external_ref_id: Uuid,
    pub old_transport_state: Option<TransportState>,
    pub new_transport_state: Option<TransportState>,
    pub old_receipt_status: Option<ReceiptStatus>,
    pub new_receipt_status: Option<ReceiptStatus>,
    pub occurred_at: UnixTimeMs,
}

impl UpdateState {
    pub fn from_observation(
        message: &TrackedMessage,
        observed: &ExternalStatus,
        occurred_at: UnixTimeMs,
    ) -> Self {
        Self {
            message_type: message.message_type,
            external_ref_id: message.external_ref_id,
            old_transport_state: message.transport_state,
            new_transport_state: Some(observed.transport_state),
            old_receipt_status: message.receipt_status,
            new_receipt_status: observed.receipt_status,
            occurred_at,
        }
    }
}
