//! Pure state rules: resolving external signals and validating transitions.
//!
//! Nothing here performs I/O. Every input either resolves or fails with an
//! explicit error; the poller decides what a failure means for a message.

use crate::error::{EvaluationError, StateError, TransitionError};
use crate::model::{
    DeliveryState, NextStateDecision, ReceiptStatus, TrackedMessage, TransportState,
};

/// Resolve the internal delivery state from the raw external signals.
///
/// Rules are checked in order:
/// 1. no signals at all -> `New`
/// 2. transport rejected -> `Rejected`, whatever the receipt says
/// 3. unconfirmed transport with a receipt -> unresolvable
/// 4. acknowledged + successful receipt -> `Completed`
/// 5. acknowledged + rejected receipt -> `Rejected`
/// 6. acknowledged or unconfirmed without receipt -> `Pending`
/// 7. anything else -> unresolvable
pub fn evaluate(
    transport_state: Option<TransportState>,
    receipt_status: Option<ReceiptStatus>,
) -> Result<DeliveryState, EvaluationError> {
    use ReceiptStatus as R;
    use TransportState as T;

    match (transport_state, receipt_status) {
        (None, None) => Ok(DeliveryState::New),
        (Some(T::Rejected), _) => Ok(DeliveryState::Rejected),
        (Some(T::Unconfirmed), Some(_)) => Err(unresolvable(transport_state, receipt_status)),
        (Some(T::Acknowledged), Some(receipt)) if receipt.is_success() => {
            Ok(DeliveryState::Completed)
        }
        (Some(T::Acknowledged), Some(R::Rejected)) => Ok(DeliveryState::Rejected),
        (Some(T::Acknowledged), None) => Ok(DeliveryState::Pending),
        (Some(T::Unconfirmed), None) => Ok(DeliveryState::Pending),
        _ => Err(unresolvable(transport_state, receipt_status)),
    }
}

/// Resolve the state currently cached in a persisted message
pub fn evaluate_message(message: &TrackedMessage) -> Result<DeliveryState, EvaluationError> {
    evaluate(message.transport_state, message.receipt_status)
}

fn unresolvable(
    transport_state: Option<TransportState>,
    receipt_status: Option<ReceiptStatus>,
) -> EvaluationError {
    EvaluationError::UnresolvableState {
        transport_state,
        receipt_status,
    }
}

/// Check that moving from `old` to `new` is a legal step of the lifecycle.
///
/// `Completed` and `Rejected` are terminal and only accept themselves.
/// `Invalid` never acts as a starting point.
pub fn validate(old: DeliveryState, new: DeliveryState) -> Result<(), TransitionError> {
    let allowed = match old {
        DeliveryState::New => true,
        DeliveryState::Pending => matches!(
            new,
            DeliveryState::Pending | DeliveryState::Completed | DeliveryState::Rejected
        ),
        DeliveryState::Completed => new == DeliveryState::Completed,
        DeliveryState::Rejected => new == DeliveryState::Rejected,
        DeliveryState::Invalid => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition { from: old, to: new })
    }
}

/// Compare already-resolved states. Equal resolutions are `Unchanged` even when
/// the raw signals behind them differ.
pub fn decide(old: DeliveryState, new: DeliveryState) -> Result<NextStateDecision, TransitionError> {
    validate(old, new)?;
    if old == new {
        Ok(NextStateDecision::Unchanged)
    } else {
        Ok(NextStateDecision::Transition(new))
    }
}

/// Evaluate the stored and the observed signals of one message and decide
/// what, if anything, should be persisted. Returns the state currently
/// stored alongside the decision.
pub fn determine_next_state(
    message: &TrackedMessage,
    transport_state: Option<TransportState>,
    receipt_status: Option<ReceiptStatus>,
) -> Result<(DeliveryState, NextStateDecision), StateError> {
    let old = evaluate_message(message)?;
    let new = evaluate(transport_state, receipt_status)?;
    Ok((old, decide(old, new)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageType, UnixTimeMs};
    use proptest::prelude::*;
    use url::Url;
    use uuid::Uuid;

    const TRANSPORTS: [Option<TransportState>; 4] = [
        None,
        Some(TransportState::Acknowledged),
        Some(TransportState::Unconfirmed),
        Some(TransportState::Rejected),
    ];

    const RECEIPTS: [Option<ReceiptStatus>; 5] = [
        None,
        Some(ReceiptStatus::Ok),
        Some(ReceiptStatus::OkWithPartialError),
        Some(ReceiptStatus::Rejected),
        Some(ReceiptStatus::Unknown),
    ];

    fn message_with(
        transport_state: Option<TransportState>,
        receipt_status: Option<ReceiptStatus>,
    ) -> TrackedMessage {
        let now = UnixTimeMs(1_700_000_000_000);
        TrackedMessage {
            id: Uuid::new_v4(),
            message_type: MessageType::Dialog,
            external_ref_id: Uuid::new_v4(),
            external_message_url: Url::parse("https://example.com/messages/1").unwrap(),
            transport_state,
            receipt_status,
            last_state_change: now,
            last_polled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn any_transport() -> impl Strategy<Value = Option<TransportState>> {
        proptest::sample::select(TRANSPORTS.to_vec())
    }

    fn any_receipt() -> impl Strategy<Value = Option<ReceiptStatus>> {
        proptest::sample::select(RECEIPTS.to_vec())
    }

    fn any_state() -> impl Strategy<Value = DeliveryState> {
        proptest::sample::select(DeliveryState::ALL.to_vec())
    }

    #[test]
    fn no_signals_is_new() {
        assert_eq!(evaluate(None, None), Ok(DeliveryState::New));
    }

    #[test]
    fn transport_rejection_wins_over_any_receipt() {
        for receipt in RECEIPTS {
            assert_eq!(
                evaluate(Some(TransportState::Rejected), receipt),
                Ok(DeliveryState::Rejected)
            );
        }
    }

    #[test]
    fn acknowledged_with_successful_receipt_completes() {
        assert_eq!(
            evaluate(Some(TransportState::Acknowledged), Some(ReceiptStatus::Ok)),
            Ok(DeliveryState::Completed)
        );
        assert_eq!(
            evaluate(
                Some(TransportState::Acknowledged),
                Some(ReceiptStatus::OkWithPartialError)
            ),
            Ok(DeliveryState::Completed)
        );
    }

    #[test]
    fn acknowledged_with_rejected_receipt_is_rejected() {
        assert_eq!(
            evaluate(Some(TransportState::Acknowledged), Some(ReceiptStatus::Rejected)),
            Ok(DeliveryState::Rejected)
        );
    }

    #[test]
    fn transport_without_receipt_is_pending() {
        assert_eq!(
            evaluate(Some(TransportState::Acknowledged), None),
            Ok(DeliveryState::Pending)
        );
        assert_eq!(
            evaluate(Some(TransportState::Unconfirmed), None),
            Ok(DeliveryState::Pending)
        );
    }

    #[test]
    fn unconfirmed_with_any_receipt_is_unresolvable() {
        for receipt in RECEIPTS.into_iter().flatten() {
            assert_eq!(
                evaluate(Some(TransportState::Unconfirmed), Some(receipt)),
                Err(EvaluationError::UnresolvableState {
                    transport_state: Some(TransportState::Unconfirmed),
                    receipt_status: Some(receipt),
                })
            );
        }
    }

    #[test]
    fn acknowledged_with_unknown_receipt_is_unresolvable() {
        assert!(evaluate(Some(TransportState::Acknowledged), Some(ReceiptStatus::Unknown)).is_err());
    }

    #[test]
    fn receipt_without_transport_is_unresolvable() {
        for receipt in RECEIPTS.into_iter().flatten() {
            assert!(evaluate(None, Some(receipt)).is_err());
        }
    }

    #[test]
    fn pending_transitions() {
        assert!(validate(DeliveryState::Pending, DeliveryState::New).is_err());
        assert!(validate(DeliveryState::Pending, DeliveryState::Pending).is_ok());
        assert!(validate(DeliveryState::Pending, DeliveryState::Completed).is_ok());
        assert!(validate(DeliveryState::Pending, DeliveryState::Rejected).is_ok());
        assert!(validate(DeliveryState::Pending, DeliveryState::Invalid).is_err());
    }

    #[test]
    fn illegal_transition_names_both_states() {
        assert_eq!(
            validate(DeliveryState::Completed, DeliveryState::Rejected),
            Err(TransitionError::IllegalTransition {
                from: DeliveryState::Completed,
                to: DeliveryState::Rejected,
            })
        );
    }

    #[test]
    fn decide_reports_unchanged_for_equal_states() {
        assert_eq!(
            decide(DeliveryState::Pending, DeliveryState::Pending),
            Ok(NextStateDecision::Unchanged)
        );
        assert_eq!(
            decide(DeliveryState::Pending, DeliveryState::Completed),
            Ok(NextStateDecision::Transition(DeliveryState::Completed))
        );
    }

    #[test]
    fn determine_next_state_compares_resolutions_not_raw_signals() {
        // UNCONFIRMED and ACKNOWLEDGED without receipt both resolve to PENDING
        let message = message_with(Some(TransportState::Unconfirmed), None);
        assert_eq!(
            determine_next_state(&message, Some(TransportState::Acknowledged), None),
            Ok((DeliveryState::Pending, NextStateDecision::Unchanged))
        );
    }

    #[test]
    fn determine_next_state_reports_current_state_with_transition() {
        let message = message_with(None, None);
        assert_eq!(
            determine_next_state(&message, Some(TransportState::Rejected), None),
            Ok((
                DeliveryState::New,
                NextStateDecision::Transition(DeliveryState::Rejected)
            ))
        );
    }

    #[test]
    fn determine_next_state_surfaces_stored_evaluation_failure() {
        let message = message_with(None, Some(ReceiptStatus::Ok));
        let result = determine_next_state(&message, Some(TransportState::Acknowledged), None);
        assert!(matches!(result, Err(StateError::Evaluation(_))));
    }

    #[test]
    fn determine_next_state_rejects_leaving_terminal_state() {
        let message = message_with(Some(TransportState::Acknowledged), Some(ReceiptStatus::Ok));
        let result = determine_next_state(&message, Some(TransportState::Acknowledged), None);
        assert_eq!(
            result,
            Err(StateError::Transition(TransitionError::IllegalTransition {
                from: DeliveryState::Completed,
                to: DeliveryState::Pending,
            }))
        );
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic(t in any_transport(), r in any_receipt()) {
            prop_assert_eq!(evaluate(t, r), evaluate(t, r));
        }

        #[test]
        fn evaluation_never_yields_invalid(t in any_transport(), r in any_receipt()) {
            prop_assert_ne!(evaluate(t, r), Ok(DeliveryState::Invalid));
        }

        #[test]
        fn anything_is_legal_from_new(s in any_state()) {
            prop_assert!(validate(DeliveryState::New, s).is_ok());
        }

        #[test]
        fn completed_only_accepts_itself(s in any_state()) {
            prop_assert_eq!(
                validate(DeliveryState::Completed, s).is_ok(),
                s == DeliveryState::Completed
            );
        }

        #[test]
        fn rejected_only_accepts_itself(s in any_state()) {
            prop_assert_eq!(
                validate(DeliveryState::Rejected, s).is_ok(),
                s == DeliveryState::Rejected
            );
        }

        #[test]
        fn nothing_is_legal_from_invalid(s in any_state()) {
            prop_assert!(validate(DeliveryState::Invalid, s).is_err());
        }
    }
}
