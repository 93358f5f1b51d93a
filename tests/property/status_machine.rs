//! Property tests for the delivery state machine.
//!
//! Random walks over `DeliveryStatus` that only take legal edges must never
//! move a confirmed message backwards, never leave `Read`, and keep the
//! queue-entry requirement consistent with the status.

use courier_proto::status::{DeliveryStatus, FailureReason};
use proptest::prelude::*;

fn arb_reason() -> impl Strategy<Value = FailureReason> {
    prop_oneof![
        Just(FailureReason::Timeout),
        Just(FailureReason::Unavailable),
        Just(FailureReason::Interrupted),
        Just(FailureReason::PermissionDenied),
        Just(FailureReason::InvalidArgument),
        Just(FailureReason::Storage),
        Just(FailureReason::Evicted),
    ]
}

fn arb_status() -> impl Strategy<Value = DeliveryStatus> {
    prop_oneof![
        Just(DeliveryStatus::Queued),
        Just(DeliveryStatus::Sending),
        Just(DeliveryStatus::Sent),
        Just(DeliveryStatus::Delivered),
        Just(DeliveryStatus::Read),
        arb_reason().prop_map(DeliveryStatus::Failed),
        arb_reason().prop_map(DeliveryStatus::Abandoned),
    ]
}

/// Position along the confirmed path.
const fn confirmed_rank(status: DeliveryStatus) -> Option<u8> {
    match status {
        DeliveryStatus::Sent => Some(0),
        DeliveryStatus::Delivered => Some(1),
        DeliveryStatus::Read => Some(2),
        _ => None,
    }
}

proptest! {
    #[test]
    fn confirmed_never_goes_back(from in arb_status(), to in arb_status()) {
        if let Some(rank) = confirmed_rank(from)
            && from.can_transition_to(to)
        {
            let next = confirmed_rank(to);
            prop_assert!(next.is_some_and(|n| n > rank), "{from} -> {to}");
        }
    }

    #[test]
    fn read_is_final(to in arb_status()) {
        prop_assert!(!DeliveryStatus::Read.can_transition_to(to));
    }

    #[test]
    fn only_queued_starts_an_attempt(from in arb_status()) {
        let allowed = from.can_transition_to(DeliveryStatus::Sending);
        prop_assert_eq!(allowed, from == DeliveryStatus::Queued);
    }

    #[test]
    fn manual_retry_is_always_possible(status in arb_status()) {
        if status.is_manually_retryable() {
            prop_assert!(status.can_transition_to(DeliveryStatus::Queued));
            prop_assert!(!status.requires_queue_entry());
        }
    }

    #[test]
    fn sent_only_after_an_attempt(from in arb_status()) {
        if from.can_transition_to(DeliveryStatus::Sent) {
            prop_assert!(matches!(
                from,
                DeliveryStatus::Sending | DeliveryStatus::Abandoned(FailureReason::Evicted)
            ));
        }
    }

    #[test]
    fn random_walk_respects_invariants(steps in prop::collection::vec(arb_status(), 1..64)) {
        let mut current = DeliveryStatus::Queued;
        let mut confirmed = false;
        for next in steps {
            if !current.can_transition_to(next) {
                continue;
            }
            current = next;
            if current.is_confirmed() {
                confirmed = true;
            }
            prop_assert!(!(confirmed && !current.is_confirmed()), "left confirmed path at {current}");
            prop_assert_eq!(current.requires_queue_entry(), !current.is_confirmed()
                && !current.is_manually_retryable());
        }
    }
}
