//! Per-message delivery state machine.
//!
//! ```text
//! Queued ──▶ Sending ──▶ Sent ──▶ Delivered ──▶ Read
//!    ▲          │
//!    │          ├──▶ Failed(transient) ──▶ Queued        (retry_count < max)
//!    │          └──▶ Abandoned(reason)                  (exhausted / permanent)
//!    └──────────────── Abandoned (manual retry)
//! ```
//!
//! [`DeliveryStatus::can_transition_to`] is the single source of truth for
//! which edges are legal.

use serde::{Deserialize, Serialize};

/// Why a delivery attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The remote write did not complete within the attempt timeout.
    Timeout,
    /// The remote store could not be reached.
    Unavailable,
    /// The attempt was cut short (offline or suspended mid-flight).
    Interrupted,
    /// The remote store refused the write for this user.
    PermissionDenied,
    /// The remote store rejected the message as malformed.
    InvalidArgument,
    /// The message could not be written to local persistence.
    Storage,
    /// The message was pushed out of a full outbound queue.
    Evicted,
}

impl FailureReason {
    /// Whether the sync engine retries automatically after this failure.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable | Self::Interrupted)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Interrupted => "interrupted",
            Self::PermissionDenied => "permission denied",
            Self::InvalidArgument => "invalid argument",
            Self::Storage => "local storage failure",
            Self::Evicted => "evicted from full queue",
        };
        f.write_str(s)
    }
}

/// Delivery lifecycle of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Created locally and waiting for a send attempt.
    Queued,
    /// A remote write is in flight.
    Sending,
    /// Accepted by the remote store.
    Sent,
    /// Received by another participant's device.
    Delivered,
    /// Opened by another participant.
    Read,
    /// The last attempt failed; shown as "retrying" when the reason is
    /// transient.
    Failed(FailureReason),
    /// Gave up. Shown with manual retry and delete affordances.
    Abandoned(FailureReason),
}

impl DeliveryStatus {
    /// Returns `true` if moving from `self` to `next` is a legal edge.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use DeliveryStatus::{Abandoned, Delivered, Failed, Queued, Read, Sending, Sent};

        match (self, next) {
            (Queued, Sending | Failed(FailureReason::Storage))
            | (Queued | Sending, Abandoned(FailureReason::Evicted))
            | (Sending, Sent | Queued | Abandoned(_))
            | (Failed(_) | Abandoned(_), Queued)
            | (Abandoned(FailureReason::Evicted), Sent)
            | (Sent, Delivered | Read)
            | (Delivered, Read) => true,
            (Sending, Failed(reason)) => {
                reason.is_retryable() || matches!(reason, FailureReason::Storage)
            }
            (Failed(current), Abandoned(_)) => current.is_retryable(),
            _ => false,
        }
    }

    /// Terminal states never change again without user action.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Abandoned(_))
    }

    /// Whether a message in this state must have an outbound queue entry.
    #[must_use]
    pub const fn requires_queue_entry(self) -> bool {
        match self {
            Self::Queued | Self::Sending => true,
            Self::Failed(reason) => reason.is_retryable(),
            Self::Sent | Self::Delivered | Self::Read | Self::Abandoned(_) => false,
        }
    }

    /// Whether the UI should offer the manual retry affordance.
    #[must_use]
    pub const fn is_manually_retryable(self) -> bool {
        match self {
            Self::Abandoned(_) => true,
            Self::Failed(reason) => !reason.is_retryable(),
            _ => false,
        }
    }

    /// Whether the remote store has accepted this message.
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Read)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Sending => f.write_str("sending"),
            Self::Sent => f.write_str("sent"),
            Self::Delivered => f.write_str("delivered"),
            Self::Read => f.write_str("read"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Abandoned(reason) => write!(f, "abandoned ({reason})"),
        }
    }
}
