//! Classified network connectivity.

use serde::{Deserialize, Serialize};

/// The device's connectivity as seen by the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No usable network path.
    Offline,
    /// Reachability came back; waiting for it to settle.
    Connecting,
    /// Connected and idle.
    Online,
    /// Connected and draining the outbound queue.
    Syncing {
        /// Entries still waiting to be written.
        pending: usize,
    },
}

impl ConnectionState {
    /// Whether remote writes may be attempted in this state.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online | Self::Syncing { .. })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => f.write_str("offline"),
            Self::Connecting => f.write_str("connecting"),
            Self::Online => f.write_str("online"),
            Self::Syncing { pending } => write!(f, "syncing ({pending} pending)"),
        }
    }
}
