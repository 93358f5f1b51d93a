//! Remote document store abstraction.
//!
//! Defines the [`RemoteStore`] trait the sync engine writes through and the
//! remote listeners read from. [`memory::MemoryRemote`] is an in-process
//! implementation with fault injection, used by tests and the demo binary.

pub mod memory;

use futures_util::stream::BoxStream;

use courier_proto::message::{ChatId, Message, Timestamp};
use courier_proto::status::FailureReason;

/// Errors reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The store could not be reached.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The write did not complete in time.
    #[error("remote write timed out")]
    Timeout,

    /// The signed-in user may not write to this chat.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The store rejected the document as malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RemoteError {
    /// Whether retrying the same write could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    /// The failure reason recorded against the message.
    #[must_use]
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::Unavailable(_) => FailureReason::Unavailable,
            Self::Timeout => FailureReason::Timeout,
            Self::PermissionDenied(_) => FailureReason::PermissionDenied,
            Self::InvalidArgument(_) => FailureReason::InvalidArgument,
        }
    }
}

/// Async access to the remote document store.
///
/// # Invariant
///
/// [`put_message`](RemoteStore::put_message) MUST be idempotent on
/// `message.id`: writing the same message any number of times leaves
/// exactly one document. The sync engine relies on this to re-send after a
/// cancelled attempt whose outcome is unknown.
pub trait RemoteStore: Send + Sync + 'static {
    /// Write `message` into `chat`, returning the server timestamp the store
    /// assigned to it.
    fn put_message(
        &self,
        chat: &ChatId,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<Timestamp, RemoteError>> + Send;

    /// Point the chat's "last message" summary at `message`.
    fn update_last_message(
        &self,
        chat: &ChatId,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Stream of documents in `chat`: the current contents first, then every
    /// later write or acknowledgment change. The stream ends if the store
    /// drops the subscription.
    fn observe_messages(&self, chat: &ChatId) -> BoxStream<'static, Message>;
}
