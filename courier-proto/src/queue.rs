//! Persisted outbound queue entries.

use serde::{Deserialize, Serialize};

use crate::message::{ChatId, Message, MessageId, Timestamp};

/// A message that the remote store has not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The message to deliver.
    pub message: Message,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// When the most recent attempt started.
    pub last_attempt_at: Option<Timestamp>,
    /// When the entry was admitted to the queue.
    pub enqueued_at: Timestamp,
}

impl QueueEntry {
    /// Wraps a message in a fresh entry with no attempts recorded.
    #[must_use]
    pub const fn new(message: Message, enqueued_at: Timestamp) -> Self {
        Self {
            message,
            retry_count: 0,
            last_attempt_at: None,
            enqueued_at,
        }
    }

    /// The message ID this entry is keyed by.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// The chat the message belongs to.
    #[must_use]
    pub const fn chat_id(&self) -> &ChatId {
        &self.message.chat_id
    }
}
