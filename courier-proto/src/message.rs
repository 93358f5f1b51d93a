//! Message and identifier types.
//!
//! A [`Message`] is created once on the sending device and never edited
//! afterwards. Its [`MessageId`] doubles as the idempotency key for remote
//! writes, so a retried write can never produce a second document.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message text size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a chat (direct thread or group) in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChatId(String);

impl ChatId {
    /// Creates a chat identifier from its remote document key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this chat ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a user account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its account key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Error returned when message text fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message text is empty or whitespace only.
    #[error("message text is empty")]
    Empty,
    /// Message text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// A chat message as written to and read from the remote store.
///
/// The content fields are fixed at creation. `server_timestamp`,
/// `delivered_to` and `read_by` only ever change as a result of remote
/// acknowledgments. Delivery status is deliberately absent: it lives in
/// the delivery tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated identifier, stable across retries.
    pub id: MessageId,
    /// The chat this message belongs to.
    pub chat_id: ChatId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Message body.
    pub text: String,
    /// Creation time on the sending device, strictly increasing per sender.
    pub client_timestamp: Timestamp,
    /// Time the remote store accepted the write.
    pub server_timestamp: Option<Timestamp>,
    /// Participants whose devices acknowledged receipt.
    pub delivered_to: BTreeSet<UserId>,
    /// Participants who have opened the thread since this message arrived.
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    /// Builds a new outgoing message with a fresh ID.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for blank text, or
    /// [`ValidationError::TooLarge`] if it exceeds [`MAX_MESSAGE_SIZE`].
    pub fn compose(
        chat_id: ChatId,
        sender_id: UserId,
        text: impl Into<String>,
        client_timestamp: Timestamp,
    ) -> Result<Self, ValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self {
            id: MessageId::new(),
            chat_id,
            sender_id,
            text,
            client_timestamp,
            server_timestamp: None,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
        })
    }

    /// Returns a copy with the server timestamp set.
    #[must_use]
    pub fn with_server_timestamp(mut self, ts: Timestamp) -> Self {
        self.server_timestamp = Some(ts);
        self
    }

    /// The key this message sorts by when rendered.
    ///
    /// Optimistic messages fall back to their client timestamp so they hold
    /// a stable position until the server timestamp arrives.
    #[must_use]
    pub fn render_key(&self) -> Timestamp {
        self.server_timestamp.unwrap_or(self.client_timestamp)
    }

    /// Whether anyone other than the sender has read this message.
    #[must_use]
    pub fn is_read_by_others(&self) -> bool {
        self.read_by.iter().any(|u| *u != self.sender_id)
    }

    /// Whether anyone other than the sender has received this message.
    #[must_use]
    pub fn is_delivered_to_others(&self) -> bool {
        self.delivered_to.iter().any(|u| *u != self.sender_id)
    }
}

/// Sorts messages into display order.
///
/// Acknowledged messages sort by server timestamp, optimistic ones by client
/// timestamp. Ties are broken by ID so the order is total and stable.
pub fn render_order(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.render_key()
            .cmp(&b.render_key())
            .then_with(|| a.id.cmp(&b.id))
    });
}
