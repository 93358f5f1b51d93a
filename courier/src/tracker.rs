//! Delivery state tracking.
//!
//! The [`DeliveryTracker`] is the only owner of per-message
//! [`DeliveryStatus`]. Every mutation goes through one mutex that is never
//! held across an await point, and every accepted change is broadcast to
//! observers in the order it was applied. Illegal edges of the state
//! machine are rejected and leave the status untouched.

use std::collections::HashMap;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use courier_proto::message::{ChatId, Message, MessageId, Timestamp};
use courier_proto::status::DeliveryStatus;

/// Errors returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// The message was never registered with [`DeliveryTracker::track`].
    #[error("message {0} is not tracked")]
    Unknown(MessageId),

    /// The requested change is not an edge of the state machine.
    #[error("illegal transition for message {id}: {from} -> {to}")]
    InvalidTransition {
        /// The message whose status was being changed.
        id: MessageId,
        /// Its current status.
        from: DeliveryStatus,
        /// The rejected target status.
        to: DeliveryStatus,
    },
}

/// Acknowledgment from another participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ack {
    /// Their device received the message.
    Delivered,
    /// They opened the thread.
    Read,
}

impl Ack {
    const fn status(self) -> DeliveryStatus {
        match self {
            Self::Delivered => DeliveryStatus::Delivered,
            Self::Read => DeliveryStatus::Read,
        }
    }
}

/// One applied status change, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// The message that changed.
    pub message_id: MessageId,
    /// Its chat.
    pub chat_id: ChatId,
    /// Status before the change, `None` when the message was first tracked.
    pub previous: Option<DeliveryStatus>,
    /// Status after the change.
    pub status: DeliveryStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
}

/// Per-message bookkeeping.
#[derive(Debug, Clone)]
struct Tracked {
    chat_id: ChatId,
    status: DeliveryStatus,
    retry_count: u32,
    server_timestamp: Option<Timestamp>,
    /// Acknowledgment that arrived before the write was confirmed.
    early_ack: Option<Ack>,
}

/// Owner of every message's delivery status.
#[derive(Debug)]
pub struct DeliveryTracker {
    messages: Mutex<HashMap<MessageId, Tracked>>,
    changes: broadcast::Sender<StatusChange>,
}

impl DeliveryTracker {
    /// Create a tracker whose observers can fall `buffer` changes behind
    /// before they start skipping.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(buffer.max(1));
        Self {
            messages: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Register a message with the initial status `Queued`.
    ///
    /// Called before any network attempt so the UI can render the message
    /// optimistically. Tracking an already-known message returns its current
    /// status and changes nothing.
    pub fn track(&self, message: &Message) -> DeliveryStatus {
        let mut messages = self.messages.lock();
        if let Some(existing) = messages.get(&message.id) {
            return existing.status;
        }
        messages.insert(
            message.id.clone(),
            Tracked {
                chat_id: message.chat_id.clone(),
                status: DeliveryStatus::Queued,
                retry_count: 0,
                server_timestamp: None,
                early_ack: None,
            },
        );
        self.emit(&message.id, &message.chat_id, None, DeliveryStatus::Queued, 0);
        DeliveryStatus::Queued
    }

    /// Move a message to `status`, returning the status it had before.
    ///
    /// Setting the current status again is accepted and not broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Unknown`] for an untracked message or
    /// [`TrackerError::InvalidTransition`] for an illegal edge.
    pub fn set_status(
        &self,
        id: &MessageId,
        status: DeliveryStatus,
    ) -> Result<DeliveryStatus, TrackerError> {
        let mut messages = self.messages.lock();
        let tracked = messages
            .get_mut(id)
            .ok_or_else(|| TrackerError::Unknown(id.clone()))?;
        let previous = tracked.status;
        if previous == status {
            return Ok(previous);
        }
        if !previous.can_transition_to(status) {
            return Err(TrackerError::InvalidTransition {
                id: id.clone(),
                from: previous,
                to: status,
            });
        }
        tracked.status = status;
        let (chat, retries) = (tracked.chat_id.clone(), tracked.retry_count);
        self.emit(id, &chat, Some(previous), status, retries);

        if status == DeliveryStatus::Sent
            && let Some(ack) = tracked.early_ack.take()
        {
            tracked.status = ack.status();
            self.emit(id, &chat, Some(status), ack.status(), retries);
        }
        Ok(previous)
    }

    /// Record a confirmed remote write: stores the server timestamp and
    /// moves the message to `Sent`.
    ///
    /// # Errors
    ///
    /// Same as [`set_status`](Self::set_status).
    pub fn confirm_sent(
        &self,
        id: &MessageId,
        server_timestamp: Timestamp,
    ) -> Result<DeliveryStatus, TrackerError> {
        let previous = self.set_status(id, DeliveryStatus::Sent)?;
        if let Some(tracked) = self.messages.lock().get_mut(id) {
            tracked.server_timestamp = Some(server_timestamp);
        }
        Ok(previous)
    }

    /// Current status of a message, if tracked.
    #[must_use]
    pub fn get_status(&self, id: &MessageId) -> Option<DeliveryStatus> {
        self.messages.lock().get(id).map(|t| t.status)
    }

    /// Server timestamp recorded by [`confirm_sent`](Self::confirm_sent).
    #[must_use]
    pub fn server_timestamp(&self, id: &MessageId) -> Option<Timestamp> {
        self.messages.lock().get(id).and_then(|t| t.server_timestamp)
    }

    /// Count one more failed attempt and return the new total.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Unknown`] for an untracked message.
    pub fn increment_retry(&self, id: &MessageId) -> Result<u32, TrackerError> {
        let mut messages = self.messages.lock();
        let tracked = messages
            .get_mut(id)
            .ok_or_else(|| TrackerError::Unknown(id.clone()))?;
        tracked.retry_count = tracked.retry_count.saturating_add(1);
        Ok(tracked.retry_count)
    }

    /// Reset the failed-attempt counter (manual retry).
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Unknown`] for an untracked message.
    pub fn reset_retry(&self, id: &MessageId) -> Result<(), TrackerError> {
        let mut messages = self.messages.lock();
        let tracked = messages
            .get_mut(id)
            .ok_or_else(|| TrackerError::Unknown(id.clone()))?;
        tracked.retry_count = 0;
        Ok(())
    }

    /// Restore a retry count recovered from the persisted queue.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Unknown`] for an untracked message.
    pub fn restore_retry(&self, id: &MessageId, retry_count: u32) -> Result<(), TrackerError> {
        let mut messages = self.messages.lock();
        let tracked = messages
            .get_mut(id)
            .ok_or_else(|| TrackerError::Unknown(id.clone()))?;
        tracked.retry_count = retry_count;
        Ok(())
    }

    /// Failed attempts so far, if tracked.
    #[must_use]
    pub fn retry_count(&self, id: &MessageId) -> Option<u32> {
        self.messages.lock().get(id).map(|t| t.retry_count)
    }

    /// Apply a delivery or read acknowledgment from another participant.
    ///
    /// Acknowledgments never move a message backwards (a late `Delivered`
    /// after `Read` is ignored). One that arrives before the write has been
    /// confirmed locally is held and applied as soon as the message
    /// reaches `Sent`. Returns `true` if the status changed.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Unknown`] for an untracked message.
    pub fn acknowledge(&self, id: &MessageId, ack: Ack) -> Result<bool, TrackerError> {
        let mut messages = self.messages.lock();
        let tracked = messages
            .get_mut(id)
            .ok_or_else(|| TrackerError::Unknown(id.clone()))?;
        let current = tracked.status;

        if !current.is_confirmed() {
            if !current.is_terminal() {
                tracked.early_ack = tracked.early_ack.max(Some(ack));
            }
            return Ok(false);
        }
        let target = ack.status();
        if current == target || !current.can_transition_to(target) {
            return Ok(false);
        }
        tracked.status = target;
        let (chat, retries) = (tracked.chat_id.clone(), tracked.retry_count);
        self.emit(id, &chat, Some(current), target, retries);
        Ok(true)
    }

    /// Stop tracking a message the user deleted. Returns `true` if it was
    /// tracked.
    pub fn forget(&self, id: &MessageId) -> bool {
        self.messages.lock().remove(id).is_some()
    }

    /// Current status of every tracked message in `chat`.
    #[must_use]
    pub fn snapshot(&self, chat: &ChatId) -> Vec<(MessageId, DeliveryStatus)> {
        let mut out: Vec<_> = self
            .messages
            .lock()
            .iter()
            .filter(|(_, t)| t.chat_id == *chat)
            .map(|(id, t)| (id.clone(), t.status))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Stream of status changes for one chat.
    ///
    /// Only changes applied after this call are yielded. The stream ends
    /// when the tracker is dropped; dropping the stream cancels the
    /// subscription and calling `observe` again restarts it.
    #[must_use]
    pub fn observe(&self, chat: ChatId) -> BoxStream<'static, StatusChange> {
        let rx = self.changes.subscribe();
        futures_util::stream::unfold((rx, chat), |(mut rx, chat)| async move {
            loop {
                match rx.recv().await {
                    Ok(change) if change.chat_id == chat => return Some((change, (rx, chat))),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(chat = %chat, skipped, "status observer fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    fn emit(
        &self,
        id: &MessageId,
        chat: &ChatId,
        previous: Option<DeliveryStatus>,
        status: DeliveryStatus,
        retry_count: u32,
    ) {
        tracing::debug!(
            message_id = %id,
            chat = %chat,
            status = %status,
            retry_count,
            "delivery status changed"
        );
        // No receivers is fine: nobody is watching this chat right now.
        let _ = self.changes.send(StatusChange {
            message_id: id.clone(),
            chat_id: chat.clone(),
            previous,
            status,
            retry_count,
        });
    }
}
