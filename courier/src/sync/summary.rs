//! Best-effort "last message" updates.
//!
//! After a message is confirmed, the chat's summary document is pointed at
//! it. The message itself is already safe, so a failed summary write must
//! not fail the send: it is logged, kept here, and retried on the next
//! drain. Every write is bounded by a timeout so a stalled summary never
//! holds up the messages behind it. Only the newest pending update per
//! chat is kept.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use courier_proto::message::{ChatId, Message};

use crate::remote::RemoteStore;

/// Pending chat summary writes awaiting retry.
#[derive(Debug, Default)]
pub struct SummaryWriter {
    pending: Mutex<VecDeque<Message>>,
}

impl SummaryWriter {
    /// Create a writer with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `message.chat_id`'s summary at `message`.
    ///
    /// Never fails: on error or after `timeout` the update is queued for
    /// [`flush_pending`](Self::flush_pending).
    pub async fn update<R: RemoteStore>(&self, remote: &R, message: &Message, timeout: Duration) {
        if !write(remote, message, timeout).await {
            self.hold(message.clone());
        }
    }

    /// Retry pending updates one at a time while `keep_going` holds.
    /// Returns how many succeeded.
    pub async fn flush_pending<R: RemoteStore>(
        &self,
        remote: &R,
        timeout: Duration,
        keep_going: impl Fn() -> bool,
    ) -> usize {
        let total = self.pending_count();
        let mut succeeded = 0;

        for _ in 0..total {
            if !keep_going() {
                break;
            }
            let Some(message) = self.pending.lock().pop_front() else {
                break;
            };
            if write(remote, &message, timeout).await {
                succeeded += 1;
            } else {
                self.hold(message);
            }
        }

        if succeeded > 0 {
            tracing::info!(
                succeeded,
                remaining = self.pending_count(),
                "flushed pending last-message updates"
            );
        }
        succeeded
    }

    /// Number of chats with an update waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queue `message`, replacing an older pending update for its chat.
    pub fn hold(&self, message: Message) {
        let mut pending = self.pending.lock();
        if let Some(slot) = pending.iter_mut().find(|m| m.chat_id == message.chat_id) {
            if message.render_key() >= slot.render_key() {
                *slot = message;
            }
            return;
        }
        pending.push_back(message);
    }

    /// Whether an update for `chat` is waiting.
    #[must_use]
    pub fn is_pending(&self, chat: &ChatId) -> bool {
        self.pending.lock().iter().any(|m| m.chat_id == *chat)
    }
}

/// One bounded summary write. Returns `true` if the store accepted it.
async fn write<R: RemoteStore>(remote: &R, message: &Message, timeout: Duration) -> bool {
    let outcome = tokio::time::timeout(
        timeout,
        remote.update_last_message(&message.chat_id, message),
    )
    .await;
    let error = match outcome {
        Ok(Ok(())) => return true,
        Ok(Err(err)) => err.to_string(),
        Err(_elapsed) => format!("no reply within {timeout:?}"),
    };
    tracing::warn!(
        chat = %message.chat_id,
        message_id = %message.id,
        error = %error,
        "last-message update failed, will retry"
    );
    false
}
