//! Remote listeners: one task per watched chat.
//!
//! Each task consumes [`RemoteStore::observe_messages`] for its chat. For
//! messages the signed-in user wrote, acknowledgment fields are turned into
//! tracker updates (`Delivered`, `Read`). Messages from other participants
//! are forwarded to the application as [`InboundMessage`]s. A stream that
//! ends is re-subscribed after a short pause.
//!
//! Inbound messages may repeat after a re-subscribe (the stream replays the
//! chat's current contents); consumers key them by ID.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use courier_proto::message::{ChatId, Message, UserId};

use crate::remote::RemoteStore;
use crate::tracker::{Ack, DeliveryTracker};

/// Pause before re-subscribing to a stream the store closed.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// A message written by another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The chat it arrived in.
    pub chat_id: ChatId,
    /// The message as stored remotely.
    pub message: Message,
}

/// The set of chats being watched and their listener tasks.
pub struct ListenerSet<R: RemoteStore> {
    remote: Arc<R>,
    tracker: Arc<DeliveryTracker>,
    me: UserId,
    inbound: mpsc::Sender<InboundMessage>,
    watched: Mutex<BTreeSet<ChatId>>,
    tasks: Mutex<HashMap<ChatId, JoinHandle<()>>>,
    running: AtomicBool,
}

impl<R: RemoteStore> ListenerSet<R> {
    /// Create a running listener set with no chats. Inbound messages are
    /// delivered on the returned receiver.
    #[must_use]
    pub fn new(
        remote: Arc<R>,
        tracker: Arc<DeliveryTracker>,
        me: UserId,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                remote,
                tracker,
                me,
                inbound,
                watched: Mutex::new(BTreeSet::new()),
                tasks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
            },
            rx,
        )
    }

    /// Start listening to `chat`. Returns `false` if it was already
    /// watched. While stopped, the chat is remembered and its listener
    /// starts on the next [`start_all`](Self::start_all).
    pub fn watch(&self, chat: ChatId) -> bool {
        if !self.watched.lock().insert(chat.clone()) {
            return false;
        }
        if self.running.load(Ordering::SeqCst) {
            self.spawn(chat);
        }
        true
    }

    /// Stop listening to `chat`. Returns `false` if it was not watched.
    pub fn unwatch(&self, chat: &ChatId) -> bool {
        if let Some(handle) = self.tasks.lock().remove(chat) {
            handle.abort();
        }
        self.watched.lock().remove(chat)
    }

    /// Re-open a listener for every watched chat that lacks one.
    pub fn start_all(&self) {
        self.running.store(true, Ordering::SeqCst);
        let chats: Vec<ChatId> = self.watched.lock().iter().cloned().collect();
        for chat in chats {
            let alive = self
                .tasks
                .lock()
                .get(&chat)
                .is_some_and(|h| !h.is_finished());
            if !alive {
                self.spawn(chat);
            }
        }
    }

    /// Close every listener. Watched chats are kept.
    pub fn stop_all(&self) -> usize {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (_, handle) in &tasks {
            handle.abort();
        }
        if !tasks.is_empty() {
            tracing::debug!(stopped = tasks.len(), "remote listeners stopped");
        }
        tasks.len()
    }

    /// Number of listener tasks currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Chats being watched.
    #[must_use]
    pub fn watched(&self) -> Vec<ChatId> {
        self.watched.lock().iter().cloned().collect()
    }

    fn spawn(&self, chat: ChatId) {
        let remote = Arc::clone(&self.remote);
        let tracker = Arc::clone(&self.tracker);
        let me = self.me.clone();
        let inbound = self.inbound.clone();
        let task_chat = chat.clone();

        let handle = tokio::spawn(async move {
            loop {
                let mut stream = remote.observe_messages(&task_chat);
                while let Some(message) = stream.next().await {
                    apply(&tracker, &me, &inbound, message);
                }
                tracing::debug!(chat = %task_chat, "remote stream closed, resubscribing");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });
        if let Some(previous) = self.tasks.lock().insert(chat, handle) {
            previous.abort();
        }
    }
}

impl<R: RemoteStore> Drop for ListenerSet<R> {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

/// Handle one document from a chat stream.
fn apply(
    tracker: &DeliveryTracker,
    me: &UserId,
    inbound: &mpsc::Sender<InboundMessage>,
    message: Message,
) {
    if message.sender_id == *me {
        let ack = if message.is_read_by_others() {
            Some(Ack::Read)
        } else if message.is_delivered_to_others() {
            Some(Ack::Delivered)
        } else {
            None
        };
        // Untracked IDs were sent from another device or before a restart.
        if let Some(ack) = ack
            && let Ok(true) = tracker.acknowledge(&message.id, ack)
        {
            tracing::debug!(message_id = %message.id, ?ack, "acknowledgment applied");
        }
        return;
    }

    let event = InboundMessage {
        chat_id: message.chat_id.clone(),
        message,
    };
    if let Err(err) = inbound.try_send(event) {
        tracing::warn!(error = %err, "inbound message dropped, consumer not keeping up");
    }
}
