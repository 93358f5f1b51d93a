//! In-process remote store for tests and the demo.
//!
//! [`MemoryRemote`] keeps one ordered document list per chat, assigns
//! strictly increasing server timestamps, and honours the idempotency
//! contract of [`RemoteStore::put_message`]. Faults can be scripted per
//! write call to simulate timeouts, rejections and lost replies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use courier_proto::message::{ChatId, Message, MessageId, Timestamp, UserId};

use super::{RemoteError, RemoteStore};

/// Buffer for each chat's change feed.
const FEED_BUFFER: usize = 64;

/// Scripted outcome for one upcoming `put_message` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with this error without writing anything.
    Fail(RemoteError),
    /// Never complete; the caller's timeout or cancellation decides.
    Hang,
    /// Apply the write, then never reply.
    CommitThenHang,
    /// Wait this long before handling the write normally.
    Delay(Duration),
}

#[derive(Debug)]
struct RemoteState {
    chats: HashMap<ChatId, Vec<Message>>,
    feeds: HashMap<ChatId, broadcast::Sender<Message>>,
    attempts: HashMap<MessageId, u32>,
    faults: VecDeque<Fault>,
    reachable: bool,
    side_effects_failing: bool,
    last_message: HashMap<ChatId, MessageId>,
    clock: u64,
}

impl RemoteState {
    fn feed(&mut self, chat: &ChatId) -> &broadcast::Sender<Message> {
        self.feeds
            .entry(chat.clone())
            .or_insert_with(|| broadcast::channel(FEED_BUFFER).0)
    }

    fn publish(&mut self, message: Message) {
        // No receivers is fine: nobody is listening to this chat.
        let _ = self.feed(&message.chat_id).send(message);
    }

    fn find_mut(&mut self, chat: &ChatId, id: &MessageId) -> Option<&mut Message> {
        self.chats.get_mut(chat)?.iter_mut().find(|m| m.id == *id)
    }

    /// Store `message` unless a document with its ID already exists.
    fn commit(&mut self, chat: &ChatId, message: &Message) -> Timestamp {
        if let Some(existing) = self.find_mut(chat, &message.id) {
            return existing.render_key();
        }
        self.clock = self.clock.saturating_add(1).max(Timestamp::now().as_millis());
        let stored = message.clone().with_server_timestamp(Timestamp::from_millis(self.clock));
        self.chats
            .entry(chat.clone())
            .or_default()
            .push(stored.clone());
        self.publish(stored);
        Timestamp::from_millis(self.clock)
    }
}

/// Shared in-memory remote store. Clones share the same documents.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create an empty, reachable store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                chats: HashMap::new(),
                feeds: HashMap::new(),
                attempts: HashMap::new(),
                faults: VecDeque::new(),
                reachable: true,
                side_effects_failing: false,
                last_message: HashMap::new(),
                clock: 0,
            })),
        }
    }

    /// Script the outcome of the next unscripted `put_message` call.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// While unreachable every write fails with [`RemoteError::Unavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Make `update_last_message` fail until switched back.
    pub fn set_side_effects_failing(&self, failing: bool) {
        self.state.lock().side_effects_failing = failing;
    }

    /// Documents in `chat`, in the order the store accepted them.
    #[must_use]
    pub fn documents(&self, chat: &ChatId) -> Vec<Message> {
        self.state.lock().chats.get(chat).cloned().unwrap_or_default()
    }

    /// IDs in `chat`, in the order the store accepted them.
    #[must_use]
    pub fn write_order(&self, chat: &ChatId) -> Vec<MessageId> {
        self.documents(chat).into_iter().map(|m| m.id).collect()
    }

    /// How many documents carry `id`, across all chats.
    #[must_use]
    pub fn document_count(&self, id: &MessageId) -> usize {
        self.state
            .lock()
            .chats
            .values()
            .flatten()
            .filter(|m| m.id == *id)
            .count()
    }

    /// Number of `put_message` calls made for `id`.
    #[must_use]
    pub fn put_attempts(&self, id: &MessageId) -> u32 {
        self.state.lock().attempts.get(id).copied().unwrap_or(0)
    }

    /// The chat's current "last message" pointer.
    #[must_use]
    pub fn last_message(&self, chat: &ChatId) -> Option<MessageId> {
        self.state.lock().last_message.get(chat).cloned()
    }

    /// Record that `user`'s device received message `id`. Returns `false`
    /// if no such document exists.
    pub fn mark_delivered(&self, chat: &ChatId, id: &MessageId, user: &UserId) -> bool {
        self.acknowledge(chat, id, |m| m.delivered_to.insert(user.clone()))
    }

    /// Record that `user` read message `id`. Returns `false` if no such
    /// document exists.
    pub fn mark_read(&self, chat: &ChatId, id: &MessageId, user: &UserId) -> bool {
        self.acknowledge(chat, id, |m| {
            m.delivered_to.insert(user.clone());
            m.read_by.insert(user.clone())
        })
    }

    /// Store a message written by another participant, as if it arrived
    /// from their device.
    pub fn deliver_incoming(&self, message: &Message) -> Timestamp {
        self.state.lock().commit(&message.chat_id, message)
    }

    /// End every open subscription to `chat`.
    pub fn close_subscriptions(&self, chat: &ChatId) {
        self.state.lock().feeds.remove(chat);
    }

    fn acknowledge(
        &self,
        chat: &ChatId,
        id: &MessageId,
        apply: impl FnOnce(&mut Message) -> bool,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(doc) = state.find_mut(chat, id) else {
            return false;
        };
        if apply(doc) {
            let updated = doc.clone();
            state.publish(updated);
        }
        true
    }
}

impl RemoteStore for MemoryRemote {
    async fn put_message(&self, chat: &ChatId, message: &Message) -> Result<Timestamp, RemoteError> {
        let fault = {
            let mut state = self.state.lock();
            *state.attempts.entry(message.id.clone()).or_insert(0) += 1;
            state.faults.pop_front()
        };

        match fault {
            Some(Fault::Fail(err)) => return Err(err),
            Some(Fault::Hang) => std::future::pending::<()>().await,
            Some(Fault::CommitThenHang) => {
                self.state.lock().commit(chat, message);
                std::future::pending::<()>().await;
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let mut state = self.state.lock();
        if !state.reachable {
            return Err(RemoteError::Unavailable("remote store unreachable".into()));
        }
        if message.chat_id != *chat {
            return Err(RemoteError::InvalidArgument(format!(
                "message belongs to chat {}, not {chat}",
                message.chat_id
            )));
        }
        Ok(state.commit(chat, message))
    }

    async fn update_last_message(&self, chat: &ChatId, message: &Message) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if !state.reachable || state.side_effects_failing {
            return Err(RemoteError::Unavailable("chat summary update failed".into()));
        }
        state.last_message.insert(chat.clone(), message.id.clone());
        Ok(())
    }

    fn observe_messages(&self, chat: &ChatId) -> BoxStream<'static, Message> {
        let (snapshot, rx) = {
            let mut state = self.state.lock();
            let snapshot = state.chats.get(chat).cloned().unwrap_or_default();
            (snapshot, state.feed(chat).subscribe())
        };
        let chat = chat.clone();

        let live = futures_util::stream::unfold((rx, chat), |(mut rx, chat)| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, (rx, chat))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(chat = %chat, skipped, "remote feed subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        futures_util::stream::iter(snapshot).chain(live).boxed()
    }
}
