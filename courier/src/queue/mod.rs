//! Durable, bounded outbound queue.
//!
//! One [`OutboundQueue`] exists per signed-in user. Its entries are owned by
//! a single actor task; the handle is cheap to clone and every call is a
//! request/reply round trip over channels, so no two callers ever mutate
//! the entries concurrently.
//!
//! Every mutation is written through to the [`KvStore`] before the call
//! returns. If the write fails the in-memory change is rolled back and the
//! caller gets an error, so memory and disk never disagree.
//!
//! # Capacity
//!
//! When the queue is full, admitting a new entry evicts the oldest one
//! (lowest `enqueued_at`). Evicted entries are handed back in the
//! [`EnqueueReceipt`] so the caller can surface them to the user.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};

use courier_proto::codec::{self, CodecError};
use courier_proto::message::{ChatId, MessageId, UserId};
use courier_proto::queue::QueueEntry;

use crate::storage::{KvStore, StorageError};

/// Capacity of the command channel into the queue actor.
const COMMAND_BUFFER: usize = 64;

/// Errors returned by the outbound queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The persisted queue could not be read or written.
    #[error("queue storage failed: {0}")]
    Storage(#[from] StorageError),

    /// The persisted queue exists but cannot be decoded.
    #[error("queue snapshot is corrupt: {0}")]
    Corrupt(#[from] CodecError),

    /// The queue actor has shut down.
    #[error("outbound queue is closed")]
    Closed,
}

/// Result of admitting an entry to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    /// Zero-based position of the entry, oldest first.
    pub position: usize,
    /// Entries pushed out to make room, oldest first. Empty unless the
    /// queue was at capacity.
    pub evicted: Vec<QueueEntry>,
}

/// Requests handled by the queue actor.
enum QueueCommand {
    Enqueue {
        entry: QueueEntry,
        reply: oneshot::Sender<Result<EnqueueReceipt, QueueError>>,
    },
    DequeueOldest {
        reply: oneshot::Sender<Result<Option<QueueEntry>, QueueError>>,
    },
    Remove {
        id: MessageId,
        reply: oneshot::Sender<Result<Option<QueueEntry>, QueueError>>,
    },
    Update {
        entry: QueueEntry,
        reply: oneshot::Sender<Result<bool, QueueError>>,
    },
    Get {
        id: MessageId,
        reply: oneshot::Sender<Option<QueueEntry>>,
    },
    All {
        reply: oneshot::Sender<Vec<QueueEntry>>,
    },
}

/// Handle to a user's outbound queue actor.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<QueueCommand>,
    capacity: usize,
}

impl std::fmt::Debug for QueueCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Enqueue { .. } => "Enqueue",
            Self::DequeueOldest { .. } => "DequeueOldest",
            Self::Remove { .. } => "Remove",
            Self::Update { .. } => "Update",
            Self::Get { .. } => "Get",
            Self::All { .. } => "All",
        };
        f.write_str(name)
    }
}

impl OutboundQueue {
    /// Load the persisted queue for `owner` and spawn its actor task.
    ///
    /// Must be called from within a tokio runtime. `capacity` is clamped to
    /// at least one entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the snapshot cannot be read, or
    /// [`QueueError::Corrupt`] if it cannot be decoded.
    pub fn open<S: KvStore>(store: S, owner: &UserId, capacity: usize) -> Result<Self, QueueError> {
        let key = storage_key(owner);
        let entries: VecDeque<QueueEntry> = match store.load(&key)? {
            Some(bytes) => codec::decode_snapshot(&bytes)?.into(),
            None => VecDeque::new(),
        };
        let capacity = capacity.max(1);

        if entries.len() > capacity {
            tracing::warn!(
                persisted = entries.len(),
                capacity,
                "persisted queue exceeds capacity; oldest entries evicted on next enqueue"
            );
        }
        tracing::info!(owner = %owner, recovered = entries.len(), "outbound queue opened");

        let state = QueueState {
            entries,
            store,
            key,
            capacity,
        };
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(state.run(rx));

        Ok(Self { tx, capacity })
    }

    /// Maximum number of entries held before eviction.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit an entry at the back of the queue.
    ///
    /// Never blocks on capacity: a full queue evicts its oldest entry.
    /// Re-enqueueing an ID that is already present changes nothing and
    /// reports its current position.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the new state could not be
    /// persisted; the queue is left unchanged.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<EnqueueReceipt, QueueError> {
        self.request(|reply| QueueCommand::Enqueue { entry, reply })
            .await?
    }

    /// Remove and return the oldest entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the removal could not be persisted.
    pub async fn dequeue_oldest(&self) -> Result<Option<QueueEntry>, QueueError> {
        self.request(|reply| QueueCommand::DequeueOldest { reply })
            .await?
    }

    /// Remove the entry for `id`, returning it if it was present.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the removal could not be persisted.
    pub async fn remove(&self, id: &MessageId) -> Result<Option<QueueEntry>, QueueError> {
        let id = id.clone();
        self.request(|reply| QueueCommand::Remove { id, reply })
            .await?
    }

    /// Replace the stored entry with the same ID, keeping its position.
    ///
    /// Returns `false` if no such entry exists.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the change could not be persisted.
    pub async fn update(&self, entry: QueueEntry) -> Result<bool, QueueError> {
        self.request(|reply| QueueCommand::Update { entry, reply })
            .await?
    }

    /// Look up the entry for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn get(&self, id: &MessageId) -> Result<Option<QueueEntry>, QueueError> {
        let id = id.clone();
        self.request(|reply| QueueCommand::Get { id, reply }).await
    }

    /// All entries in insertion order, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn all(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.request(|reply| QueueCommand::All { reply }).await
    }

    /// Number of entries currently queued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn count(&self) -> Result<usize, QueueError> {
        Ok(self.all().await?.len())
    }

    /// Whether any entry for `chat` is waiting.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the actor has stopped.
    pub async fn contains_chat(&self, chat: &ChatId) -> Result<bool, QueueError> {
        Ok(self.all().await?.iter().any(|e| e.chat_id() == chat))
    }

    /// Send one command and wait for its reply.
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }
}

/// Storage key for a user's queue snapshot.
fn storage_key(owner: &UserId) -> String {
    format!("outbox/{owner}")
}

/// State owned exclusively by the actor task.
struct QueueState<S: KvStore> {
    entries: VecDeque<QueueEntry>,
    store: S,
    key: String,
    capacity: usize,
}

impl<S: KvStore> QueueState<S> {
    /// Serve commands until every handle has been dropped.
    async fn run(mut self, mut rx: mpsc::Receiver<QueueCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                QueueCommand::Enqueue { entry, reply } => {
                    let _ = reply.send(self.enqueue(entry));
                }
                QueueCommand::DequeueOldest { reply } => {
                    let _ = reply.send(self.dequeue_oldest());
                }
                QueueCommand::Remove { id, reply } => {
                    let _ = reply.send(self.remove(&id));
                }
                QueueCommand::Update { entry, reply } => {
                    let _ = reply.send(self.update(entry));
                }
                QueueCommand::Get { id, reply } => {
                    let found = self.position(&id).map(|i| self.entries[i].clone());
                    let _ = reply.send(found);
                }
                QueueCommand::All { reply } => {
                    let _ = reply.send(self.entries.iter().cloned().collect());
                }
            }
        }
        tracing::debug!(key = %self.key, "outbound queue actor stopped");
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == id)
    }

    /// Write the whole queue through to the store.
    fn flush(&mut self) -> Result<(), QueueError> {
        let bytes = codec::encode_snapshot(self.entries.make_contiguous())?;
        self.store.save(&self.key, &bytes)?;
        Ok(())
    }

    fn enqueue(&mut self, entry: QueueEntry) -> Result<EnqueueReceipt, QueueError> {
        if let Some(position) = self.position(entry.id()) {
            return Ok(EnqueueReceipt {
                position,
                evicted: Vec::new(),
            });
        }

        let mut evicted = Vec::new();
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.oldest_index() else {
                break;
            };
            if let Some(e) = self.entries.remove(oldest) {
                evicted.push((oldest, e));
            }
        }

        let id = entry.id().clone();
        self.entries.push_back(entry);

        if let Err(err) = self.flush() {
            self.entries.pop_back();
            for (index, e) in evicted.into_iter().rev() {
                self.entries.insert(index, e);
            }
            tracing::warn!(message_id = %id, error = %err, "enqueue could not be persisted");
            return Err(err);
        }

        for (_, e) in &evicted {
            tracing::warn!(
                message_id = %e.id(),
                chat = %e.chat_id(),
                capacity = self.capacity,
                "outbound queue full, evicted oldest entry"
            );
        }
        tracing::debug!(message_id = %id, len = self.entries.len(), "entry enqueued");

        Ok(EnqueueReceipt {
            position: self.entries.len() - 1,
            evicted: evicted.into_iter().map(|(_, e)| e).collect(),
        })
    }

    /// Index of the entry with the lowest `enqueued_at`; the first one wins
    /// ties.
    fn oldest_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(i, e)| (e.enqueued_at, *i))
            .map(|(i, _)| i)
    }

    fn dequeue_oldest(&mut self) -> Result<Option<QueueEntry>, QueueError> {
        let Some(entry) = self.entries.pop_front() else {
            return Ok(None);
        };
        if let Err(err) = self.flush() {
            self.entries.push_front(entry);
            return Err(err);
        }
        Ok(Some(entry))
    }

    fn remove(&mut self, id: &MessageId) -> Result<Option<QueueEntry>, QueueError> {
        let Some(index) = self.position(id) else {
            return Ok(None);
        };
        let Some(entry) = self.entries.remove(index) else {
            return Ok(None);
        };
        if let Err(err) = self.flush() {
            self.entries.insert(index, entry);
            return Err(err);
        }
        tracing::debug!(message_id = %id, len = self.entries.len(), "entry removed");
        Ok(Some(entry))
    }

    fn update(&mut self, entry: QueueEntry) -> Result<bool, QueueError> {
        let Some(index) = self.position(entry.id()) else {
            return Ok(false);
        };
        let previous = std::mem::replace(&mut self.entries[index], entry);
        if let Err(err) = self.flush() {
            self.entries[index] = previous;
            return Err(err);
        }
        Ok(true)
    }
}
