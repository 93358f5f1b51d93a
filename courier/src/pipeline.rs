//! The assembled delivery pipeline for one signed-in user.
//!
//! [`Courier`] wires the outbound queue, delivery tracker, connectivity
//! observer, sync engine, remote listeners and lifecycle coordinator
//! together and exposes the operations the UI needs.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use courier_proto::connection::ConnectionState;
use courier_proto::message::{ChatId, Message, MessageId, Timestamp, UserId, ValidationError};
use courier_proto::queue::QueueEntry;
use courier_proto::status::{DeliveryStatus, FailureReason};

use crate::config::CourierConfig;
use crate::connectivity::{ConnectivityObserver, ReachabilityFeed};
use crate::lifecycle::{LifecycleCoordinator, LifecycleError, TransitionRecord};
use crate::listener::{InboundMessage, ListenerSet};
use crate::queue::{OutboundQueue, QueueError};
use crate::remote::RemoteStore;
use crate::storage::KvStore;
use crate::sync::{SendError, SyncEngine, SyncError};
use crate::tracker::{DeliveryTracker, StatusChange, TrackerError};

/// Errors that prevent the pipeline from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The persisted queue could not be opened.
    #[error("could not open outbound queue: {0}")]
    Queue(#[from] QueueError),

    /// The configuration is out of range.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Errors returned by pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    /// The message text was rejected before anything was stored.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The message could not be persisted; it is marked
    /// `Failed(Storage)` and can be retried manually.
    #[error("message could not be stored: {source}")]
    Storage {
        /// The message, for a later [`Courier::retry`].
        message: Box<Message>,
        /// What the queue reported.
        source: QueueError,
    },

    /// The outbound queue failed outside of a send.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The message is unknown or in the wrong state.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// The operation needs a message in a manually retryable state.
    #[error("message {id} is {status} and cannot be retried or discarded")]
    NotRetryable {
        /// The message.
        id: MessageId,
        /// Its current status.
        status: DeliveryStatus,
    },
}

/// Outcome of [`Courier::send_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// The composed message, including its ID and client timestamp.
    pub message: Message,
    /// Status when `send_text` returned.
    pub status: DeliveryStatus,
}

/// Everything [`Courier::start`] hands back.
pub struct Started<R: RemoteStore> {
    /// The running pipeline.
    pub courier: Courier<R>,
    /// Where the platform reports raw reachability changes.
    pub reachability: ReachabilityFeed,
    /// Messages written by other participants in watched chats.
    pub inbound: mpsc::Receiver<InboundMessage>,
}

/// The delivery pipeline for one user.
pub struct Courier<R: RemoteStore> {
    user: UserId,
    queue: OutboundQueue,
    tracker: Arc<DeliveryTracker>,
    engine: Arc<SyncEngine<R>>,
    connectivity: ConnectivityObserver,
    listeners: Arc<ListenerSet<R>>,
    lifecycle: LifecycleCoordinator<R>,
    wake_task: JoinHandle<()>,
}

impl<R: RemoteStore> Courier<R> {
    /// Open `user`'s persisted queue in `store` and start the pipeline.
    ///
    /// Entries recovered from a previous run are registered as `Queued`
    /// with their retry counts and sent on the next drain. Connectivity
    /// starts `Offline` until the platform reports reachability.
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] if the configuration is invalid or the queue
    /// cannot be opened.
    pub async fn start<S: KvStore>(
        config: &CourierConfig,
        user: UserId,
        store: S,
        remote: Arc<R>,
    ) -> Result<Started<R>, StartError> {
        config.validate()?;

        let queue = OutboundQueue::open(store, &user, config.queue.capacity)?;
        let tracker = Arc::new(DeliveryTracker::new(config.event_buffer));

        let recovered = queue.all().await?;
        for entry in &recovered {
            tracker.track(&entry.message);
            let _ = tracker.restore_retry(entry.id(), entry.retry_count);
        }
        if !recovered.is_empty() {
            tracing::info!(user = %user, recovered = recovered.len(), "recovered queued messages");
        }

        let (connectivity, reachability) =
            ConnectivityObserver::spawn(config.connectivity.clone(), ConnectionState::Offline);
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            Arc::clone(&tracker),
            Arc::clone(&remote),
            connectivity.clone(),
            config.sync.clone(),
        ));
        for entry in &recovered {
            engine.clock().advance_past(entry.enqueued_at);
            engine.clock().advance_past(entry.message.client_timestamp);
        }
        let wake_task = engine.spawn_wake_task();

        let (listeners, inbound) =
            ListenerSet::new(remote, Arc::clone(&tracker), user.clone(), config.event_buffer);
        let listeners = Arc::new(listeners);

        let lifecycle = LifecycleCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&listeners),
            connectivity.clone(),
            queue.clone(),
            config.lifecycle.clone(),
        );

        tracing::info!(user = %user, capacity = queue.capacity(), "courier started");
        Ok(Started {
            courier: Self {
                user,
                queue,
                tracker,
                engine,
                connectivity,
                listeners,
                lifecycle,
                wake_task,
            },
            reachability,
            inbound,
        })
    }

    /// The signed-in user.
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    /// Compose and send a text message.
    ///
    /// The message is tracked as `Queued` before any network work so the UI
    /// can show it at once. When online with nothing older queued for the
    /// chat it is written right away; otherwise it is queued durably and a
    /// drain is requested.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::Validation`] for empty or oversized text, or
    /// [`CourierError::Storage`] if the message could not be queued (it is
    /// then `Failed(Storage)`).
    pub async fn send_text(&self, chat: &ChatId, text: &str) -> Result<SendReceipt, CourierError> {
        let message = Message::compose(
            chat.clone(),
            self.user.clone(),
            text,
            self.engine.clock().now(),
        )?;
        self.tracker.track(&message);

        match self.engine.send_immediate(&message).await {
            Ok(_) => {}
            Err(err) if err.not_attempted() => {
                tracing::debug!(message_id = %message.id, reason = %err, "queueing message");
                self.queue_and_wake(&message).await?;
            }
            Err(SendError::Queue(source)) => {
                return Err(CourierError::Storage {
                    message: Box::new(message),
                    source,
                });
            }
            Err(err) => {
                tracing::debug!(message_id = %message.id, error = %err, "immediate send did not confirm");
            }
        }

        let status = self
            .tracker
            .get_status(&message.id)
            .unwrap_or(DeliveryStatus::Queued);
        Ok(SendReceipt { message, status })
    }

    /// Manually retry a message that was abandoned or could not be stored.
    ///
    /// Resets its retry count and queues it again under the same ID.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::NotRetryable`] if the message is not in a
    /// manually retryable state, or [`CourierError::Storage`] if it could
    /// not be queued.
    pub async fn retry(&self, message: &Message) -> Result<DeliveryStatus, CourierError> {
        let status = self
            .tracker
            .get_status(&message.id)
            .ok_or_else(|| TrackerError::Unknown(message.id.clone()))?;
        if !status.is_manually_retryable() {
            return Err(CourierError::NotRetryable {
                id: message.id.clone(),
                status,
            });
        }

        self.tracker.reset_retry(&message.id)?;
        self.tracker.set_status(&message.id, DeliveryStatus::Queued)?;
        tracing::info!(message_id = %message.id, previous = %status, "manual retry");
        self.queue_and_wake(message).await?;
        Ok(self
            .tracker
            .get_status(&message.id)
            .unwrap_or(DeliveryStatus::Queued))
    }

    /// Delete a message the pipeline gave up on.
    ///
    /// # Errors
    ///
    /// Returns [`CourierError::NotRetryable`] unless the message is
    /// abandoned or failed permanently.
    pub async fn discard(&self, id: &MessageId) -> Result<(), CourierError> {
        let status = self
            .tracker
            .get_status(id)
            .ok_or_else(|| TrackerError::Unknown(id.clone()))?;
        if !status.is_manually_retryable() {
            return Err(CourierError::NotRetryable {
                id: id.clone(),
                status,
            });
        }
        self.queue.remove(id).await?;
        self.tracker.forget(id);
        tracing::debug!(message_id = %id, "message discarded");
        Ok(())
    }

    /// Current delivery status of a message.
    #[must_use]
    pub fn status(&self, id: &MessageId) -> Option<DeliveryStatus> {
        self.tracker.get_status(id)
    }

    /// Server timestamp of a confirmed message.
    #[must_use]
    pub fn server_timestamp(&self, id: &MessageId) -> Option<Timestamp> {
        self.tracker.server_timestamp(id)
    }

    /// Failed attempts so far for a message.
    #[must_use]
    pub fn retry_count(&self, id: &MessageId) -> Option<u32> {
        self.tracker.retry_count(id)
    }

    /// Stream of status changes in `chat`.
    #[must_use]
    pub fn observe(&self, chat: ChatId) -> BoxStream<'static, StatusChange> {
        self.tracker.observe(chat)
    }

    /// Queued entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the queue has shut down.
    pub async fn pending(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.queue.all().await
    }

    /// Start listening for remote changes in `chat`.
    pub fn watch_chat(&self, chat: ChatId) -> bool {
        self.listeners.watch(chat)
    }

    /// Drain the queue now and wait for the result.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::drain_queue`].
    pub async fn drain(&self) -> Result<usize, SyncError> {
        self.engine.drain_queue().await
    }

    /// The lifecycle hooks for the host.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleCoordinator<R> {
        &self.lifecycle
    }

    /// Current connectivity.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connectivity.current()
    }

    /// Receiver notified on every connectivity change.
    #[must_use]
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connectivity.subscribe()
    }

    /// Stop all network work. The queue keeps everything not yet sent.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Terminated`] if already terminated.
    pub async fn shutdown(self) -> Result<TransitionRecord, LifecycleError> {
        let record = self.lifecycle.on_terminate().await;
        self.wake_task.abort();
        tracing::info!(user = %self.user, "courier stopped");
        record
    }

    /// Queue `message` and request a drain when one could make progress.
    async fn queue_and_wake(&self, message: &Message) -> Result<(), CourierError> {
        let entry = QueueEntry::new(message.clone(), self.engine.clock().now());
        match self.engine.enqueue(entry).await {
            Ok(receipt) => {
                tracing::debug!(message_id = %message.id, position = receipt.position, "message queued");
            }
            Err(source) => {
                tracing::warn!(message_id = %message.id, error = %source, "message could not be queued");
                let _ = self
                    .tracker
                    .set_status(&message.id, DeliveryStatus::Failed(FailureReason::Storage));
                return Err(CourierError::Storage {
                    message: Box::new(message.clone()),
                    source,
                });
            }
        }
        if self.connectivity.current().is_online() && !self.engine.is_suspended() {
            self.engine.trigger_drain();
        }
        Ok(())
    }
}
