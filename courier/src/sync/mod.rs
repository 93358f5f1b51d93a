//! Sync engine: moves queued messages to the remote store.
//!
//! The engine drains the [`OutboundQueue`] in FIFO order whenever
//! connectivity returns, a retry timer fires or the app comes back to the
//! foreground. Each entry gets one remote write bounded by the write
//! timeout:
//!
//! - accepted: tracker `Sent`, entry removed, chat summary updated
//!   best-effort;
//! - transient failure: retry counted, `Failed(reason)` and a timer that
//!   returns it to `Queued` after [`backoff_delay`], or `Abandoned` once
//!   `max_retries` is reached;
//! - permanent rejection: `Abandoned(reason)` and removal;
//! - cancelled by suspension: back to `Queued`, no retry consumed. The
//!   write may or may not have landed; the next drain re-sends the same ID
//!   and the remote store's idempotent write absorbs the duplicate.
//!
//! Within one chat nothing overtakes an entry that is waiting for its
//! backoff. Other chats keep draining.
//!
//! At most one drain runs at a time. A caller that asks for a drain while
//! one is already running waits for that pass and shares its result.
//! Entries that become sendable mid-pass (newly queued, or back from a
//! retry timer) mark the pass dirty, and it rescans the queue before it
//! finishes.
//!
//! "Last message" summary writes are bounded by the same write timeout and
//! cut short by suspension or loss of connectivity. Whatever does not
//! complete is held for the next drain.

pub mod backoff;
pub mod summary;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier_proto::message::{ChatId, Message, MessageId, Timestamp};
use courier_proto::queue::QueueEntry;
use courier_proto::status::{DeliveryStatus, FailureReason};

use crate::clock::MonotonicClock;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityObserver;
use crate::queue::{EnqueueReceipt, OutboundQueue, QueueError};
use crate::remote::RemoteStore;
use crate::tracker::{DeliveryTracker, TrackerError};

pub use backoff::backoff_delay;
use summary::SummaryWriter;

/// Errors that end a drain pass early.
///
/// Remote failures never appear here: they are recorded against the
/// message in the tracker.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The outbound queue could not be read or updated.
    #[error("outbound queue failed during drain: {0}")]
    Queue(#[from] QueueError),
}

/// Why [`SyncEngine::send_immediate`] did not confirm the message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Not online; nothing was attempted.
    #[error("not online")]
    Offline,

    /// The engine is suspended; nothing was attempted.
    #[error("sync engine is suspended")]
    Suspended,

    /// Older messages for the same chat are still queued; nothing was
    /// attempted so the message cannot overtake them.
    #[error("chat has queued messages")]
    Backlogged,

    /// The attempt failed transiently; the message is queued for retry.
    #[error("send failed ({0}), queued for retry")]
    Deferred(FailureReason),

    /// The attempt was cancelled mid-flight; the message is queued.
    #[error("send interrupted, queued for retry")]
    Interrupted,

    /// The message was abandoned.
    #[error("message abandoned: {0}")]
    Rejected(FailureReason),

    /// The message could not be queued after a failed attempt.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The message is not in a state that can be sent.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

impl SendError {
    /// Whether the caller still has to enqueue the message itself.
    #[must_use]
    pub const fn not_attempted(&self) -> bool {
        matches!(self, Self::Offline | Self::Suspended | Self::Backlogged)
    }
}

/// Result of one remote write.
#[derive(Debug)]
enum WriteOutcome {
    Accepted(Timestamp),
    Failed {
        reason: FailureReason,
        detail: String,
    },
    Cancelled,
}

/// What a drain pass does after one entry.
#[derive(Debug)]
enum Attempt {
    Sent,
    /// The chat must wait: its head entry is backing off or could not be
    /// attempted.
    Blocked(ChatId),
    Dropped,
    Cancelled,
}

/// Pass counters shared by overlapping drain requests.
#[derive(Debug, Default)]
struct DrainProgress {
    started: u64,
    finished: u64,
    /// An entry became sendable after the running pass last looked.
    dirty: bool,
}

/// Drives queued messages to the remote store.
pub struct SyncEngine<R: RemoteStore> {
    queue: OutboundQueue,
    tracker: Arc<DeliveryTracker>,
    remote: Arc<R>,
    connectivity: ConnectivityObserver,
    config: SyncConfig,
    /// Held for the whole of a drain pass or an immediate send. Stores the
    /// number of messages the last pass confirmed.
    drain_lock: tokio::sync::Mutex<usize>,
    progress: Mutex<DrainProgress>,
    suspended: watch::Sender<bool>,
    retry_timers: Mutex<HashMap<MessageId, JoinHandle<()>>>,
    summaries: SummaryWriter,
    clock: MonotonicClock,
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Create an engine. Nothing runs until a drain is requested or
    /// [`spawn_wake_task`](Self::spawn_wake_task) is called.
    #[must_use]
    pub fn new(
        queue: OutboundQueue,
        tracker: Arc<DeliveryTracker>,
        remote: Arc<R>,
        connectivity: ConnectivityObserver,
        config: SyncConfig,
    ) -> Self {
        let (suspended, _) = watch::channel(false);
        Self {
            queue,
            tracker,
            remote,
            connectivity,
            config,
            drain_lock: tokio::sync::Mutex::new(0),
            progress: Mutex::new(DrainProgress::default()),
            suspended,
            retry_timers: Mutex::new(HashMap::new()),
            summaries: SummaryWriter::new(),
            clock: MonotonicClock::new(),
        }
    }

    /// Drain the queue once.
    ///
    /// Returns the number of messages confirmed by the pass that served
    /// this request. Safe to call concurrently: a call made while a pass is
    /// running waits for it and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Queue`] if the queue fails mid-pass. Entries
    /// already handled keep their new status.
    pub async fn drain_queue(self: &Arc<Self>) -> Result<usize, SyncError> {
        let running = {
            let progress = self.progress.lock();
            (progress.started > progress.finished).then_some(progress.started)
        };
        let mut last = self.drain_lock.lock().await;
        if running.is_some_and(|pass| self.progress.lock().finished >= pass) {
            return Ok(*last);
        }
        {
            let mut progress = self.progress.lock();
            progress.started += 1;
            progress.dirty = false;
        }

        let result = self.run_pass().await;
        {
            let mut progress = self.progress.lock();
            progress.finished = progress.started;
        }
        *last = *result.as_ref().unwrap_or(&0);
        result
    }

    /// Request a drain in the background.
    pub fn trigger_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.drain_queue().await {
                Ok(synced) => tracing::debug!(synced, "background drain finished"),
                Err(err) => tracing::warn!(error = %err, "background drain failed"),
            }
        })
    }

    /// Attempt one message right away, bypassing the queue.
    ///
    /// The message must already be tracked as `Queued`. Nothing is
    /// attempted while offline, suspended, or while older messages of the
    /// same chat are queued; the caller then enqueues it. A failed attempt
    /// leaves the message queued for retry (or abandoned) exactly as a
    /// drain would.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub async fn send_immediate(self: &Arc<Self>, message: &Message) -> Result<Timestamp, SendError> {
        let _pass = self.drain_lock.lock().await;
        if self.is_suspended() {
            return Err(SendError::Suspended);
        }
        if !self.connectivity.current().is_online() {
            return Err(SendError::Offline);
        }
        if self.queue.contains_chat(&message.chat_id).await? {
            return Err(SendError::Backlogged);
        }

        let id = &message.id;
        self.tracker.set_status(id, DeliveryStatus::Sending)?;
        tracing::debug!(message_id = %id, chat = %message.chat_id, "immediate send");

        match self.write(message).await {
            WriteOutcome::Accepted(ts) => {
                self.confirm(message, ts).await;
                Ok(ts)
            }
            WriteOutcome::Cancelled => {
                self.revert_cancelled(id);
                self.enqueue(QueueEntry::new(message.clone(), self.clock.now()))
                    .await
                    .map_err(|err| self.storage_failed(id, err))?;
                Err(SendError::Interrupted)
            }
            WriteOutcome::Failed { reason, detail } if reason.is_retryable() => {
                let retry = self.tracker.increment_retry(id)?;
                if retry >= self.config.max_retries {
                    self.abandon(id, reason, &detail);
                    return Err(SendError::Rejected(reason));
                }
                let mut entry = QueueEntry::new(message.clone(), self.clock.now());
                entry.retry_count = retry;
                entry.last_attempt_at = Some(Timestamp::now());
                self.enqueue(entry)
                    .await
                    .map_err(|err| self.storage_failed(id, err))?;
                self.fail_and_schedule(id, reason, retry, &detail);
                Err(SendError::Deferred(reason))
            }
            WriteOutcome::Failed { reason, detail } => {
                self.abandon(id, reason, &detail);
                Err(SendError::Rejected(reason))
            }
        }
    }

    /// Admit an entry to the queue, abandoning whatever it evicts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the entry could not be persisted.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<EnqueueReceipt, QueueError> {
        let receipt = self.queue.enqueue(entry).await?;
        self.mark_dirty();
        for evicted in &receipt.evicted {
            self.cancel_retry(evicted.id());
            let status = DeliveryStatus::Abandoned(FailureReason::Evicted);
            if let Err(err) = self.tracker.set_status(evicted.id(), status) {
                tracing::debug!(message_id = %evicted.id(), error = %err, "evicted entry not tracked");
            }
        }
        Ok(receipt)
    }

    /// Stop all network work: cancel the in-flight write, abort retry
    /// timers (their entries go back to `Queued`) and wait for a running
    /// drain pass to wind down. Returns how many timers were cancelled.
    pub async fn suspend(&self) -> usize {
        self.suspended.send_replace(true);
        let timers: Vec<_> = self.retry_timers.lock().drain().collect();
        let mut cancelled = 0;
        for (id, handle) in timers {
            handle.abort();
            if self.requeue_if_waiting(&id) {
                cancelled += 1;
            }
        }
        drop(self.drain_lock.lock().await);
        tracing::info!(cancelled_timers = cancelled, "sync engine suspended");
        cancelled
    }

    /// Allow network work again. Does not drain by itself.
    pub fn resume(&self) {
        if self.suspended.send_replace(false) {
            tracing::info!("sync engine resumed");
        }
    }

    /// Whether [`suspend`](Self::suspend) is in effect.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    /// Number of retry timers still waiting.
    #[must_use]
    pub fn pending_retries(&self) -> usize {
        self.retry_timers
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Drop a scheduled retry, e.g. because its entry was evicted.
    pub fn cancel_retry(&self, id: &MessageId) {
        if let Some(handle) = self.retry_timers.lock().remove(id) {
            handle.abort();
        }
    }

    /// Clock that stamps composed messages and queue admissions.
    #[must_use]
    pub const fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    /// Chat summary updates that failed and are waiting for the next drain.
    #[must_use]
    pub const fn summaries(&self) -> &SummaryWriter {
        &self.summaries
    }

    /// Spawn the task that drains whenever connectivity goes from
    /// `Offline`/`Connecting` to online. Moves between `Online` and
    /// `Syncing` do not count.
    pub fn spawn_wake_task(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.connectivity.subscribe();
        tokio::spawn(async move {
            let mut was_online = rx.borrow_and_update().is_online();
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().is_online();
                if online && !was_online {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    tracing::info!("connectivity restored, draining outbound queue");
                    engine.trigger_drain();
                }
                was_online = online;
            }
            tracing::debug!("sync wake task stopped");
        })
    }

    fn can_send(&self) -> bool {
        !self.is_suspended() && self.connectivity.current().is_online()
    }

    /// One FIFO pass over the queue.
    async fn run_pass(self: &Arc<Self>) -> Result<usize, SyncError> {
        if !self.can_send() {
            tracing::debug!("drain skipped: offline or suspended");
            return Ok(0);
        }
        self.summaries
            .flush_pending(&*self.remote, self.config.write_timeout, || self.can_send())
            .await;

        let mut synced = 0;
        let mut visited: HashSet<MessageId> = HashSet::new();
        let mut blocked: HashSet<ChatId> = HashSet::new();

        loop {
            if !self.can_send() {
                tracing::debug!("drain paused: offline or suspended");
                break;
            }
            let entries = self.queue.all().await?;
            self.connectivity.report_sync(entries.len());

            let Some(entry) = self.next_eligible(entries, &visited, &mut blocked).await? else {
                if self.rescan_or_finish() {
                    tracing::debug!("queue changed mid-pass, rescanning");
                    visited.clear();
                    blocked.clear();
                    continue;
                }
                break;
            };
            visited.insert(entry.id().clone());

            match self.attempt(entry).await? {
                Attempt::Sent => synced += 1,
                Attempt::Blocked(chat) => {
                    blocked.insert(chat);
                }
                Attempt::Dropped => {}
                Attempt::Cancelled => break,
            }
        }

        let remaining = self.queue.count().await?;
        self.connectivity.report_sync(remaining);
        tracing::info!(synced, remaining, "drain pass complete");
        Ok(synced)
    }

    /// First entry, oldest first, whose chat is not blocked.
    ///
    /// Entries waiting for a retry block their chat. Entries whose message
    /// is already confirmed or abandoned are stale and removed.
    async fn next_eligible(
        &self,
        entries: Vec<QueueEntry>,
        visited: &HashSet<MessageId>,
        blocked: &mut HashSet<ChatId>,
    ) -> Result<Option<QueueEntry>, SyncError> {
        for entry in entries {
            if blocked.contains(entry.chat_id()) || visited.contains(entry.id()) {
                continue;
            }
            match self.tracker.get_status(entry.id()) {
                None => {
                    self.tracker.track(&entry.message);
                    let _ = self.tracker.restore_retry(entry.id(), entry.retry_count);
                    return Ok(Some(entry));
                }
                Some(DeliveryStatus::Queued | DeliveryStatus::Sending) => return Ok(Some(entry)),
                Some(DeliveryStatus::Failed(reason)) if reason.is_retryable() => {
                    blocked.insert(entry.chat_id().clone());
                }
                Some(status) => {
                    tracing::debug!(message_id = %entry.id(), %status, "removing stale queue entry");
                    self.queue.remove(entry.id()).await?;
                }
            }
        }
        Ok(None)
    }

    async fn attempt(self: &Arc<Self>, mut entry: QueueEntry) -> Result<Attempt, SyncError> {
        let id = entry.id().clone();
        let chat = entry.chat_id().clone();

        if let Err(err) = self.tracker.set_status(&id, DeliveryStatus::Sending) {
            tracing::warn!(message_id = %id, error = %err, "cannot attempt entry");
            return Ok(Attempt::Blocked(chat));
        }
        entry.last_attempt_at = Some(Timestamp::now());
        if let Err(err) = self.queue.update(entry.clone()).await {
            self.revert_cancelled(&id);
            return Err(err.into());
        }
        tracing::debug!(
            message_id = %id,
            chat = %chat,
            retry_count = entry.retry_count,
            "sending queued message"
        );

        let outcome = self.write(&entry.message).await;
        if !matches!(outcome, WriteOutcome::Accepted(_))
            && self.tracker.get_status(&id) != Some(DeliveryStatus::Sending)
        {
            // Evicted or discarded while the write was in flight.
            return Ok(Attempt::Dropped);
        }

        match outcome {
            WriteOutcome::Accepted(ts) => {
                self.queue.remove(&id).await?;
                self.confirm(&entry.message, ts).await;
                Ok(Attempt::Sent)
            }
            WriteOutcome::Cancelled => {
                self.revert_cancelled(&id);
                Ok(Attempt::Cancelled)
            }
            WriteOutcome::Failed { reason, detail } if reason.is_retryable() => {
                let retry = self
                    .tracker
                    .increment_retry(&id)
                    .unwrap_or_else(|_| entry.retry_count.saturating_add(1));
                if retry >= self.config.max_retries {
                    self.abandon(&id, reason, &detail);
                    self.queue.remove(&id).await?;
                    return Ok(Attempt::Dropped);
                }
                self.fail_and_schedule(&id, reason, retry, &detail);
                entry.retry_count = retry;
                self.queue.update(entry).await?;
                Ok(Attempt::Blocked(chat))
            }
            WriteOutcome::Failed { reason, detail } => {
                self.abandon(&id, reason, &detail);
                self.queue.remove(&id).await?;
                Ok(Attempt::Dropped)
            }
        }
    }

    /// One remote write, bounded by the write timeout and cut short by
    /// suspension or loss of connectivity.
    async fn write(&self, message: &Message) -> WriteOutcome {
        let mut suspended = self.suspended.subscribe();
        let mut connection = self.connectivity.subscribe();
        let put = tokio::time::timeout(
            self.config.write_timeout,
            self.remote.put_message(&message.chat_id, message),
        );

        tokio::select! {
            biased;
            () = wait_until_suspended(&mut suspended) => WriteOutcome::Cancelled,
            () = wait_until_offline(&mut connection) => WriteOutcome::Failed {
                reason: FailureReason::Interrupted,
                detail: "connectivity lost mid-flight".into(),
            },
            result = put => match result {
                Ok(Ok(ts)) => WriteOutcome::Accepted(ts),
                Ok(Err(err)) => WriteOutcome::Failed {
                    reason: err.reason(),
                    detail: err.to_string(),
                },
                Err(_elapsed) => WriteOutcome::Failed {
                    reason: FailureReason::Timeout,
                    detail: format!("no reply within {:?}", self.config.write_timeout),
                },
            },
        }
    }

    async fn confirm(&self, message: &Message, ts: Timestamp) {
        if let Err(err) = self.tracker.confirm_sent(&message.id, ts) {
            tracing::warn!(message_id = %message.id, error = %err, "confirmed write not tracked");
        }
        tracing::info!(message_id = %message.id, chat = %message.chat_id, "message sent");
        let stored = message.clone().with_server_timestamp(ts);
        let mut suspended = self.suspended.subscribe();
        let mut connection = self.connectivity.subscribe();
        tokio::select! {
            biased;
            () = wait_until_suspended(&mut suspended) => self.summaries.hold(stored.clone()),
            () = wait_until_offline(&mut connection) => self.summaries.hold(stored.clone()),
            () = self.summaries.update(&*self.remote, &stored, self.config.write_timeout) => {}
        }
    }

    fn mark_dirty(&self) {
        self.progress.lock().dirty = true;
    }

    /// Called when a pass finds nothing left to send. Returns `true` if the
    /// queue changed since the pass last looked; otherwise the pass is
    /// marked finished so later requests start a new one.
    fn rescan_or_finish(&self) -> bool {
        let mut progress = self.progress.lock();
        if std::mem::take(&mut progress.dirty) {
            return true;
        }
        progress.finished = progress.started;
        false
    }

    fn revert_cancelled(&self, id: &MessageId) {
        if let Err(err) = self.tracker.set_status(id, DeliveryStatus::Queued) {
            tracing::debug!(message_id = %id, error = %err, "cancelled entry not reverted");
        } else {
            tracing::debug!(message_id = %id, "in-flight write cancelled, outcome unknown");
        }
    }

    fn fail_and_schedule(self: &Arc<Self>, id: &MessageId, reason: FailureReason, retry: u32, detail: &str) {
        if let Err(err) = self.tracker.set_status(id, DeliveryStatus::Failed(reason)) {
            tracing::warn!(message_id = %id, error = %err, "failed attempt not recorded");
            return;
        }
        let delay = backoff_delay(retry, self.config.backoff_base, self.config.backoff_cap);
        tracing::debug!(
            message_id = %id,
            retry_count = retry,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = detail,
            "send failed, retry scheduled"
        );
        self.schedule_retry(id.clone(), delay);
    }

    fn abandon(&self, id: &MessageId, reason: FailureReason, detail: &str) {
        self.cancel_retry(id);
        match self.tracker.set_status(id, DeliveryStatus::Abandoned(reason)) {
            Ok(_) => tracing::warn!(message_id = %id, %reason, error = detail, "message abandoned"),
            Err(err) => tracing::warn!(message_id = %id, error = %err, "abandon not recorded"),
        }
    }

    fn storage_failed(&self, id: &MessageId, err: QueueError) -> SendError {
        tracing::warn!(message_id = %id, error = %err, "message could not be queued");
        let _ = self
            .tracker
            .set_status(id, DeliveryStatus::Failed(FailureReason::Storage));
        SendError::Queue(err)
    }

    fn schedule_retry(self: &Arc<Self>, id: MessageId, delay: Duration) {
        let engine = Arc::downgrade(self);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            engine.retry_timers.lock().remove(&timer_id);
            if engine.requeue_if_waiting(&timer_id) {
                engine.trigger_drain();
            }
        });
        if let Some(previous) = self.retry_timers.lock().insert(id, handle) {
            previous.abort();
        }
    }

    /// `Failed(transient) -> Queued` if the message is still waiting.
    fn requeue_if_waiting(&self, id: &MessageId) -> bool {
        match self.tracker.get_status(id) {
            Some(DeliveryStatus::Failed(reason)) if reason.is_retryable() => {
                let requeued = self.tracker.set_status(id, DeliveryStatus::Queued).is_ok();
                if requeued {
                    self.mark_dirty();
                }
                requeued
            }
            _ => false,
        }
    }
}

async fn wait_until_suspended(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|suspended| *suspended).await;
}

async fn wait_until_offline(rx: &mut watch::Receiver<courier_proto::connection::ConnectionState>) {
    let _ = rx.wait_for(|state| !state.is_online()).await;
}
