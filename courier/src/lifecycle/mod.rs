//! App lifecycle coordination.
//!
//! The host calls [`LifecycleCoordinator::on_foreground`],
//! [`on_background`](LifecycleCoordinator::on_background) and
//! [`on_terminate`](LifecycleCoordinator::on_terminate) as the app moves
//! between phases. Each hook is bounded by a time budget and returns a
//! [`TransitionRecord`]; the last few records are kept for diagnostics.
//!
//! Zero message loss across termination comes from the outbound queue's
//! write-through persistence, not from these hooks. They only stop and
//! restart network work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use courier_proto::message::Timestamp;

use crate::config::LifecycleConfig;
use crate::connectivity::ConnectivityObserver;
use crate::listener::ListenerSet;
use crate::queue::OutboundQueue;
use crate::remote::RemoteStore;
use crate::sync::SyncEngine;

/// Where the app is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Visible and interactive.
    Active,
    /// Suspended by the OS; no network work.
    Background,
    /// About to exit. Never left.
    Terminated,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Background => f.write_str("background"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Errors returned by the lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The app already terminated; the hook was ignored.
    #[error("lifecycle already terminated")]
    Terminated,
}

/// One completed lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    /// Wall-clock time the hook started.
    pub at: Timestamp,
    /// Phase before the hook.
    pub from: LifecyclePhase,
    /// Phase after the hook.
    pub to: LifecyclePhase,
    /// How long the hook took.
    pub duration: Duration,
    /// Queue entries waiting when the hook finished.
    pub pending: usize,
    /// Whether the hook stayed within its budget.
    pub within_budget: bool,
}

/// Stops and restarts network work as the app changes phase.
pub struct LifecycleCoordinator<R: RemoteStore> {
    engine: Arc<SyncEngine<R>>,
    listeners: Arc<ListenerSet<R>>,
    connectivity: ConnectivityObserver,
    queue: OutboundQueue,
    config: LifecycleConfig,
    phase: Mutex<LifecyclePhase>,
    log: Mutex<VecDeque<TransitionRecord>>,
}

impl<R: RemoteStore> LifecycleCoordinator<R> {
    /// Create a coordinator in the `Active` phase.
    #[must_use]
    pub fn new(
        engine: Arc<SyncEngine<R>>,
        listeners: Arc<ListenerSet<R>>,
        connectivity: ConnectivityObserver,
        queue: OutboundQueue,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            engine,
            listeners,
            connectivity,
            queue,
            config,
            phase: Mutex::new(LifecyclePhase::Active),
            log: Mutex::new(VecDeque::new()),
        }
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock()
    }

    /// Recent transitions, oldest first.
    #[must_use]
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.log.lock().iter().cloned().collect()
    }

    /// The app became visible: resume the engine, re-open listeners,
    /// re-evaluate reachability and start one drain without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Terminated`] after
    /// [`on_terminate`](Self::on_terminate).
    pub async fn on_foreground(&self) -> Result<TransitionRecord, LifecycleError> {
        let started = Instant::now();
        let at = Timestamp::now();
        let from = self.enter(LifecyclePhase::Active)?;

        self.engine.resume();
        self.listeners.start_all();
        self.connectivity.reevaluate();
        self.engine.trigger_drain();

        let budget = self.config.resume_budget;
        let pending = self.pending_within(budget.saturating_sub(started.elapsed())).await;
        Ok(self.record(at, from, LifecyclePhase::Active, started, budget, pending))
    }

    /// The app is being suspended: cancel in-flight and scheduled network
    /// work and close listeners. The queue is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Terminated`] after
    /// [`on_terminate`](Self::on_terminate).
    pub async fn on_background(&self) -> Result<TransitionRecord, LifecycleError> {
        let started = Instant::now();
        let at = Timestamp::now();
        let from = self.enter(LifecyclePhase::Background)?;

        let pending = self.quiesce(started).await;
        Ok(self.record(
            at,
            from,
            LifecyclePhase::Background,
            started,
            self.config.suspend_budget,
            pending,
        ))
    }

    /// The app is exiting. Best effort: same as
    /// [`on_background`](Self::on_background), and later hooks are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Terminated`] if called twice.
    pub async fn on_terminate(&self) -> Result<TransitionRecord, LifecycleError> {
        let started = Instant::now();
        let at = Timestamp::now();
        let from = self.enter(LifecyclePhase::Terminated)?;

        let pending = self.quiesce(started).await;
        Ok(self.record(
            at,
            from,
            LifecyclePhase::Terminated,
            started,
            self.config.suspend_budget,
            pending,
        ))
    }

    /// Switch phase, refusing to leave `Terminated`.
    fn enter(&self, to: LifecyclePhase) -> Result<LifecyclePhase, LifecycleError> {
        let mut phase = self.phase.lock();
        let from = *phase;
        if from == LifecyclePhase::Terminated {
            tracing::warn!(requested = %to, "lifecycle hook after termination ignored");
            return Err(LifecycleError::Terminated);
        }
        *phase = to;
        Ok(from)
    }

    /// Stop network work within the suspend budget. Returns the pending
    /// count.
    async fn quiesce(&self, started: Instant) -> usize {
        let budget = self.config.suspend_budget;
        self.listeners.stop_all();
        if tokio::time::timeout(budget, self.engine.suspend())
            .await
            .is_err()
        {
            tracing::warn!(
                budget_ms = millis(budget),
                "sync engine did not settle within suspend budget"
            );
        }
        self.pending_within(budget.saturating_sub(started.elapsed()))
            .await
    }

    /// Queue length, or zero if it cannot be read in time.
    async fn pending_within(&self, limit: Duration) -> usize {
        match tokio::time::timeout(limit, self.queue.count()).await {
            Ok(Ok(pending)) => pending,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "pending count unavailable");
                0
            }
            Err(_) => 0,
        }
    }

    fn record(
        &self,
        at: Timestamp,
        from: LifecyclePhase,
        to: LifecyclePhase,
        started: Instant,
        budget: Duration,
        pending: usize,
    ) -> TransitionRecord {
        let duration = started.elapsed();
        let within_budget = duration <= budget;
        if within_budget {
            tracing::info!(
                %from,
                %to,
                elapsed_ms = millis(duration),
                pending,
                "lifecycle transition"
            );
        } else {
            tracing::warn!(
                %from,
                %to,
                elapsed_ms = millis(duration),
                budget_ms = millis(budget),
                pending,
                "lifecycle transition exceeded budget"
            );
        }

        let record = TransitionRecord {
            at,
            from,
            to,
            duration,
            pending,
            within_budget,
        };
        let mut log = self.log.lock();
        while log.len() >= self.config.log_capacity.max(1) {
            log.pop_front();
        }
        log.push_back(record.clone());
        record
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
