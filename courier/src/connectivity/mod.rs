//! Connectivity classification.
//!
//! The platform pushes raw reachability events through a
//! [`ReachabilityFeed`]. A single observer task debounces them, classifies
//! the result into a [`ConnectionState`] and publishes it on a `watch`
//! channel, so subscribers only ever see actual changes.
//!
//! ```text
//! Offline ──Up──▶ Connecting ──settle──▶ Online ◀──▶ Syncing { pending }
//!    ▲                │                    │
//!    └──Down/Probe────┴────────────────────┘
//! ```

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use courier_proto::connection::ConnectionState;

use crate::config::ConnectivityConfig;

/// Network interface reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Wi-Fi.
    Wifi,
    /// Mobile data.
    Cellular,
    /// Ethernet or similar.
    Wired,
    /// Anything else (VPN, loopback, unknown).
    Other,
}

/// Unclassified reachability signal from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// A route to the internet exists over this interface.
    Up(Interface),
    /// No route.
    Down,
    /// The platform could not determine reachability.
    ProbeFailed,
}

/// Input to the observer task.
#[derive(Debug, Clone, Copy)]
enum ObserverInput {
    Raw(Reachability),
    Reevaluate,
    SyncProgress(usize),
}

/// Handle the platform uses to report raw reachability changes.
#[derive(Debug, Clone)]
pub struct ReachabilityFeed {
    tx: mpsc::UnboundedSender<ObserverInput>,
}

impl ReachabilityFeed {
    /// Report a raw reachability event. Never blocks.
    pub fn push(&self, event: Reachability) {
        if self.tx.send(ObserverInput::Raw(event)).is_err() {
            tracing::debug!(?event, "connectivity observer stopped, event dropped");
        }
    }
}

/// Read side of the connectivity observer.
///
/// Cheap to clone. The observer task stops once every handle and every
/// [`ReachabilityFeed`] has been dropped.
#[derive(Debug, Clone)]
pub struct ConnectivityObserver {
    state: watch::Receiver<ConnectionState>,
    tx: mpsc::UnboundedSender<ObserverInput>,
}

impl ConnectivityObserver {
    /// Spawn the observer task starting in `initial`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(config: ConnectivityConfig, initial: ConnectionState) -> (Self, ReachabilityFeed) {
        let (state_tx, state) = watch::channel(initial);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, state_tx, config));
        (
            Self {
                state,
                tx: tx.clone(),
            },
            ReachabilityFeed { tx },
        )
    }

    /// The current classified state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that is notified on every classified change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Re-classify the last raw signal, e.g. after returning to the
    /// foreground.
    pub fn reevaluate(&self) {
        let _ = self.tx.send(ObserverInput::Reevaluate);
    }

    /// Publish sync progress: `Syncing { pending }` while entries remain,
    /// `Online` once they are gone. Ignored while not online.
    pub fn report_sync(&self, pending: usize) {
        let _ = self.tx.send(ObserverInput::SyncProgress(pending));
    }
}

/// What to do after a debounced raw signal has been classified.
enum Classified {
    Offline,
    Reachable,
}

const fn classify(raw: Reachability) -> Classified {
    match raw {
        Reachability::Up(_) => Classified::Reachable,
        Reachability::Down | Reachability::ProbeFailed => Classified::Offline,
    }
}

/// Observer task: owns the state until all senders are gone.
async fn run(
    mut rx: mpsc::UnboundedReceiver<ObserverInput>,
    state: watch::Sender<ConnectionState>,
    config: ConnectivityConfig,
) {
    let mut last_raw: Option<Reachability> = None;
    let mut carry: Option<ObserverInput> = None;

    loop {
        let input = match carry.take() {
            Some(input) => input,
            None => match rx.recv().await {
                Some(input) => input,
                None => break,
            },
        };

        let raw = match input {
            ObserverInput::SyncProgress(pending) => {
                publish_progress(&state, pending);
                continue;
            }
            ObserverInput::Reevaluate => match last_raw {
                Some(raw) => raw,
                None => continue,
            },
            ObserverInput::Raw(first) => {
                let Some(latest) = debounce(&mut rx, &state, first, config.debounce).await else {
                    break;
                };
                latest
            }
        };
        last_raw = Some(raw);

        match classify(raw) {
            Classified::Offline => publish(&state, ConnectionState::Offline),
            Classified::Reachable => {
                if state.borrow().is_online() {
                    continue;
                }
                publish(&state, ConnectionState::Connecting);
                match settle(&mut rx, config.settle).await {
                    Settle::Held => publish(&state, ConnectionState::Online),
                    Settle::Interrupted(next) => carry = Some(next),
                    Settle::Closed => break,
                }
            }
        }
    }
    tracing::debug!("connectivity observer stopped");
}

/// Collapse raw events arriving within `window` of `first` into the latest.
///
/// Returns `None` if every sender is gone.
async fn debounce(
    rx: &mut mpsc::UnboundedReceiver<ObserverInput>,
    state: &watch::Sender<ConnectionState>,
    first: Reachability,
    window: std::time::Duration,
) -> Option<Reachability> {
    let deadline = Instant::now() + window;
    let mut latest = first;
    loop {
        tokio::select! {
            () = sleep_until(deadline) => return Some(latest),
            next = rx.recv() => match next? {
                ObserverInput::Raw(event) => latest = event,
                ObserverInput::SyncProgress(pending) => publish_progress(state, pending),
                ObserverInput::Reevaluate => {}
            },
        }
    }
}

enum Settle {
    Held,
    Interrupted(ObserverInput),
    Closed,
}

/// Wait out the settle delay. A raw event in the meantime interrupts it and
/// is handed back for normal processing.
async fn settle(rx: &mut mpsc::UnboundedReceiver<ObserverInput>, delay: std::time::Duration) -> Settle {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            () = sleep_until(deadline) => return Settle::Held,
            next = rx.recv() => match next {
                None => return Settle::Closed,
                Some(ObserverInput::Raw(Reachability::Up(_))) => {}
                Some(raw @ ObserverInput::Raw(_)) => return Settle::Interrupted(raw),
                // Nothing to report while not yet online.
                Some(ObserverInput::SyncProgress(_) | ObserverInput::Reevaluate) => {}
            },
        }
    }
}

fn publish(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        tracing::info!(from = %current, to = %next, "connectivity changed");
        *current = next;
        true
    });
}

fn publish_progress(state: &watch::Sender<ConnectionState>, pending: usize) {
    state.send_if_modified(|current| {
        if !current.is_online() {
            return false;
        }
        let next = if pending == 0 {
            ConnectionState::Online
        } else {
            ConnectionState::Syncing { pending }
        };
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}
