//! Courier: offline-resilient delivery of outgoing chat messages.
//!
//! Messages composed while offline go to a durable outbound queue, are
//! tracked through `Queued → Sending → Sent → Delivered → Read`, and are
//! written to the remote store when connectivity returns. App lifecycle
//! hooks stop and restart network work within fixed time budgets.
//!
//! [`pipeline::Courier`] assembles the pieces; each module can also be used
//! on its own.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod lifecycle;
pub mod listener;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod tracker;
