//! Shared data model for the Courier delivery pipeline.
//!
//! Everything in this crate is plain data: message and identifier types,
//! the delivery state machine, connectivity classification, the persisted
//! queue entry, and the codec used to write the outbound queue to disk.

pub mod codec;
pub mod connection;
pub mod message;
pub mod queue;
pub mod status;
