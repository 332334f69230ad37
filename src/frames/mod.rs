//! Queued frame types and the wire codec for outgoing packets.

pub mod codec;
pub mod types;

pub use types::QueuedFrame;
