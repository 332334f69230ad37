//! # Session delegate
//!
//! The assembler's only channel back to the session. All callbacks are
//! synchronous and run inline; the core holds the delegate by value and
//! never retains a handle into the session beyond it.

#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};

use crate::assembly::serialized::{SerializedPacket, SerializedPacketFate};
use crate::crypto::EncryptionLevel;
use crate::error::UnrecoverableError;
use crate::frames::QueuedFrame;
use crate::types::{StreamId, StreamOffset};

/// Decisions and notifications the session provides to the assembler.
pub trait AssemblerDelegate {
    /// Provide an output buffer for the next serialization. Returning
    /// `None` makes the core allocate its own; the published packet owns
    /// its bytes either way.
    fn packet_buffer(&mut self) -> Option<BytesMut> {
        None
    }

    /// Whether a new packet may be started right now. `retransmittable`
    /// says the packet would carry retransmittable data; `handshake` says
    /// it would carry crypto handshake data (which bypasses congestion
    /// blocking in most sessions).
    fn should_generate_packet(&mut self, retransmittable: bool, handshake: bool) -> bool;

    /// Disposition for the packet about to be published.
    fn serialized_packet_fate(
        &mut self,
        is_mtu_discovery: bool,
        level: EncryptionLevel,
    ) -> SerializedPacketFate;

    /// Consume ownership of a finished packet.
    fn on_serialized_packet(&mut self, packet: SerializedPacket);

    /// ACK (and STOP_WAITING) frames to bundle into the packet being
    /// built, if the session has any pending. Called at most once per
    /// write operation.
    fn maybe_bundle_ack_opportunistically(&mut self) -> Vec<QueuedFrame>;

    /// An unrecoverable failure; the connection must be torn down.
    fn on_unrecoverable_error(&mut self, error: UnrecoverableError, details: &str);
}

/// Source of the actual bytes for stream and crypto frames.
///
/// The assembler works in lengths until a frame is committed; only then are
/// the bytes materialized from the session's send buffers.
pub trait StreamDataProducer {
    /// `length` bytes of stream `id` starting at `offset`, or `None` when
    /// the send buffer cannot satisfy the range.
    fn stream_data(&mut self, id: StreamId, offset: StreamOffset, length: usize) -> Option<Bytes>;

    /// `length` bytes of the crypto stream at `level` starting at `offset`.
    fn crypto_data(
        &mut self,
        level: EncryptionLevel,
        offset: StreamOffset,
        length: usize,
    ) -> Option<Bytes>;
}
