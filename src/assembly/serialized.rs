//! # Serialized packets
//!
//! The immutable value the serializer hands to the session: an encrypted
//! buffer plus everything the session needs for loss tracking and routing.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;

use crate::crypto::EncryptionLevel;
use crate::frames::QueuedFrame;
use crate::packet::PacketNumberLength;
use crate::types::PacketNumber;

/// Disposition the session chooses for a freshly serialized packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializedPacketFate {
    /// Send immediately through the packet writer.
    SendToWriter,
    /// Hold for coalescing with packets of other encryption levels.
    Coalesce,
    /// Buffer because the writer is blocked.
    Buffer,
    /// Wrap in a legacy version encapsulation envelope.
    LegacyEncapsulate,
    /// Drop without sending.
    Discard,
}

/// Why the last retransmittable frame entered the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    /// First transmission of this data.
    NotRetransmission,
    /// Resend after the loss detector declared the original lost.
    LossRetransmission,
    /// Resend triggered by a probe timeout.
    PtoRetransmission,
    /// Duplicate sent to probe a network path; padded to full size.
    ProbingRetransmission,
    /// Path-MTU discovery probe.
    MtuDiscovery,
}

/// An encrypted, wire-ready packet plus its loss-tracking metadata.
///
/// The frame lists are handed back so the session can register
/// retransmittable data with its in-flight bookkeeping; ephemeral frames
/// ride along for logging and coalesced re-serialization.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    pub packet_number: PacketNumber,
    pub packet_number_length: PacketNumberLength,

    /// Encrypted bytes, header protection applied.
    pub encrypted: Bytes,

    pub fate: SerializedPacketFate,
    pub encryption_level: EncryptionLevel,
    pub transmission_type: TransmissionType,

    pub retransmittable_frames: Vec<QueuedFrame>,
    pub nonretransmittable_frames: Vec<QueuedFrame>,

    pub has_ack: bool,
    pub has_stop_waiting: bool,
    pub has_crypto_handshake: bool,
    pub has_ack_frequency: bool,
    pub has_message: bool,

    /// Largest packet number acknowledged by an ACK in this packet.
    pub largest_acked: Option<PacketNumber>,

    pub peer_address: Option<SocketAddr>,
}

impl SerializedPacket {
    /// Total encrypted length on the wire.
    pub fn encrypted_length(&self) -> usize {
        self.encrypted.len()
    }

    /// Whether any frame in this packet is a CONNECTION_CLOSE.
    pub fn has_connection_close(&self) -> bool {
        self.retransmittable_frames
            .iter()
            .any(|frame| matches!(frame, QueuedFrame::ConnectionClose(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::types::{ConnectionCloseFrame, PingFrame};

    fn packet(frames: Vec<QueuedFrame>) -> SerializedPacket {
        SerializedPacket {
            packet_number: 1,
            packet_number_length: PacketNumberLength::One,
            encrypted: Bytes::from_static(&[0u8; 40]),
            fate: SerializedPacketFate::SendToWriter,
            encryption_level: EncryptionLevel::ForwardSecure,
            transmission_type: TransmissionType::NotRetransmission,
            retransmittable_frames: frames,
            nonretransmittable_frames: Vec::new(),
            has_ack: false,
            has_stop_waiting: false,
            has_crypto_handshake: false,
            has_ack_frequency: false,
            has_message: false,
            largest_acked: None,
            peer_address: None,
        }
    }

    #[test]
    fn test_has_connection_close() {
        let ping = packet(vec![QueuedFrame::Ping(PingFrame { control_frame_id: 1 })]);
        assert!(!ping.has_connection_close());

        let close = packet(vec![QueuedFrame::ConnectionClose(ConnectionCloseFrame {
            error_code: 1,
            frame_type: None,
            reason: Bytes::new(),
            application_close: false,
        })]);
        assert!(close.has_connection_close());
        assert_eq!(close.encrypted_length(), 40);
    }
}
