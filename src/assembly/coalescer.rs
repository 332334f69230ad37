//! # Datagram coalescing (RFC 9000 Section 12.2)
//!
//! Collects serialized packets of different encryption levels destined for
//! the same peer and packs them into one UDP datagram, INITIAL first. The
//! INITIAL packet keeps its frames so the assembler can rebuild it with
//! tail padding filling the datagram.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::debug;

use crate::assembly::serialized::SerializedPacket;
use crate::crypto::EncryptionLevel;

/// Packets of distinct encryption levels awaiting one UDP datagram.
///
/// Levels other than INITIAL are stored as their encrypted bytes only; the
/// INITIAL packet is kept whole because serialization replays its frames
/// with added padding.
#[derive(Debug, Default)]
pub struct CoalescedPacket {
    max_packet_length: usize,
    length: usize,
    peer_address: Option<SocketAddr>,
    initial_packet: Option<SerializedPacket>,
    handshake: Option<Bytes>,
    zero_rtt: Option<Bytes>,
    forward_secure: Option<Bytes>,
}

impl CoalescedPacket {
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            max_packet_length,
            ..Self::default()
        }
    }

    /// Total bytes accumulated so far.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    pub fn initial_packet(&self) -> Option<&SerializedPacket> {
        self.initial_packet.as_ref()
    }

    /// Encrypted bytes stored for `level`; INITIAL is kept as a whole
    /// packet instead.
    pub fn encrypted_buffer(&self, level: EncryptionLevel) -> Option<&Bytes> {
        match level {
            EncryptionLevel::Initial => None,
            EncryptionLevel::Handshake => self.handshake.as_ref(),
            EncryptionLevel::ZeroRtt => self.zero_rtt.as_ref(),
            EncryptionLevel::ForwardSecure => self.forward_secure.as_ref(),
        }
    }

    pub fn contains_packet_of(&self, level: EncryptionLevel) -> bool {
        match level {
            EncryptionLevel::Initial => self.initial_packet.is_some(),
            _ => self.encrypted_buffer(level).is_some(),
        }
    }

    /// Try to absorb `packet`. Refused when the level slot is taken, the
    /// datagram would overflow, or the peer address differs from earlier
    /// packets.
    pub fn maybe_coalesce_packet(&mut self, packet: SerializedPacket) -> bool {
        if packet.encrypted.is_empty() {
            debug!("refusing to coalesce empty packet");
            return false;
        }
        match (self.peer_address, packet.peer_address) {
            (Some(current), Some(address)) if current != address => {
                debug!(%current, %address, "refusing to coalesce packet for another peer");
                return false;
            }
            (None, address) => self.peer_address = address,
            _ => {}
        }
        if self.contains_packet_of(packet.encryption_level) {
            debug!(level = %packet.encryption_level, "level already coalesced");
            return false;
        }
        if self.length + packet.encrypted_length() > self.max_packet_length {
            return false;
        }
        self.length += packet.encrypted_length();
        match packet.encryption_level {
            EncryptionLevel::Initial => self.initial_packet = Some(packet),
            EncryptionLevel::Handshake => self.handshake = Some(packet.encrypted),
            EncryptionLevel::ZeroRtt => self.zero_rtt = Some(packet.encrypted),
            EncryptionLevel::ForwardSecure => self.forward_secure = Some(packet.encrypted),
        }
        true
    }

    /// Drop all stored packets, keeping the length budget.
    pub fn clear(&mut self) {
        let max_packet_length = self.max_packet_length;
        *self = Self::new(max_packet_length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::serialized::{SerializedPacketFate, TransmissionType};
    use crate::packet::number::PacketNumberLength;

    fn packet(level: EncryptionLevel, len: usize) -> SerializedPacket {
        SerializedPacket {
            packet_number: 1,
            packet_number_length: PacketNumberLength::One,
            encrypted: Bytes::from(vec![0xabu8; len]),
            fate: SerializedPacketFate::Coalesce,
            encryption_level: level,
            transmission_type: TransmissionType::NotRetransmission,
            retransmittable_frames: Vec::new(),
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
    fn test_accumulates_distinct_levels() {
        let mut coalesced = CoalescedPacket::new(1350);
        assert!(coalesced.maybe_coalesce_packet(packet(EncryptionLevel::Initial, 120)));
        assert!(coalesced.maybe_coalesce_packet(packet(EncryptionLevel::Handshake, 80)));
        assert_eq!(coalesced.length(), 200);
        assert!(coalesced.contains_packet_of(EncryptionLevel::Initial));
        assert!(coalesced.contains_packet_of(EncryptionLevel::Handshake));
        assert!(!coalesced.contains_packet_of(EncryptionLevel::ForwardSecure));
    }

    #[test]
    fn test_rejects_duplicate_level() {
        let mut coalesced = CoalescedPacket::new(1350);
        assert!(coalesced.maybe_coalesce_packet(packet(EncryptionLevel::Handshake, 80)));
        assert!(!coalesced.maybe_coalesce_packet(packet(EncryptionLevel::Handshake, 70)));
        assert_eq!(coalesced.length(), 80);
    }

    #[test]
    fn test_rejects_overflow() {
        let mut coalesced = CoalescedPacket::new(200);
        assert!(coalesced.maybe_coalesce_packet(packet(EncryptionLevel::Initial, 150)));
        assert!(!coalesced.maybe_coalesce_packet(packet(EncryptionLevel::Handshake, 60)));
        assert_eq!(coalesced.length(), 150);
    }

    #[test]
    fn test_rejects_peer_address_change() {
        let mut coalesced = CoalescedPacket::new(1350);
        let mut first = packet(EncryptionLevel::Initial, 100);
        first.peer_address = Some("10.0.0.1:443".parse().unwrap());
        let mut second = packet(EncryptionLevel::Handshake, 100);
        second.peer_address = Some("10.0.0.2:443".parse().unwrap());
        assert!(coalesced.maybe_coalesce_packet(first));
        assert!(!coalesced.maybe_coalesce_packet(second));
    }

    #[test]
    fn test_clear_resets_contents() {
        let mut coalesced = CoalescedPacket::new(1350);
        assert!(coalesced.maybe_coalesce_packet(packet(EncryptionLevel::ForwardSecure, 90)));
        coalesced.clear();
        assert!(coalesced.is_empty());
        assert_eq!(coalesced.max_packet_length(), 1350);
        assert!(!coalesced.contains_packet_of(EncryptionLevel::ForwardSecure));
    }
}
