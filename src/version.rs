//! # QUIC version predicates (RFC 8999, RFC 9000 Section 15)
//!
//! The send path varies along a handful of version axes: header form,
//! presence of long-header length fields, frame encoding generation, header
//! protection, and AEAD tag size. A [`Version`] value object answers those
//! questions; all sizing and emission code is parameterized on it.

#![forbid(unsafe_code)]

use crate::crypto::EncryptionLevel;
use crate::types::StreamId;

/// Handshake protocol used by a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProtocol {
    /// Google QUIC crypto: handshake carried in stream frames on the
    /// dedicated crypto stream, 12-byte AEAD tags.
    QuicCrypto,
    /// TLS 1.3: handshake carried in CRYPTO frames, 16-byte AEAD tags.
    Tls,
}

/// Long header packet types (RFC 9000 Section 17.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongHeaderType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongHeaderType {
    /// Type bits placed in bits 4-5 of the first header byte.
    pub fn type_bits(self) -> u8 {
        match self {
            LongHeaderType::Initial => 0x00,
            LongHeaderType::ZeroRtt => 0x01,
            LongHeaderType::Handshake => 0x02,
            LongHeaderType::Retry => 0x03,
        }
    }
}

/// A concrete QUIC version with its wire-format properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    wire: u32,
    handshake: HandshakeProtocol,
    has_header_protection: bool,
    has_ietf_quic_frames: bool,
    has_long_header_lengths: bool,
    has_ietf_invariant_header: bool,
    supports_client_connection_ids: bool,
    supports_message_frames: bool,
}

impl Version {
    /// QUIC v1 (RFC 9000): IETF frames, TLS handshake, 16-byte tags.
    pub const RFC_V1: Version = Version {
        wire: 0x0000_0001,
        handshake: HandshakeProtocol::Tls,
        has_header_protection: true,
        has_ietf_quic_frames: true,
        has_long_header_lengths: true,
        has_ietf_invariant_header: true,
        supports_client_connection_ids: true,
        supports_message_frames: true,
    };

    /// Google QUIC Q050: IETF invariant headers with header protection, but
    /// pre-IETF frame encoding and the 12-byte Google crypto AEAD tag. The
    /// handshake travels in stream frames on the crypto stream.
    pub const Q050: Version = Version {
        wire: 0x5130_3530, // "Q050"
        handshake: HandshakeProtocol::QuicCrypto,
        has_header_protection: true,
        has_ietf_quic_frames: false,
        has_long_header_lengths: true,
        has_ietf_invariant_header: true,
        supports_client_connection_ids: false,
        supports_message_frames: true,
    };

    pub fn wire_value(&self) -> u32 {
        self.wire
    }

    pub fn handshake_protocol(&self) -> HandshakeProtocol {
        self.handshake
    }

    /// Long headers follow the RFC 8999 invariant layout.
    pub fn has_ietf_invariant_header(&self) -> bool {
        self.has_ietf_invariant_header
    }

    /// Packet number and first-byte bits are masked after encryption.
    pub fn has_header_protection(&self) -> bool {
        self.has_header_protection
    }

    /// Long headers carry an explicit payload Length field.
    pub fn has_long_header_lengths(&self) -> bool {
        self.has_long_header_lengths
    }

    /// Frames use the RFC 9000 encoding (varint types, varint lengths).
    pub fn has_ietf_quic_frames(&self) -> bool {
        self.has_ietf_quic_frames
    }

    /// Whether the client can be assigned its own connection ID.
    pub fn supports_client_connection_ids(&self) -> bool {
        self.supports_client_connection_ids
    }

    /// Whether DATAGRAM/message frames exist in this version.
    pub fn supports_message_frames(&self) -> bool {
        self.supports_message_frames
    }

    /// Whether CRYPTO frames exist (TLS handshakes only).
    pub fn uses_crypto_frames(&self) -> bool {
        matches!(self.handshake, HandshakeProtocol::Tls)
    }

    /// Long headers encode a 1-4 byte packet number chosen per packet.
    pub fn sends_variable_length_packet_number_in_long_header(&self) -> bool {
        // Both carried versions postdate the fixed 4-byte long-header era.
        true
    }

    /// AEAD authentication tag size appended by record protection.
    pub fn aead_tag_len(&self) -> usize {
        match self.handshake {
            HandshakeProtocol::QuicCrypto => 12,
            HandshakeProtocol::Tls => 16,
        }
    }

    /// Minimum plaintext bytes so the header-protection sample has enough
    /// ciphertext. The sample starts 4 bytes past a possibly 1-byte packet
    /// number and reads 16 bytes, so a 16-byte tag leaves 3 plaintext bytes
    /// required and a 12-byte tag leaves 7.
    pub fn min_plaintext_packet_size(&self) -> usize {
        if !self.has_header_protection {
            return 0;
        }
        match self.handshake {
            HandshakeProtocol::Tls => 3,
            HandshakeProtocol::QuicCrypto => 7,
        }
    }

    /// The dedicated crypto stream, for versions whose handshake is carried
    /// in stream frames.
    pub fn crypto_stream_id(&self) -> Option<StreamId> {
        match self.handshake {
            HandshakeProtocol::QuicCrypto => Some(StreamId::new(1)),
            HandshakeProtocol::Tls => None,
        }
    }

    /// Whether `id` is the crypto stream in this version.
    pub fn is_crypto_stream_id(&self, id: StreamId) -> bool {
        self.crypto_stream_id() == Some(id)
    }

    /// Long header type for an encryption level. FORWARD_SECURE uses the
    /// short header and has no long header type.
    pub fn long_header_type(&self, level: EncryptionLevel) -> Option<LongHeaderType> {
        match level {
            EncryptionLevel::Initial => Some(LongHeaderType::Initial),
            EncryptionLevel::Handshake => Some(LongHeaderType::Handshake),
            EncryptionLevel::ZeroRtt => Some(LongHeaderType::ZeroRtt),
            EncryptionLevel::ForwardSecure => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_plaintext_depends_on_tag_size() {
        assert_eq!(Version::RFC_V1.aead_tag_len(), 16);
        assert_eq!(Version::RFC_V1.min_plaintext_packet_size(), 3);
        assert_eq!(Version::Q050.aead_tag_len(), 12);
        assert_eq!(Version::Q050.min_plaintext_packet_size(), 7);
    }

    #[test]
    fn test_crypto_stream_only_for_google_crypto() {
        assert!(Version::RFC_V1.crypto_stream_id().is_none());
        assert_eq!(Version::Q050.crypto_stream_id(), Some(StreamId::new(1)));
        assert!(Version::Q050.is_crypto_stream_id(StreamId::new(1)));
        assert!(!Version::Q050.is_crypto_stream_id(StreamId::new(5)));
    }

    #[test]
    fn test_long_header_type_mapping() {
        let v = Version::RFC_V1;
        assert_eq!(
            v.long_header_type(EncryptionLevel::Initial),
            Some(LongHeaderType::Initial)
        );
        assert_eq!(
            v.long_header_type(EncryptionLevel::ZeroRtt),
            Some(LongHeaderType::ZeroRtt)
        );
        assert_eq!(v.long_header_type(EncryptionLevel::ForwardSecure), None);
    }
}
