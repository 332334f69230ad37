//! # Packet number encoding (RFC 9000 Section 12.3, Appendix A.2)
//!
//! Packet numbers are 62-bit integers encoded truncated to 1-4 bytes. The
//! send path picks the shortest length that the peer can unambiguously
//! reconstruct given what it has acknowledged.

#![forbid(unsafe_code)]

use bytes::BytesMut;

use crate::types::PacketNumber;

/// Packet Number Length (1-4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketNumberLength {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl PacketNumberLength {
    /// Convert from encoded length bits (0-3) of the first header byte.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PacketNumberLength::One),
            1 => Some(PacketNumberLength::Two),
            2 => Some(PacketNumberLength::Three),
            3 => Some(PacketNumberLength::Four),
            _ => None,
        }
    }

    /// Convert to encoded length bits.
    pub fn to_bits(self) -> u8 {
        (self as u8) - 1
    }

    /// Length in bytes.
    pub fn len(self) -> usize {
        self as usize
    }
}

/// Smallest length able to carry `delta` distinct in-flight packet numbers.
///
/// The window argument is pre-scaled by the caller (the assembler passes
/// `delta * 4` so reordering twice the flight size still decodes).
pub fn min_length_for_delta(delta: u64) -> PacketNumberLength {
    if delta < 1 << 8 {
        PacketNumberLength::One
    } else if delta < 1 << 16 {
        PacketNumberLength::Two
    } else if delta < 1 << 24 {
        PacketNumberLength::Three
    } else {
        PacketNumberLength::Four
    }
}

/// Write the low `length` bytes of `packet_number` big-endian.
pub fn write_truncated(packet_number: PacketNumber, length: PacketNumberLength, buf: &mut BytesMut) {
    let bytes = packet_number.to_be_bytes();
    buf.extend_from_slice(&bytes[8 - length.len()..]);
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_bits_round_trip() {
        for bits in 0..4 {
            let len = PacketNumberLength::from_bits(bits).unwrap();
            assert_eq!(len.to_bits(), bits);
            assert_eq!(len.len(), bits as usize + 1);
        }
        assert_eq!(PacketNumberLength::from_bits(4), None);
    }

    #[test]
    fn test_min_length_for_delta() {
        assert_eq!(min_length_for_delta(0), PacketNumberLength::One);
        assert_eq!(min_length_for_delta(255), PacketNumberLength::One);
        assert_eq!(min_length_for_delta(256), PacketNumberLength::Two);
        assert_eq!(min_length_for_delta(65_535), PacketNumberLength::Two);
        assert_eq!(min_length_for_delta(65_536), PacketNumberLength::Three);
        assert_eq!(min_length_for_delta(1 << 24), PacketNumberLength::Four);
    }

    #[test]
    fn test_write_truncated() {
        let mut buf = BytesMut::new();
        write_truncated(0x0102_0304, PacketNumberLength::Two, &mut buf);
        assert_eq!(&buf[..], &[0x03, 0x04]);

        buf.clear();
        write_truncated(0x0102_0304, PacketNumberLength::Four, &mut buf);
        assert_eq!(&buf[..], &[0x01, 0x02, 0x03, 0x04]);

        buf.clear();
        write_truncated(0xab, PacketNumberLength::One, &mut buf);
        assert_eq!(&buf[..], &[0xab]);
    }
}
