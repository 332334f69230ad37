//! # Send-side packet headers (RFC 9000 Section 17)
//!
//! Builds and writes long and short headers for outgoing packets, and
//! provides the header size arithmetic every fit test depends on. The
//! payload Length field of IETF long headers is written as a placeholder
//! and patched once the plaintext length is known.

#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};
use crate::packet::number::{write_truncated, PacketNumberLength};
use crate::types::{
    ConnectionId, DiversificationNonce, PacketNumber, VarIntCodec, VERSION_SIZE,
};
use crate::version::{LongHeaderType, Version};

/// Wire size of the diversification nonce in pre-TLS 0-RTT server packets.
pub const DIVERSIFICATION_NONCE_SIZE: usize = 32;

/// A fully determined outgoing packet header.
///
/// `long_header_type == None` selects the short (1-RTT) header form.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub version: Version,
    pub long_header_type: Option<LongHeaderType>,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub nonce: Option<DiversificationNonce>,
    pub packet_number: PacketNumber,
    pub packet_number_length: PacketNumberLength,
    /// Varint size of the retry token length field; 0 when absent.
    pub retry_token_length_length: usize,
    pub retry_token: Bytes,
    /// Size of the payload Length field (0 or 2).
    pub length_length: usize,
}

/// Header size for a given shape, before anything is written.
///
/// This is pure arithmetic: every fit test runs it against hypothetical
/// header shapes, so it must agree byte-for-byte with [`write_header`].
#[allow(clippy::too_many_arguments)]
pub fn packet_header_size(
    _version: &Version,
    destination_connection_id_length: usize,
    source_connection_id_length: usize,
    include_version: bool,
    include_nonce: bool,
    packet_number_length: PacketNumberLength,
    retry_token_length_length: usize,
    retry_token_length: usize,
    length_length: usize,
) -> usize {
    if !include_version {
        // Short header: flags, DCID, packet number.
        return 1 + destination_connection_id_length + packet_number_length.len();
    }
    1 + VERSION_SIZE
        + 1
        + destination_connection_id_length
        + 1
        + source_connection_id_length
        + if include_nonce { DIVERSIFICATION_NONCE_SIZE } else { 0 }
        + retry_token_length_length
        + retry_token_length
        + length_length
        + packet_number_length.len()
}

impl PacketHeader {
    /// Size this header will occupy on the wire.
    pub fn size(&self) -> usize {
        packet_header_size(
            &self.version,
            self.dcid.len(),
            self.scid.len(),
            self.long_header_type.is_some(),
            self.nonce.is_some(),
            self.packet_number_length,
            self.retry_token_length_length,
            self.retry_token.len(),
            self.length_length,
        )
    }
}

/// Write `header` into `buf`. Returns `(header_len, length_field_offset)`;
/// the offset is 0 when the header has no Length field, otherwise it marks
/// where [`patch_long_header_length`] must write once the payload size is
/// known.
pub fn write_header(header: &PacketHeader, buf: &mut BytesMut) -> Result<(usize, usize)> {
    let start = buf.len();
    let pn_len = header.packet_number_length;

    match header.long_header_type {
        Some(long_type) => {
            if long_type == LongHeaderType::Retry {
                // Retry packets are built by the dispatcher, not this path.
                return Err(CodecError::UnsupportedFrame);
            }
            let mut first = 0x80 | 0x40;
            first |= long_type.type_bits() << 4;
            first |= pn_len.to_bits();
            buf.put_u8(first);

            buf.put_u32(header.version.wire_value());

            buf.put_u8(header.dcid.len() as u8);
            buf.extend_from_slice(header.dcid.as_bytes());
            buf.put_u8(header.scid.len() as u8);
            buf.extend_from_slice(header.scid.as_bytes());

            if let Some(nonce) = &header.nonce {
                buf.extend_from_slice(nonce);
            }

            if long_type == LongHeaderType::Initial && header.retry_token_length_length > 0 {
                let mut tmp = [0u8; 8];
                let written = VarIntCodec::encode(header.retry_token.len() as u64, &mut tmp)
                    .ok_or(CodecError::ValueOutOfRange)?;
                if written != header.retry_token_length_length {
                    return Err(CodecError::ValueOutOfRange);
                }
                buf.extend_from_slice(&tmp[..written]);
                buf.extend_from_slice(&header.retry_token);
            }

            let mut length_field_offset = 0;
            if header.length_length > 0 {
                length_field_offset = buf.len();
                // Placeholder, patched after the payload is built.
                buf.put_u16(0x4000);
            }

            write_truncated(header.packet_number, pn_len, buf);
            Ok((buf.len() - start, length_field_offset))
        }
        None => {
            let mut first = 0x40;
            first |= pn_len.to_bits();
            buf.put_u8(first);
            buf.extend_from_slice(header.dcid.as_bytes());
            write_truncated(header.packet_number, pn_len, buf);
            Ok((buf.len() - start, 0))
        }
    }
}

/// Patch the long-header Length field: packet number length plus payload
/// plus AEAD tag, encoded as the 2-byte varint the placeholder reserved.
pub fn patch_long_header_length(
    header: &PacketHeader,
    buf: &mut BytesMut,
    length_field_offset: usize,
    tag_len: usize,
) -> Result<()> {
    if header.length_length == 0 {
        return Ok(());
    }
    debug_assert_eq!(header.length_length, 2);

    let pn_start = length_field_offset + header.length_length;
    let value = (buf.len() - pn_start + tag_len) as u64;
    if value >= 0x4000 {
        return Err(CodecError::ValueOutOfRange);
    }
    let encoded = (value as u16) | 0x4000;
    buf[length_field_offset..length_field_offset + 2].copy_from_slice(&encoded.to_be_bytes());
    Ok(())
}

// ============================================================================
// Unit Tests
// ============================================================================
