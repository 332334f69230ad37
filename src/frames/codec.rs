//! # Frame sizing and wire encoding (RFC 9000 Section 19, RFC 9221)
//!
//! The assembly core needs two things from the frame codec: exact and
//! conservative size arithmetic *before* a frame is committed, and the byte
//! encoding when the packet is built. Both live here so the fit tests and
//! the writer can never disagree. A parse-back path for decrypted payloads
//! supports the round-trip tests.

#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use tinyvec::TinyVec;

use crate::crypto::EncryptionLevel;
use crate::error::{CodecError, Result};
use crate::frames::types::*;
use crate::packet::number::PacketNumberLength;
use crate::types::{StreamId, StreamOffset, VarIntCodec, FRAME_TYPE_SIZE, PRE_IETF_STREAM_LENGTH_SIZE};
use crate::version::Version;

// ============================================================================
// Frame Type Constants (RFC 9000 Section 19)
// ============================================================================

pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u64 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_DATA_BLOCKED: u64 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u64 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u64 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE_QUIC: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u64 = 0x1e;
pub const FRAME_TYPE_DATAGRAM: u64 = 0x30; // 0x31 with length field
pub const FRAME_TYPE_ACK_FREQUENCY: u64 = 0xaf;

/// STREAM frame flag bits (RFC 9000 Section 19.8).
pub const STREAM_FRAME_BIT_FIN: u64 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u64 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u64 = 0x04;

/// DATAGRAM frame length-present bit (RFC 9221).
pub const DATAGRAM_FRAME_BIT_LEN: u64 = 0x01;

// Pre-IETF (Google) frame encoding constants.
const GOOGLE_FRAME_TYPE_PADDING: u8 = 0x00;
const GOOGLE_FRAME_TYPE_STOP_WAITING: u8 = 0x06;
const GOOGLE_FRAME_TYPE_PING: u8 = 0x07;
const GOOGLE_STREAM_FRAME_MARKER: u8 = 0x80;
const GOOGLE_STREAM_FIN_BIT: u8 = 0x40;
const GOOGLE_STREAM_LENGTH_BIT: u8 = 0x20;

/// Per-packet context the writer needs beyond the version: STOP_WAITING
/// encodes a delta against the packet number.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub version: Version,
    pub packet_number: u64,
    pub packet_number_length: PacketNumberLength,
}

// ============================================================================
// Size arithmetic
// ============================================================================

/// Bytes needed for a pre-IETF stream ID (1-4, by magnitude).
fn google_stream_id_size(id: StreamId) -> usize {
    let bits = 64 - id.value().leading_zeros() as usize;
    ((bits + 7) / 8).clamp(1, 4)
}

/// Bytes needed for a pre-IETF stream offset: 0 when the offset is zero,
/// otherwise at least 2.
fn google_stream_offset_size(offset: StreamOffset) -> usize {
    if offset == 0 {
        return 0;
    }
    let bits = 64 - offset.leading_zeros() as usize;
    ((bits + 7) / 8).max(2)
}

/// Minimum wire size of a stream frame excluding its payload.
///
/// When the frame is the last in the packet, the length field is omitted
/// and the payload runs to the end of the plaintext.
pub fn min_stream_frame_size(
    version: &Version,
    id: StreamId,
    offset: StreamOffset,
    last_frame_in_packet: bool,
    data_size: usize,
) -> usize {
    if version.has_ietf_quic_frames() {
        return FRAME_TYPE_SIZE
            + VarIntCodec::size(id.value())
            + if offset != 0 { VarIntCodec::size(offset) } else { 0 }
            + if last_frame_in_packet {
                0
            } else {
                VarIntCodec::size(data_size as u64)
            };
    }
    FRAME_TYPE_SIZE
        + google_stream_id_size(id)
        + google_stream_offset_size(offset)
        + if last_frame_in_packet {
            0
        } else {
            PRE_IETF_STREAM_LENGTH_SIZE
        }
}

/// Minimum wire size of a crypto frame excluding its payload. The length
/// field of a CRYPTO frame is always explicit; `write_length` bounds its
/// varint size for fit probes before the consumed byte count is known.
pub fn min_crypto_frame_size(write_length: usize, offset: StreamOffset) -> usize {
    FRAME_TYPE_SIZE + VarIntCodec::size(offset) + VarIntCodec::size(write_length as u64)
}

/// Full wire size of a message (DATAGRAM) frame.
pub fn message_frame_size(last_frame_in_packet: bool, length: usize) -> usize {
    FRAME_TYPE_SIZE
        + if last_frame_in_packet {
            0
        } else {
            VarIntCodec::size(length as u64)
        }
        + length
}

/// Extra bytes a committed frame grows by when another frame is appended
/// after it: its implicit length field becomes explicit.
pub fn expansion_on_new_frame_with_last_frame(version: &Version, last_frame: &QueuedFrame) -> usize {
    match last_frame {
        QueuedFrame::Message(frame) => VarIntCodec::size(frame.data.len() as u64),
        QueuedFrame::Stream(frame) => {
            if version.has_ietf_quic_frames() {
                VarIntCodec::size(frame.data.len() as u64)
            } else {
                PRE_IETF_STREAM_LENGTH_SIZE
            }
        }
        _ => 0,
    }
}

fn ack_frame_size(frame: &AckFrame) -> usize {
    let mut size = VarIntCodec::size(FRAME_TYPE_ACK)
        + VarIntCodec::size(frame.largest_acked)
        + VarIntCodec::size(frame.ack_delay)
        + VarIntCodec::size(frame.ranges.len() as u64)
        + VarIntCodec::size(frame.first_range);
    for range in &frame.ranges {
        size += VarIntCodec::size(range.gap) + VarIntCodec::size(range.length);
    }
    size
}

/// ACK frame size with the first `range_count` trailing ranges included.
fn ack_frame_size_with_ranges(frame: &AckFrame, range_count: usize) -> usize {
    let mut size = VarIntCodec::size(FRAME_TYPE_ACK)
        + VarIntCodec::size(frame.largest_acked)
        + VarIntCodec::size(frame.ack_delay)
        + VarIntCodec::size(range_count as u64)
        + VarIntCodec::size(frame.first_range);
    for range in frame.ranges.iter().take(range_count) {
        size += VarIntCodec::size(range.gap) + VarIntCodec::size(range.length);
    }
    size
}

/// Exact wire size of a queued frame, as `write_frame` will emit it.
pub fn frame_wire_size(
    version: &Version,
    frame: &QueuedFrame,
    last_frame_in_packet: bool,
    packet_number_length: PacketNumberLength,
) -> usize {
    match frame {
        QueuedFrame::Padding(padding) => padding.num_padding_bytes.max(0) as usize,
        QueuedFrame::Ping(_) | QueuedFrame::MtuDiscovery => FRAME_TYPE_SIZE,
        QueuedFrame::Ack(ack) => ack_frame_size(ack),
        QueuedFrame::StopWaiting(_) => FRAME_TYPE_SIZE + packet_number_length.len(),
        QueuedFrame::AckFrequency(f) => {
            VarIntCodec::size(FRAME_TYPE_ACK_FREQUENCY)
                + VarIntCodec::size(f.sequence_number)
                + VarIntCodec::size(f.packet_tolerance)
                + VarIntCodec::size(f.max_ack_delay_us)
                + VarIntCodec::size(f.reordering_threshold)
        }
        QueuedFrame::Stream(f) => {
            min_stream_frame_size(version, f.stream_id, f.offset, last_frame_in_packet, f.data.len())
                + f.data.len()
        }
        QueuedFrame::Crypto(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.offset)
                + VarIntCodec::size(f.data.len() as u64)
                + f.data.len()
        }
        QueuedFrame::Message(f) => message_frame_size(last_frame_in_packet, f.data.len()),
        QueuedFrame::PathChallenge(_) | QueuedFrame::PathResponse(_) => FRAME_TYPE_SIZE + 8,
        QueuedFrame::ResetStream(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.error_code)
                + VarIntCodec::size(f.final_size)
        }
        QueuedFrame::StopSending(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.error_code)
        }
        QueuedFrame::MaxData(f) => FRAME_TYPE_SIZE + VarIntCodec::size(f.maximum_data),
        QueuedFrame::MaxStreamData(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.maximum_stream_data)
        }
        QueuedFrame::DataBlocked(f) => FRAME_TYPE_SIZE + VarIntCodec::size(f.data_limit),
        QueuedFrame::StreamDataBlocked(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.stream_id.value())
                + VarIntCodec::size(f.stream_data_limit)
        }
        QueuedFrame::NewConnectionId(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.sequence_number)
                + VarIntCodec::size(f.retire_prior_to)
                + 1
                + f.connection_id.len()
                + 16
        }
        QueuedFrame::RetireConnectionId(f) => {
            FRAME_TYPE_SIZE + VarIntCodec::size(f.sequence_number)
        }
        QueuedFrame::ConnectionClose(f) => {
            FRAME_TYPE_SIZE
                + VarIntCodec::size(f.error_code)
                + if f.application_close {
                    0
                } else {
                    VarIntCodec::size(f.frame_type.unwrap_or(0))
                }
                + VarIntCodec::size(f.reason.len() as u64)
                + f.reason.len()
        }
        QueuedFrame::HandshakeDone(_) => FRAME_TYPE_SIZE,
    }
}

/// Serialized length of `frame` under the current assembly state, or 0 when
/// it does not fit in `free_bytes`.
///
/// A fill padding frame (`num_padding_bytes == -1`) consumes all free
/// bytes. An ACK that does not fit whole may be truncated down to
/// `free_bytes` as long as its fixed fields fit; the writer then drops
/// trailing ranges.
pub fn serialized_frame_length(
    version: &Version,
    frame: &QueuedFrame,
    free_bytes: usize,
    last_frame_in_packet: bool,
    packet_number_length: PacketNumberLength,
) -> usize {
    if let QueuedFrame::Padding(padding) = frame {
        if padding.num_padding_bytes < 0 {
            return free_bytes;
        }
        let wanted = padding.num_padding_bytes as usize;
        return if wanted <= free_bytes { wanted } else { 0 };
    }

    let full = frame_wire_size(version, frame, last_frame_in_packet, packet_number_length);
    if full <= free_bytes {
        return full;
    }
    if let QueuedFrame::Ack(ack) = frame {
        // Truncation drops trailing ranges; the fixed fields must still fit.
        let minimal = ack_frame_size_with_ranges(ack, 0);
        if minimal <= free_bytes {
            return free_bytes;
        }
    }
    0
}

// ============================================================================
// Wire encoding
// ============================================================================

fn put_varint(buf: &mut BytesMut, value: u64) -> Result<usize> {
    let mut tmp = [0u8; 8];
    let len = VarIntCodec::encode(value, &mut tmp).ok_or(CodecError::ValueOutOfRange)?;
    buf.extend_from_slice(&tmp[..len]);
    Ok(len)
}

/// Serialize one frame. `available` is the remaining plaintext budget; it
/// bounds fill padding and ACK truncation. Returns bytes written.
pub fn write_frame(
    ctx: &FrameContext,
    frame: &QueuedFrame,
    last_frame_in_packet: bool,
    available: usize,
    buf: &mut BytesMut,
) -> Result<usize> {
    let start = buf.len();
    let version = &ctx.version;

    match frame {
        QueuedFrame::Padding(padding) => {
            let n = if padding.num_padding_bytes < 0 {
                available
            } else {
                padding.num_padding_bytes as usize
            };
            if n > available {
                return Err(CodecError::BufferTooShort);
            }
            buf.put_bytes(0x00, n);
        }

        QueuedFrame::Ping(_) => {
            if version.has_ietf_quic_frames() {
                put_varint(buf, FRAME_TYPE_PING)?;
            } else {
                buf.put_u8(GOOGLE_FRAME_TYPE_PING);
            }
        }

        QueuedFrame::MtuDiscovery => {
            // MTU probes are PINGs on the wire; the variant only exists so
            // the in-flight bookkeeping can tell them apart.
            if version.has_ietf_quic_frames() {
                put_varint(buf, FRAME_TYPE_PING)?;
            } else {
                buf.put_u8(GOOGLE_FRAME_TYPE_PING);
            }
        }

        QueuedFrame::Ack(ack) => {
            if !version.has_ietf_quic_frames() {
                return Err(CodecError::UnsupportedFrame);
            }
            write_ack_frame(ack, available, buf)?;
        }

        QueuedFrame::StopWaiting(frame) => {
            if version.has_ietf_quic_frames() {
                return Err(CodecError::UnsupportedFrame);
            }
            buf.put_u8(GOOGLE_FRAME_TYPE_STOP_WAITING);
            let delta = ctx
                .packet_number
                .checked_sub(frame.least_unacked)
                .ok_or(CodecError::ValueOutOfRange)?;
            put_truncated(buf, delta, ctx.packet_number_length.len());
        }

        QueuedFrame::AckFrequency(f) => {
            put_varint(buf, FRAME_TYPE_ACK_FREQUENCY)?;
            put_varint(buf, f.sequence_number)?;
            put_varint(buf, f.packet_tolerance)?;
            put_varint(buf, f.max_ack_delay_us)?;
            put_varint(buf, f.reordering_threshold)?;
        }

        QueuedFrame::Stream(f) => {
            if version.has_ietf_quic_frames() {
                write_ietf_stream_frame(f, last_frame_in_packet, buf)?;
            } else {
                write_google_stream_frame(f, last_frame_in_packet, buf)?;
            }
        }

        QueuedFrame::Crypto(f) => {
            put_varint(buf, FRAME_TYPE_CRYPTO)?;
            put_varint(buf, f.offset)?;
            put_varint(buf, f.data.len() as u64)?;
            buf.extend_from_slice(&f.data);
        }

        QueuedFrame::Message(f) => {
            if last_frame_in_packet {
                put_varint(buf, FRAME_TYPE_DATAGRAM)?;
            } else {
                put_varint(buf, FRAME_TYPE_DATAGRAM | DATAGRAM_FRAME_BIT_LEN)?;
                put_varint(buf, f.data.len() as u64)?;
            }
            buf.extend_from_slice(&f.data);
        }

        QueuedFrame::PathChallenge(f) => {
            put_varint(buf, FRAME_TYPE_PATH_CHALLENGE)?;
            buf.extend_from_slice(&f.payload);
        }

        QueuedFrame::PathResponse(f) => {
            put_varint(buf, FRAME_TYPE_PATH_RESPONSE)?;
            buf.extend_from_slice(&f.payload);
        }

        QueuedFrame::ResetStream(f) => {
            put_varint(buf, FRAME_TYPE_RESET_STREAM)?;
            put_varint(buf, f.stream_id.value())?;
            put_varint(buf, f.error_code)?;
            put_varint(buf, f.final_size)?;
        }

        QueuedFrame::StopSending(f) => {
            put_varint(buf, FRAME_TYPE_STOP_SENDING)?;
            put_varint(buf, f.stream_id.value())?;
            put_varint(buf, f.error_code)?;
        }

        QueuedFrame::MaxData(f) => {
            put_varint(buf, FRAME_TYPE_MAX_DATA)?;
            put_varint(buf, f.maximum_data)?;
        }

        QueuedFrame::MaxStreamData(f) => {
            put_varint(buf, FRAME_TYPE_MAX_STREAM_DATA)?;
            put_varint(buf, f.stream_id.value())?;
            put_varint(buf, f.maximum_stream_data)?;
        }

        QueuedFrame::DataBlocked(f) => {
            put_varint(buf, FRAME_TYPE_DATA_BLOCKED)?;
            put_varint(buf, f.data_limit)?;
        }

        QueuedFrame::StreamDataBlocked(f) => {
            put_varint(buf, FRAME_TYPE_STREAM_DATA_BLOCKED)?;
            put_varint(buf, f.stream_id.value())?;
            put_varint(buf, f.stream_data_limit)?;
        }

        QueuedFrame::NewConnectionId(f) => {
            put_varint(buf, FRAME_TYPE_NEW_CONNECTION_ID)?;
            put_varint(buf, f.sequence_number)?;
            put_varint(buf, f.retire_prior_to)?;
            buf.put_u8(f.connection_id.len() as u8);
            buf.extend_from_slice(f.connection_id.as_bytes());
            buf.extend_from_slice(&f.stateless_reset_token);
        }

        QueuedFrame::RetireConnectionId(f) => {
            put_varint(buf, FRAME_TYPE_RETIRE_CONNECTION_ID)?;
            put_varint(buf, f.sequence_number)?;
        }

        QueuedFrame::ConnectionClose(f) => {
            if f.application_close {
                put_varint(buf, FRAME_TYPE_CONNECTION_CLOSE_APP)?;
                put_varint(buf, f.error_code)?;
            } else {
                put_varint(buf, FRAME_TYPE_CONNECTION_CLOSE_QUIC)?;
                put_varint(buf, f.error_code)?;
                put_varint(buf, f.frame_type.unwrap_or(0))?;
            }
            put_varint(buf, f.reason.len() as u64)?;
            buf.extend_from_slice(&f.reason);
        }

        QueuedFrame::HandshakeDone(_) => {
            put_varint(buf, FRAME_TYPE_HANDSHAKE_DONE)?;
        }
    }

    let written = buf.len() - start;
    if written > available {
        return Err(CodecError::BufferTooShort);
    }
    Ok(written)
}

fn put_truncated(buf: &mut BytesMut, value: u64, len: usize) {
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[8 - len..]);
}

fn write_ietf_stream_frame(
    frame: &StreamFrame,
    last_frame_in_packet: bool,
    buf: &mut BytesMut,
) -> Result<()> {
    let mut frame_type = FRAME_TYPE_STREAM_BASE;
    if frame.fin {
        frame_type |= STREAM_FRAME_BIT_FIN;
    }
    if frame.offset != 0 {
        frame_type |= STREAM_FRAME_BIT_OFF;
    }
    if !last_frame_in_packet {
        frame_type |= STREAM_FRAME_BIT_LEN;
    }
    put_varint(buf, frame_type)?;
    put_varint(buf, frame.stream_id.value())?;
    if frame.offset != 0 {
        put_varint(buf, frame.offset)?;
    }
    if !last_frame_in_packet {
        put_varint(buf, frame.data.len() as u64)?;
    }
    buf.extend_from_slice(&frame.data);
    Ok(())
}

fn write_google_stream_frame(
    frame: &StreamFrame,
    last_frame_in_packet: bool,
    buf: &mut BytesMut,
) -> Result<()> {
    let id_size = google_stream_id_size(frame.stream_id);
    let offset_size = google_stream_offset_size(frame.offset);
    if !last_frame_in_packet && frame.data.len() > u16::MAX as usize {
        return Err(CodecError::ValueOutOfRange);
    }

    let mut first = GOOGLE_STREAM_FRAME_MARKER;
    if frame.fin {
        first |= GOOGLE_STREAM_FIN_BIT;
    }
    if !last_frame_in_packet {
        first |= GOOGLE_STREAM_LENGTH_BIT;
    }
    if offset_size > 0 {
        first |= ((offset_size - 1) as u8) << 2;
    }
    first |= (id_size - 1) as u8;
    buf.put_u8(first);

    let id_bytes = frame.stream_id.value().to_be_bytes();
    buf.extend_from_slice(&id_bytes[8 - id_size..]);
    if offset_size > 0 {
        let offset_bytes = frame.offset.to_be_bytes();
        buf.extend_from_slice(&offset_bytes[8 - offset_size..]);
    }
    if !last_frame_in_packet {
        buf.put_u16(frame.data.len() as u16);
    }
    buf.extend_from_slice(&frame.data);
    Ok(())
}

/// Write an ACK frame, truncating trailing ranges when the full frame
/// exceeds `available`.
fn write_ack_frame(frame: &AckFrame, available: usize, buf: &mut BytesMut) -> Result<()> {
    let mut range_count = frame.ranges.len();
    while range_count > 0 && ack_frame_size_with_ranges(frame, range_count) > available {
        range_count -= 1;
    }
    if ack_frame_size_with_ranges(frame, range_count) > available {
        return Err(CodecError::BufferTooShort);
    }

    put_varint(buf, FRAME_TYPE_ACK)?;
    put_varint(buf, frame.largest_acked)?;
    put_varint(buf, frame.ack_delay)?;
    put_varint(buf, range_count as u64)?;
    put_varint(buf, frame.first_range)?;
    for range in frame.ranges.iter().take(range_count) {
        put_varint(buf, range.gap)?;
        put_varint(buf, range.length)?;
    }
    Ok(())
}

// ============================================================================
// Parse-back (round-trip verification of emitted payloads)
// ============================================================================

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn varint(&mut self) -> Result<u64> {
        let (value, consumed) =
            VarIntCodec::decode(&self.buf[self.pos..]).ok_or(CodecError::FrameEncoding)?;
        self.pos += consumed;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(CodecError::FrameEncoding);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn uint(&mut self, len: usize) -> Result<u64> {
        let mut value = 0u64;
        for &b in self.bytes(len)? {
            value = (value << 8) | b as u64;
        }
        Ok(value)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Parse a decrypted packet payload back into frames. Consecutive padding
/// bytes collapse into one `Padding` frame, mirroring how padding is
/// written. Control-frame IDs are local bookkeeping and come back as 0.
pub fn parse_frames(version: &Version, payload: &[u8]) -> Result<Vec<QueuedFrame>> {
    let mut reader = FrameReader { buf: payload, pos: 0 };
    let mut frames = Vec::new();

    while reader.remaining() > 0 {
        let frame = if version.has_ietf_quic_frames() {
            parse_ietf_frame(&mut reader)?
        } else {
            parse_google_frame(&mut reader)?
        };
        frames.push(frame);
    }
    Ok(frames)
}

fn parse_padding_run(reader: &mut FrameReader<'_>) -> QueuedFrame {
    let mut n = 1i32;
    while reader.remaining() > 0 && reader.buf[reader.pos] == 0x00 {
        reader.pos += 1;
        n += 1;
    }
    QueuedFrame::Padding(PaddingFrame { num_padding_bytes: n })
}

fn parse_ietf_frame(reader: &mut FrameReader<'_>) -> Result<QueuedFrame> {
    let frame_type = reader.varint()?;

    if frame_type == FRAME_TYPE_PADDING {
        return Ok(parse_padding_run(reader));
    }
    if frame_type & !0x07 == FRAME_TYPE_STREAM_BASE {
        let stream_id = StreamId::new(reader.varint()?);
        let offset = if frame_type & STREAM_FRAME_BIT_OFF != 0 {
            reader.varint()?
        } else {
            0
        };
        let data = if frame_type & STREAM_FRAME_BIT_LEN != 0 {
            let len = reader.varint()? as usize;
            Bytes::copy_from_slice(reader.bytes(len)?)
        } else {
            Bytes::copy_from_slice(reader.bytes(reader.remaining())?)
        };
        return Ok(QueuedFrame::Stream(StreamFrame {
            stream_id,
            offset,
            data,
            fin: frame_type & STREAM_FRAME_BIT_FIN != 0,
        }));
    }

    match frame_type {
        FRAME_TYPE_PING => Ok(QueuedFrame::Ping(PingFrame { control_frame_id: 0 })),
        FRAME_TYPE_ACK => {
            let largest_acked = reader.varint()?;
            let ack_delay = reader.varint()?;
            let range_count = reader.varint()? as usize;
            let first_range = reader.varint()?;
            let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
            for _ in 0..range_count {
                let gap = reader.varint()?;
                let length = reader.varint()?;
                ranges.push(AckRange { gap, length });
            }
            Ok(QueuedFrame::Ack(AckFrame {
                largest_acked,
                ack_delay,
                first_range,
                ranges,
            }))
        }
        FRAME_TYPE_CRYPTO => {
            let offset = reader.varint()?;
            let len = reader.varint()? as usize;
            let data = Bytes::copy_from_slice(reader.bytes(len)?);
            // Parse-side frames have no key context; Initial stands in.
            Ok(QueuedFrame::Crypto(CryptoFrame {
                level: EncryptionLevel::Initial,
                offset,
                data,
            }))
        }
        FRAME_TYPE_DATAGRAM => {
            let data = Bytes::copy_from_slice(reader.bytes(reader.remaining())?);
            Ok(QueuedFrame::Message(MessageFrame { message_id: 0, data }))
        }
        t if t == FRAME_TYPE_DATAGRAM | DATAGRAM_FRAME_BIT_LEN => {
            let len = reader.varint()? as usize;
            let data = Bytes::copy_from_slice(reader.bytes(len)?);
            Ok(QueuedFrame::Message(MessageFrame { message_id: 0, data }))
        }
        FRAME_TYPE_RESET_STREAM => Ok(QueuedFrame::ResetStream(ResetStreamFrame {
            control_frame_id: 0,
            stream_id: StreamId::new(reader.varint()?),
            error_code: reader.varint()?,
            final_size: reader.varint()?,
        })),
        FRAME_TYPE_STOP_SENDING => Ok(QueuedFrame::StopSending(StopSendingFrame {
            control_frame_id: 0,
            stream_id: StreamId::new(reader.varint()?),
            error_code: reader.varint()?,
        })),
        FRAME_TYPE_MAX_DATA => Ok(QueuedFrame::MaxData(MaxDataFrame {
            control_frame_id: 0,
            maximum_data: reader.varint()?,
        })),
        FRAME_TYPE_MAX_STREAM_DATA => Ok(QueuedFrame::MaxStreamData(MaxStreamDataFrame {
            control_frame_id: 0,
            stream_id: StreamId::new(reader.varint()?),
            maximum_stream_data: reader.varint()?,
        })),
        FRAME_TYPE_DATA_BLOCKED => Ok(QueuedFrame::DataBlocked(DataBlockedFrame {
            control_frame_id: 0,
            data_limit: reader.varint()?,
        })),
        FRAME_TYPE_STREAM_DATA_BLOCKED => {
            Ok(QueuedFrame::StreamDataBlocked(StreamDataBlockedFrame {
                control_frame_id: 0,
                stream_id: StreamId::new(reader.varint()?),
                stream_data_limit: reader.varint()?,
            }))
        }
        FRAME_TYPE_NEW_CONNECTION_ID => {
            let sequence_number = reader.varint()?;
            let retire_prior_to = reader.varint()?;
            let cid_len = reader.u8()? as usize;
            let connection_id = crate::types::ConnectionId::from_slice(reader.bytes(cid_len)?)
                .ok_or(CodecError::FrameEncoding)?;
            let mut stateless_reset_token = [0u8; 16];
            stateless_reset_token.copy_from_slice(reader.bytes(16)?);
            Ok(QueuedFrame::NewConnectionId(NewConnectionIdFrame {
                control_frame_id: 0,
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            }))
        }
        FRAME_TYPE_RETIRE_CONNECTION_ID => {
            Ok(QueuedFrame::RetireConnectionId(RetireConnectionIdFrame {
                control_frame_id: 0,
                sequence_number: reader.varint()?,
            }))
        }
        FRAME_TYPE_PATH_CHALLENGE => {
            let mut payload = [0u8; 8];
            payload.copy_from_slice(reader.bytes(8)?);
            Ok(QueuedFrame::PathChallenge(PathChallengeFrame {
                control_frame_id: 0,
                payload,
            }))
        }
        FRAME_TYPE_PATH_RESPONSE => {
            let mut payload = [0u8; 8];
            payload.copy_from_slice(reader.bytes(8)?);
            Ok(QueuedFrame::PathResponse(PathResponseFrame {
                control_frame_id: 0,
                payload,
            }))
        }
        FRAME_TYPE_CONNECTION_CLOSE_QUIC | FRAME_TYPE_CONNECTION_CLOSE_APP => {
            let application_close = frame_type == FRAME_TYPE_CONNECTION_CLOSE_APP;
            let error_code = reader.varint()?;
            let trigger_frame_type = if application_close {
                None
            } else {
                Some(reader.varint()?)
            };
            let reason_len = reader.varint()? as usize;
            let reason = Bytes::copy_from_slice(reader.bytes(reason_len)?);
            Ok(QueuedFrame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type: trigger_frame_type,
                reason,
                application_close,
            }))
        }
        FRAME_TYPE_HANDSHAKE_DONE => {
            Ok(QueuedFrame::HandshakeDone(HandshakeDoneFrame { control_frame_id: 0 }))
        }
        FRAME_TYPE_ACK_FREQUENCY => Ok(QueuedFrame::AckFrequency(AckFrequencyFrame {
            control_frame_id: 0,
            sequence_number: reader.varint()?,
            packet_tolerance: reader.varint()?,
            max_ack_delay_us: reader.varint()?,
            reordering_threshold: reader.varint()?,
        })),
        _ => Err(CodecError::FrameEncoding),
    }
}

fn parse_google_frame(reader: &mut FrameReader<'_>) -> Result<QueuedFrame> {
    let first = reader.u8()?;

    if first & GOOGLE_STREAM_FRAME_MARKER != 0 {
        let fin = first & GOOGLE_STREAM_FIN_BIT != 0;
        let has_length = first & GOOGLE_STREAM_LENGTH_BIT != 0;
        let offset_bits = (first >> 2) & 0x07;
        let offset_size = if offset_bits == 0 { 0 } else { offset_bits as usize + 1 };
        let id_size = (first & 0x03) as usize + 1;

        let stream_id = StreamId::new(reader.uint(id_size)?);
        let offset = reader.uint(offset_size)?;
        let data = if has_length {
            let len = reader.uint(2)? as usize;
            Bytes::copy_from_slice(reader.bytes(len)?)
        } else {
            Bytes::copy_from_slice(reader.bytes(reader.remaining())?)
        };
        return Ok(QueuedFrame::Stream(StreamFrame {
            stream_id,
            offset,
            data,
            fin,
        }));
    }

    match first {
        GOOGLE_FRAME_TYPE_PADDING => Ok(parse_padding_run(reader)),
        GOOGLE_FRAME_TYPE_PING => Ok(QueuedFrame::Ping(PingFrame { control_frame_id: 0 })),
        _ => Err(CodecError::FrameEncoding),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const V1: Version = Version::RFC_V1;
    const Q050: Version = Version::Q050;

    fn ctx(version: Version) -> FrameContext {
        FrameContext {
            version,
            packet_number: 10,
            packet_number_length: PacketNumberLength::One,
        }
    }

    fn stream(id: u64, offset: u64, data: &'static [u8], fin: bool) -> QueuedFrame {
        QueuedFrame::Stream(StreamFrame {
            stream_id: StreamId::new(id),
            offset,
            data: Bytes::from_static(data),
            fin,
        })
    }

    // ==========================================================================
    // Sizing
    // ==========================================================================

    #[test]
    fn test_min_stream_frame_size_ietf() {
        // type + id, offset omitted at 0, length omitted when last
        assert_eq!(min_stream_frame_size(&V1, StreamId::new(4), 0, true, 100), 2);
        // non-last adds the varint length of the payload
        assert_eq!(min_stream_frame_size(&V1, StreamId::new(4), 0, false, 100), 4);
        // non-zero offset adds its varint
        assert_eq!(min_stream_frame_size(&V1, StreamId::new(4), 64, true, 100), 4);
    }

    #[test]
    fn test_min_stream_frame_size_pre_ietf() {
        // type + 1-byte id, no offset, length omitted when last
        assert_eq!(min_stream_frame_size(&Q050, StreamId::new(1), 0, true, 100), 2);
        // explicit length is always 2 bytes pre-IETF
        assert_eq!(min_stream_frame_size(&Q050, StreamId::new(1), 0, false, 100), 4);
        // offsets are at least 2 bytes pre-IETF
        assert_eq!(min_stream_frame_size(&Q050, StreamId::new(1), 10, true, 100), 4);
    }

    #[test]
    fn test_expansion_on_new_frame() {
        let short_stream = stream(4, 0, b"hello", false);
        assert_eq!(expansion_on_new_frame_with_last_frame(&V1, &short_stream), 1);
        assert_eq!(expansion_on_new_frame_with_last_frame(&Q050, &short_stream), 2);

        let message = QueuedFrame::Message(MessageFrame {
            message_id: 1,
            data: Bytes::from_static(&[0u8; 70]),
        });
        assert_eq!(expansion_on_new_frame_with_last_frame(&V1, &message), 2);

        let ping = QueuedFrame::Ping(PingFrame { control_frame_id: 1 });
        assert_eq!(expansion_on_new_frame_with_last_frame(&V1, &ping), 0);
    }

    #[test]
    fn test_message_frame_size() {
        assert_eq!(message_frame_size(true, 10), 11);
        assert_eq!(message_frame_size(false, 10), 12);
        assert_eq!(message_frame_size(false, 100), 103);
    }

    // ==========================================================================
    // Sizing and writer agreement
    // ==========================================================================

    #[test]
    fn test_sizes_match_writer_output() {
        let frames = vec![
            stream(4, 0, b"hello", false),
            stream(4, 1000, b"world!", true),
            QueuedFrame::Crypto(CryptoFrame {
                level: EncryptionLevel::Initial,
                offset: 0,
                data: Bytes::from_static(&[7u8; 50]),
            }),
            QueuedFrame::Ping(PingFrame { control_frame_id: 3 }),
            QueuedFrame::Ack(AckFrame {
                largest_acked: 900,
                ack_delay: 20,
                first_range: 3,
                ranges: tinyvec::tiny_vec![AckRange { gap: 2, length: 5 }],
            }),
            QueuedFrame::ResetStream(ResetStreamFrame {
                control_frame_id: 1,
                stream_id: StreamId::new(8),
                error_code: 3,
                final_size: 77,
            }),
            QueuedFrame::MaxData(MaxDataFrame { control_frame_id: 2, maximum_data: 1 << 30 }),
            QueuedFrame::NewConnectionId(NewConnectionIdFrame {
                control_frame_id: 4,
                sequence_number: 2,
                retire_prior_to: 1,
                connection_id: crate::types::ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap(),
                stateless_reset_token: [9u8; 16],
            }),
            QueuedFrame::ConnectionClose(ConnectionCloseFrame {
                error_code: 0x0a,
                frame_type: Some(0x06),
                reason: Bytes::from_static(b"handshake failed"),
                application_close: false,
            }),
            QueuedFrame::Message(MessageFrame {
                message_id: 1,
                data: Bytes::from_static(b"datagram"),
            }),
            QueuedFrame::PathChallenge(PathChallengeFrame {
                control_frame_id: 0,
                payload: [1, 2, 3, 4, 5, 6, 7, 8],
            }),
            QueuedFrame::HandshakeDone(HandshakeDoneFrame { control_frame_id: 6 }),
        ];

        for frame in &frames {
            for last in [false, true] {
                let expected =
                    frame_wire_size(&V1, frame, last, PacketNumberLength::One);
                let mut buf = BytesMut::new();
                let written = write_frame(&ctx(V1), frame, last, 4096, &mut buf).unwrap();
                assert_eq!(written, expected, "size mismatch for {frame:?} last={last}");
            }
        }
    }

    #[test]
    fn test_google_stream_size_matches_writer() {
        let frames = vec![
            stream(1, 0, b"chlo", true),
            stream(1, 0, b"chlo", false),
            stream(5, 300, b"data", false),
            stream(700, 1 << 20, b"x", true),
        ];
        for frame in &frames {
            for last in [false, true] {
                let expected = frame_wire_size(&Q050, frame, last, PacketNumberLength::One);
                let mut buf = BytesMut::new();
                let written = write_frame(&ctx(Q050), frame, last, 4096, &mut buf).unwrap();
                assert_eq!(written, expected, "size mismatch for {frame:?} last={last}");
            }
        }
    }

    // ==========================================================================
    // Round trips
    // ==========================================================================

    #[test]
    fn test_stream_frame_round_trip() {
        let frame = stream(4, 1234, b"payload bytes", true);
        let mut buf = BytesMut::new();
        write_frame(&ctx(V1), &frame, true, 4096, &mut buf).unwrap();
        let parsed = parse_frames(&V1, &buf).unwrap();
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn test_google_stream_frame_round_trip() {
        let frame = stream(1, 0, b"client hello bytes", false);
        let mut buf = BytesMut::new();
        write_frame(&ctx(Q050), &frame, false, 4096, &mut buf).unwrap();
        let parsed = parse_frames(&Q050, &buf).unwrap();
        assert_eq!(parsed, vec![frame]);
    }

    #[test]
    fn test_mixed_payload_round_trip() {
        let ack = QueuedFrame::Ack(AckFrame {
            largest_acked: 41,
            ack_delay: 5,
            first_range: 1,
            ranges: TinyVec::new(),
        });
        let data = stream(8, 0, b"abc", false);
        let close = QueuedFrame::ConnectionClose(ConnectionCloseFrame {
            error_code: 2,
            frame_type: Some(0),
            reason: Bytes::from_static(b"bye"),
            application_close: false,
        });

        let mut buf = BytesMut::new();
        write_frame(&ctx(V1), &ack, false, 4096, &mut buf).unwrap();
        write_frame(&ctx(V1), &data, false, 4096, &mut buf).unwrap();
        write_frame(&ctx(V1), &close, true, 4096, &mut buf).unwrap();

        let parsed = parse_frames(&V1, &buf).unwrap();
        assert_eq!(parsed, vec![ack, data, close]);
    }

    #[test]
    fn test_ack_truncates_ranges_to_fit() {
        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
        for _ in 0..8 {
            ranges.push(AckRange { gap: 1, length: 1 });
        }
        let ack = AckFrame {
            largest_acked: 1000,
            ack_delay: 0,
            first_range: 0,
            ranges,
        };
        let full = ack_frame_size(&ack);
        let available = full - 4; // force at least two ranges dropped

        let mut buf = BytesMut::new();
        write_ack_frame(&ack, available, &mut buf).unwrap();
        assert!(buf.len() <= available);

        let parsed = parse_frames(&V1, &buf).unwrap();
        match &parsed[0] {
            QueuedFrame::Ack(parsed_ack) => {
                assert_eq!(parsed_ack.largest_acked, 1000);
                assert!(parsed_ack.ranges.len() < 8);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_serialized_frame_length_fill_padding() {
        let fill = QueuedFrame::Padding(PaddingFrame { num_padding_bytes: -1 });
        assert_eq!(
            serialized_frame_length(&V1, &fill, 37, true, PacketNumberLength::One),
            37
        );
        let fixed = QueuedFrame::Padding(PaddingFrame { num_padding_bytes: 5 });
        assert_eq!(
            serialized_frame_length(&V1, &fixed, 37, true, PacketNumberLength::One),
            5
        );
        assert_eq!(
            serialized_frame_length(&V1, &fixed, 3, true, PacketNumberLength::One),
            0
        );
    }

    #[test]
    fn test_serialized_frame_length_rejects_oversize() {
        let frame = stream(4, 0, b"0123456789", false);
        assert_eq!(
            serialized_frame_length(&V1, &frame, 4, true, PacketNumberLength::One),
            0
        );
    }

    #[test]
    fn test_padding_run_parses_as_single_frame() {
        let mut buf = BytesMut::new();
        buf.put_bytes(0x00, 12);
        let parsed = parse_frames(&V1, &buf).unwrap();
        assert_eq!(
            parsed,
            vec![QueuedFrame::Padding(PaddingFrame { num_padding_bytes: 12 })]
        );
    }
}
