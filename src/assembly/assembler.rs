//! # Packet assembler
//!
//! The send-path core: accepts stream data, crypto data, control frames,
//! ACKs and datagrams from the session and packs them into encrypted
//! wire-format packets. Size budgets are computed before each frame is
//! committed, adjacent stream frames coalesce, levels never mix within a
//! packet, and a failed serialization never leaves a half-built packet
//! visible to the session.
//!
//! Packets are serialized just in time: a write operation fills the open
//! packet and flushes when it runs out of room, when the encryption level
//! or peer address changes, or when the surrounding [`ScopedPacketFlusher`]
//! is released.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::assembly::coalescer::CoalescedPacket;
use crate::assembly::delegate::{AssemblerDelegate, StreamDataProducer};
use crate::assembly::serialized::{SerializedPacket, SerializedPacketFate, TransmissionType};
use crate::config::AssemblyConfig;
use crate::crypto::{EncryptionLevel, PacketSealer, RandomSource};
use crate::error::{CodecError, UnrecoverableError};
use crate::frames::codec::{self, FrameContext};
use crate::frames::types::{
    CryptoFrame, PaddingFrame, PathChallengeFrame, PathResponseFrame, StreamFrame,
};
use crate::frames::QueuedFrame;
use crate::packet::header::{self, PacketHeader};
use crate::packet::number::{self, PacketNumberLength};
use crate::types::{
    ConnectionId, DiversificationNonce, PacketNumber, Side, StreamId, StreamOffset, VarIntCodec,
    DEFAULT_MAX_PACKET_SIZE, FRAME_TYPE_SIZE, INVALID_CONTROL_FRAME_ID,
    MAX_OUTGOING_PACKET_SIZE, MAX_RANDOM_PADDING_BYTES,
};
use crate::version::Version;

/// Largest datagram frame payload accepted when the version does not
/// negotiate `max_datagram_frame_size` through transport parameters.
const MAX_ACCEPTED_DATAGRAM_FRAME_SIZE: u64 = 1224;

/// Result of a stream write: bytes accepted and whether the FIN went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumedData {
    pub bytes_consumed: usize,
    pub fin_consumed: bool,
}

/// FIN disposition of a stream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSendingState {
    /// More data will follow on this stream.
    NoFin,
    /// This write ends the stream.
    Fin,
    /// Ends the stream and appends random padding to blur its length.
    FinAndPadding,
}

/// Outcome of adding a message (DATAGRAM) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Success,
    /// Payload exceeds the current largest message payload.
    TooLarge,
    InternalError,
}

/// Mutable state of the packet under construction.
#[derive(Debug)]
struct InProgressPacket {
    /// Most recently assigned packet number; 0 before the first packet.
    packet_number: PacketNumber,
    packet_number_length: PacketNumberLength,
    encryption_level: EncryptionLevel,
    has_ack: bool,
    has_stop_waiting: bool,
    has_crypto_handshake: bool,
    has_ack_frequency: bool,
    has_message: bool,
    transmission_type: TransmissionType,
    largest_acked: Option<PacketNumber>,
    retransmittable_frames: Vec<QueuedFrame>,
    nonretransmittable_frames: Vec<QueuedFrame>,
    fate: SerializedPacketFate,
    peer_address: Option<SocketAddr>,
}

impl InProgressPacket {
    fn new() -> Self {
        Self {
            packet_number: 0,
            packet_number_length: PacketNumberLength::One,
            encryption_level: EncryptionLevel::Initial,
            has_ack: false,
            has_stop_waiting: false,
            has_crypto_handshake: false,
            has_ack_frequency: false,
            has_message: false,
            transmission_type: TransmissionType::NotRetransmission,
            largest_acked: None,
            retransmittable_frames: Vec::new(),
            nonretransmittable_frames: Vec::new(),
            fate: SerializedPacketFate::SendToWriter,
            peer_address: None,
        }
    }
}

/// Packet number / length / level triple saved around a re-serialization.
/// The restore is unconditional: both the success and failure paths of the
/// coalesced-initial rebuild put the live context back.
#[derive(Debug, Clone, Copy)]
struct SavedPacketContext {
    packet_number: PacketNumber,
    packet_number_length: PacketNumberLength,
    encryption_level: EncryptionLevel,
}

/// The outgoing packet assembly core.
///
/// Owns the in-progress packet, the queued frames and the size bookkeeping;
/// calls back into the session through `D` for decisions, stream bytes and
/// finished packets. Single-threaded, no suspension points.
pub struct PacketAssembler<D> {
    delegate: D,
    version: Version,
    side: Side,
    sealer: Box<dyn PacketSealer>,
    random: Box<dyn RandomSource>,
    config: AssemblyConfig,

    server_connection_id: ConnectionId,
    client_connection_id: ConnectionId,
    server_connection_id_included: bool,
    retry_token: Bytes,
    diversification_nonce: Option<DiversificationNonce>,
    send_version_in_packet: bool,

    max_packet_length: usize,
    max_plaintext_size: usize,
    /// Non-zero while a soft (temporary) limit is active; holds the value
    /// to restore.
    latched_hard_max_packet_length: usize,
    max_datagram_frame_size: u64,

    /// Header plus committed frames plus committed expansion. Only
    /// meaningful while frames are queued.
    packet_size: usize,
    queued_frames: Vec<QueuedFrame>,
    packet: InProgressPacket,

    pending_padding_bytes: usize,
    needs_full_padding: bool,
    next_transmission_type: TransmissionType,
    flusher_attached: bool,
    write_start_packet_number: Option<PacketNumber>,
}

impl<D: AssemblerDelegate + StreamDataProducer> PacketAssembler<D> {
    pub fn new(
        server_connection_id: ConnectionId,
        version: Version,
        side: Side,
        sealer: Box<dyn PacketSealer>,
        random: Box<dyn RandomSource>,
        config: AssemblyConfig,
        delegate: D,
    ) -> Self {
        let mut assembler = Self {
            delegate,
            version,
            side,
            sealer,
            random,
            config,
            server_connection_id,
            client_connection_id: ConnectionId::empty(),
            server_connection_id_included: true,
            retry_token: Bytes::new(),
            diversification_nonce: None,
            send_version_in_packet: side.is_client(),
            max_packet_length: 0,
            max_plaintext_size: 0,
            latched_hard_max_packet_length: 0,
            max_datagram_frame_size: 0,
            packet_size: 0,
            queued_frames: Vec::new(),
            packet: InProgressPacket::new(),
            pending_padding_bytes: 0,
            needs_full_padding: false,
            next_transmission_type: TransmissionType::NotRetransmission,
            flusher_attached: false,
            write_start_packet_number: None,
        };
        assembler.set_max_packet_length(DEFAULT_MAX_PACKET_SIZE);
        if !version.uses_crypto_frames() {
            // QUIC+TLS negotiates the datagram limit via transport
            // parameters; Google crypto has no channel for it.
            assembler.set_max_datagram_frame_size(MAX_ACCEPTED_DATAGRAM_FRAME_SIZE);
        }
        assembler
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Most recently assigned packet number (0 before the first packet).
    pub fn packet_number(&self) -> PacketNumber {
        self.packet.packet_number
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.packet.encryption_level
    }

    pub fn max_packet_length(&self) -> usize {
        self.max_packet_length
    }

    pub fn has_soft_max_packet_length(&self) -> bool {
        self.latched_hard_max_packet_length != 0
    }

    pub fn pending_padding_bytes(&self) -> usize {
        self.pending_padding_bytes
    }

    pub fn flusher_attached(&self) -> bool {
        self.flusher_attached
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.queued_frames.is_empty()
    }

    pub fn has_pending_retransmittable_frames(&self) -> bool {
        !self.packet.retransmittable_frames.is_empty()
    }

    pub fn has_pending_stream_frames_of_stream(&self, id: StreamId) -> bool {
        self.packet
            .retransmittable_frames
            .iter()
            .any(|frame| matches!(frame, QueuedFrame::Stream(f) if f.stream_id == id))
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    // ========================================================================
    // Context mutators
    // ========================================================================

    /// `max_packet_length` must not change mid-packet.
    pub fn can_set_max_packet_length(&self) -> bool {
        self.queued_frames.is_empty()
    }

    pub fn set_max_packet_length(&mut self, length: usize) {
        debug_assert!(self.can_set_max_packet_length());
        if length == self.max_packet_length {
            return;
        }
        trace!(
            from = self.max_packet_length,
            to = length,
            "updating max packet length"
        );
        self.max_packet_length = length;
        self.max_plaintext_size = length - self.sealer.max_overhead();
        debug_assert!(
            self.max_plaintext_size - self.packet_header_size()
                >= self.version.min_plaintext_packet_size(),
            "max packet length too small"
        );
    }

    /// Temporarily lower the packet-size budget; cleared automatically on
    /// the next serialization. Rejected (restoring the hard limit) when the
    /// reduced budget cannot even hold a header plus the minimum plaintext.
    pub fn set_soft_max_packet_length(&mut self, length: usize) {
        debug_assert!(self.can_set_max_packet_length());
        if length > self.max_packet_length {
            error!(
                length,
                max = self.max_packet_length,
                "soft max packet length may only lower the limit"
            );
            return;
        }
        if length.saturating_sub(self.sealer.max_overhead())
            < self.packet_header_size() + self.version.min_plaintext_packet_size()
        {
            debug!(length, "too small to fit a packet header");
            self.remove_soft_max_packet_length();
            return;
        }
        trace!(length, "setting soft max packet length");
        self.latched_hard_max_packet_length = self.max_packet_length;
        self.max_packet_length = length;
        self.max_plaintext_size = length - self.sealer.max_overhead();
    }

    /// Restore the hard limit after a soft reduction. Returns whether a
    /// soft limit was active and removable.
    pub fn remove_soft_max_packet_length(&mut self) -> bool {
        if self.latched_hard_max_packet_length == 0 {
            return false;
        }
        if !self.can_set_max_packet_length() {
            return false;
        }
        trace!(
            restored = self.latched_hard_max_packet_length,
            "restoring hard max packet length"
        );
        let hard = self.latched_hard_max_packet_length;
        self.latched_hard_max_packet_length = 0;
        self.set_max_packet_length(hard);
        true
    }

    /// Clamp so the frame size always fits a packet length field.
    pub fn set_max_datagram_frame_size(&mut self, max_datagram_frame_size: u64) {
        let upper_bound = u16::MAX as u64;
        self.max_datagram_frame_size = max_datagram_frame_size.min(upper_bound);
    }

    pub fn set_diversification_nonce(&mut self, nonce: DiversificationNonce) {
        debug_assert!(self.diversification_nonce.is_none());
        self.diversification_nonce = Some(nonce);
    }

    pub fn set_retry_token(&mut self, retry_token: Bytes) {
        self.retry_token = retry_token;
    }

    pub fn set_transmission_type(&mut self, transmission_type: TransmissionType) {
        self.next_transmission_type = transmission_type;
    }

    /// The level may only change between packets.
    pub fn set_encryption_level(&mut self, level: EncryptionLevel) {
        debug_assert!(
            level == self.packet.encryption_level || !self.has_pending_frames(),
            "cannot change encryption level with pending frames"
        );
        self.packet.encryption_level = level;
    }

    pub fn set_server_connection_id(&mut self, server_connection_id: ConnectionId) {
        self.server_connection_id = server_connection_id;
    }

    pub fn set_client_connection_id(&mut self, client_connection_id: ConnectionId) {
        debug_assert!(
            client_connection_id.is_empty() || self.version.supports_client_connection_ids()
        );
        self.client_connection_id = client_connection_id;
    }

    pub fn set_server_connection_id_included(&mut self, included: bool) {
        debug_assert!(self.side.is_server() || included);
        self.server_connection_id_included = included;
    }

    pub fn set_server_connection_id_length(&mut self, length: usize) {
        self.set_server_connection_id_included(length != 0);
    }

    /// A peer address change closes the open packet.
    pub fn set_default_peer_address(&mut self, address: SocketAddr) {
        match self.packet.peer_address {
            None => self.packet.peer_address = Some(address),
            Some(current) if current != address => {
                self.flush_current_packet();
                self.packet.peer_address = Some(address);
            }
            Some(_) => {}
        }
    }

    // ========================================================================
    // Packet numbers
    // ========================================================================

    fn next_sending_packet_number(&self) -> PacketNumber {
        self.packet.packet_number + 1
    }

    /// Choose a packet number length able to cover twice the larger of the
    /// unacked delta and the flight size. Refused mid-packet.
    pub fn update_packet_number_length(
        &mut self,
        least_packet_awaited_by_peer: PacketNumber,
        max_packets_in_flight: u64,
    ) {
        if !self.queued_frames.is_empty() {
            error!(
                queued = self.queued_frames.len(),
                "update_packet_number_length with frames queued"
            );
            return;
        }
        let next_packet_number = self.next_sending_packet_number();
        debug_assert!(least_packet_awaited_by_peer <= next_packet_number);
        let current_delta = next_packet_number.saturating_sub(least_packet_awaited_by_peer);
        let delta = current_delta.max(max_packets_in_flight);
        let length = number::min_length_for_delta(delta * 4);
        if self.packet.packet_number_length == length {
            return;
        }
        debug!(
            from = self.packet.packet_number_length.len(),
            to = length.len(),
            least_packet_awaited_by_peer,
            max_packets_in_flight,
            "updating packet number length"
        );
        self.packet.packet_number_length = length;
    }

    /// Leave a gap in the packet number sequence. The numbers are never
    /// reused; wrap-around is rejected.
    pub fn skip_n_packet_numbers(
        &mut self,
        count: u64,
        least_packet_awaited_by_peer: PacketNumber,
        max_packets_in_flight: u64,
    ) {
        if !self.queued_frames.is_empty() {
            error!(
                queued = self.queued_frames.len(),
                "skip_n_packet_numbers with frames queued"
            );
            return;
        }
        let Some(skipped) = self.packet.packet_number.checked_add(count) else {
            error!(count, "skipping would wrap the packet number space");
            return;
        };
        if skipped > crate::types::MAX_PACKET_NUMBER {
            error!(count, "skipping would wrap the packet number space");
            return;
        }
        self.packet.packet_number = skipped;
        self.update_packet_number_length(least_packet_awaited_by_peer, max_packets_in_flight);
    }

    // ========================================================================
    // Header shape
    // ========================================================================

    fn has_ietf_long_header(&self) -> bool {
        self.version.has_ietf_invariant_header()
            && self.packet.encryption_level < EncryptionLevel::ForwardSecure
    }

    fn include_version_in_header(&self) -> bool {
        if self.version.has_ietf_invariant_header() {
            return self.packet.encryption_level < EncryptionLevel::ForwardSecure;
        }
        self.send_version_in_packet
    }

    fn include_nonce_in_public_header(&self) -> bool {
        self.diversification_nonce.is_some()
            && self.packet.encryption_level == EncryptionLevel::ZeroRtt
    }

    fn destination_connection_id(&self) -> &ConnectionId {
        if self.side.is_server() {
            &self.client_connection_id
        } else {
            &self.server_connection_id
        }
    }

    fn source_connection_id(&self) -> &ConnectionId {
        if self.side.is_client() {
            &self.client_connection_id
        } else {
            &self.server_connection_id
        }
    }

    fn destination_connection_id_included(&self) -> bool {
        // Versions without client connection IDs only send the destination
        // connection ID from client to server.
        self.side.is_client() || self.version.supports_client_connection_ids()
    }

    fn source_connection_id_included(&self) -> bool {
        if self.has_ietf_long_header()
            && (self.side.is_server() || self.version.supports_client_connection_ids())
        {
            return true;
        }
        if self.side.is_server() {
            return self.server_connection_id_included;
        }
        false
    }

    fn destination_connection_id_length(&self) -> usize {
        if self.destination_connection_id_included() {
            self.destination_connection_id().len()
        } else {
            0
        }
    }

    fn source_connection_id_length(&self) -> usize {
        if self.source_connection_id_included() {
            self.source_connection_id().len()
        } else {
            0
        }
    }

    /// Packet number length the next header will actually encode.
    fn wire_packet_number_length(&self) -> PacketNumberLength {
        if self.has_ietf_long_header()
            && !self
                .version
                .sends_variable_length_packet_number_in_long_header()
        {
            return PacketNumberLength::Four;
        }
        self.packet.packet_number_length
    }

    fn retry_token(&self) -> Bytes {
        if self.version.has_long_header_lengths()
            && self.has_ietf_long_header()
            && self.packet.encryption_level == EncryptionLevel::Initial
        {
            return self.retry_token.clone();
        }
        Bytes::new()
    }

    fn retry_token_length_length(&self) -> usize {
        if self.version.has_long_header_lengths()
            && self.has_ietf_long_header()
            && self.packet.encryption_level == EncryptionLevel::Initial
        {
            return VarIntCodec::size(self.retry_token.len() as u64);
        }
        0
    }

    fn length_length(&self) -> usize {
        if self.version.has_long_header_lengths() && self.has_ietf_long_header() {
            return 2;
        }
        0
    }

    /// Header size of the packet currently being shaped.
    pub fn packet_header_size(&self) -> usize {
        header::packet_header_size(
            &self.version,
            self.destination_connection_id_length(),
            self.source_connection_id_length(),
            self.include_version_in_header(),
            self.include_nonce_in_public_header(),
            self.wire_packet_number_length(),
            self.retry_token_length_length(),
            self.retry_token().len(),
            self.length_length(),
        )
    }

    /// Header plus single-stream-frame overhead for a packet carrying one
    /// maximal stream frame. Used by sessions to size send buffers.
    pub fn stream_frame_packet_overhead(
        version: &Version,
        destination_connection_id_length: usize,
        source_connection_id_length: usize,
        include_version: bool,
        include_nonce: bool,
        packet_number_length: PacketNumberLength,
        retry_token_length_length: usize,
        length_length: usize,
        offset: StreamOffset,
    ) -> usize {
        header::packet_header_size(
            version,
            destination_connection_id_length,
            source_connection_id_length,
            include_version,
            include_nonce,
            packet_number_length,
            retry_token_length_length,
            0,
            length_length,
        ) + codec::min_stream_frame_size(version, StreamId::new(1), offset, true, MAX_OUTGOING_PACKET_SIZE)
    }

    /// Advance the packet number and build the header for the open packet.
    fn fill_packet_header(&mut self) -> PacketHeader {
        self.packet.packet_number = self.next_sending_packet_number();
        let long_header_type = if self.has_ietf_long_header() {
            self.version.long_header_type(self.packet.encryption_level)
        } else {
            None
        };
        let nonce = if self.include_nonce_in_public_header() {
            debug_assert!(self.side.is_server());
            self.diversification_nonce
        } else {
            None
        };
        PacketHeader {
            version: self.version,
            long_header_type,
            dcid: if self.destination_connection_id_included() {
                self.destination_connection_id().clone()
            } else {
                ConnectionId::empty()
            },
            scid: if self.source_connection_id_included() {
                self.source_connection_id().clone()
            } else {
                ConnectionId::empty()
            },
            nonce,
            packet_number: self.packet.packet_number,
            packet_number_length: self.wire_packet_number_length(),
            retry_token_length_length: self.retry_token_length_length(),
            retry_token: self.retry_token(),
            length_length: self.length_length(),
        }
    }

    // ========================================================================
    // Size bookkeeping
    // ========================================================================

    /// Bytes the trailing queued frame grows by when another frame follows.
    pub fn expansion_on_new_frame(&self) -> usize {
        match self.queued_frames.last() {
            None => 0,
            Some(last) => codec::expansion_on_new_frame_with_last_frame(&self.version, last),
        }
    }

    /// Committed size of the open packet, header included.
    pub fn packet_size(&self) -> usize {
        if self.queued_frames.is_empty() {
            self.packet_header_size()
        } else {
            self.packet_size
        }
    }

    /// Plaintext budget still available for the next frame.
    pub fn bytes_free(&self) -> usize {
        debug_assert!(self.max_plaintext_size >= self.packet_size());
        self.max_plaintext_size
            - self
                .max_plaintext_size
                .min(self.packet_size() + self.expansion_on_new_frame())
    }

    fn has_room_for_stream_frame(
        &mut self,
        id: StreamId,
        offset: StreamOffset,
        data_size: usize,
    ) -> bool {
        let min_stream_frame_size =
            codec::min_stream_frame_size(&self.version, id, offset, true, data_size);
        if self.bytes_free() > min_stream_frame_size {
            return true;
        }
        if !self.remove_soft_max_packet_length() {
            return false;
        }
        self.bytes_free() > min_stream_frame_size
    }

    fn has_room_for_message_frame(&mut self, length: usize) -> bool {
        let message_frame_size = codec::message_frame_size(true, length);
        if message_frame_size as u64 > self.max_datagram_frame_size {
            return false;
        }
        if self.bytes_free() >= message_frame_size {
            return true;
        }
        if !self.remove_soft_max_packet_length() {
            return false;
        }
        self.bytes_free() >= message_frame_size
    }

    /// Serialized length of `frame` in the current packet, extended with
    /// the header-protection minimum-plaintext feasibility check: a frame
    /// only fits if the packet it lands in can still be padded up to the
    /// minimum sample size.
    fn serialized_frame_length(&self, frame: &QueuedFrame) -> usize {
        let serialized_frame_length = codec::serialized_frame_length(
            &self.version,
            frame,
            self.bytes_free(),
            true,
            self.wire_packet_number_length(),
        );
        if !self.version.has_header_protection() || serialized_frame_length == 0 {
            return serialized_frame_length;
        }
        // Frame bytes of the packet with this frame added.
        let frame_bytes = self.packet_size() - self.packet_header_size()
            + self.expansion_on_new_frame()
            + serialized_frame_length;
        if frame_bytes >= self.version.min_plaintext_packet_size() {
            return serialized_frame_length;
        }
        if self.bytes_free() < serialized_frame_length {
            error!(?frame, "frame does not fit");
            return 0;
        }
        // bytes_free does not account for this frame's own expansion.
        let bytes_free = self.bytes_free() - serialized_frame_length;
        let extra_bytes_needed = (1 + codec::expansion_on_new_frame_with_last_frame(
            &self.version,
            frame,
        ))
        .max(self.version.min_plaintext_packet_size() - frame_bytes);
        if bytes_free < extra_bytes_needed {
            return 0;
        }
        serialized_frame_length
    }

    // ========================================================================
    // Frame admission
    // ========================================================================

    /// Report and refuse stream data at a level that does not protect it.
    fn attempting_to_send_unencrypted_stream_data(&mut self) -> bool {
        if self.packet.encryption_level.protects_application_data() {
            return false;
        }
        let details = format!(
            "Cannot send stream data with level: {}",
            self.packet.encryption_level
        );
        error!("{details}");
        self.delegate.on_unrecoverable_error(
            UnrecoverableError::AttemptToSendUnencryptedStreamData,
            &details,
        );
        true
    }

    /// Try to extend the trailing queued stream frame instead of appending
    /// a new one: same stream, contiguous offset, payload fits.
    fn maybe_coalesce_stream_frame(&mut self, frame: &StreamFrame) -> bool {
        let free = self.bytes_free();
        let Some(QueuedFrame::Stream(candidate)) = self.queued_frames.last() else {
            return false;
        };
        if candidate.stream_id != frame.stream_id
            || candidate.offset + candidate.data.len() as u64 != frame.offset
            || frame.data.len() > free
        {
            return false;
        }

        let mut combined = BytesMut::with_capacity(candidate.data.len() + frame.data.len());
        combined.extend_from_slice(&candidate.data);
        combined.extend_from_slice(&frame.data);
        let combined = combined.freeze();

        let Some(QueuedFrame::Stream(candidate)) = self.queued_frames.last_mut() else {
            unreachable!();
        };
        candidate.data = combined.clone();
        candidate.fin = frame.fin;

        // The trailing retransmittable frame is the same stream frame.
        match self.packet.retransmittable_frames.last_mut() {
            Some(QueuedFrame::Stream(retransmittable))
                if retransmittable.stream_id == frame.stream_id =>
            {
                retransmittable.data = combined;
                retransmittable.fin = frame.fin;
            }
            other => {
                debug_assert!(false, "trailing retransmittable frame mismatch: {other:?}");
                return false;
            }
        }
        self.packet_size += frame.data.len();
        trace!(stream_id = frame.stream_id.value(), "coalesced stream frame");
        true
    }

    /// Central gatekeeper: classify, fit, commit.
    pub fn add_frame(&mut self, frame: QueuedFrame, transmission_type: TransmissionType) -> bool {
        trace!(?frame, ?transmission_type, "adding frame");
        if let QueuedFrame::Stream(stream_frame) = &frame {
            if !self.version.is_crypto_stream_id(stream_frame.stream_id)
                && self.attempting_to_send_unencrypted_stream_data()
            {
                return false;
            }
            if self.maybe_coalesce_stream_frame(stream_frame) {
                return true;
            }
        }

        if let QueuedFrame::Ack(ack) = &frame {
            debug_assert!(
                ack.largest_acked > 0 || ack.first_range == 0,
                "invalid ack frame: {ack:?}"
            );
        }

        let mut frame_len = self.serialized_frame_length(&frame);
        if frame_len == 0 && self.remove_soft_max_packet_length() {
            // One-shot retry with the hard limit restored.
            frame_len = self.serialized_frame_length(&frame);
        }
        if frame_len == 0 {
            debug!(?frame, "flushing because the open packet is full");
            self.flush_current_packet();
            return false;
        }
        if self.queued_frames.is_empty() {
            self.packet_size = self.packet_header_size();
        }
        debug_assert!(self.packet_size > 0);

        self.packet_size += self.expansion_on_new_frame() + frame_len;
        let retransmittable = frame.is_retransmittable();

        match &frame {
            QueuedFrame::Ack(ack) => {
                self.packet.has_ack = true;
                self.packet.largest_acked = Some(ack.largest_acked);
            }
            QueuedFrame::StopWaiting(_) => self.packet.has_stop_waiting = true,
            QueuedFrame::AckFrequency(_) => self.packet.has_ack_frequency = true,
            QueuedFrame::Message(_) => self.packet.has_message = true,
            _ => {}
        }

        if retransmittable {
            if frame.is_handshake(&self.version) {
                self.packet.has_crypto_handshake = true;
            }
            self.packet.retransmittable_frames.push(frame.clone());
            self.queued_frames.push(frame);
            self.packet.transmission_type = transmission_type;
        } else {
            if let QueuedFrame::Padding(padding) = &frame {
                if padding.num_padding_bytes == -1 {
                    // Record the resolved length so the session can tell
                    // how much padding actually went out.
                    self.packet
                        .nonretransmittable_frames
                        .push(QueuedFrame::Padding(PaddingFrame {
                            num_padding_bytes: frame_len as i32,
                        }));
                } else {
                    self.packet.nonretransmittable_frames.push(frame.clone());
                }
            } else {
                self.packet.nonretransmittable_frames.push(frame.clone());
            }
            self.queued_frames.push(frame);
        }
        true
    }

    /// Add a frame and request full padding for the packet carrying it.
    pub fn add_padded_saved_frame(
        &mut self,
        frame: QueuedFrame,
        transmission_type: TransmissionType,
    ) -> bool {
        if self.add_frame(frame, transmission_type) {
            self.needs_full_padding = true;
            return true;
        }
        false
    }

    /// Queue padding to be drained into subsequent packets.
    pub fn add_pending_padding(&mut self, size: usize) {
        self.pending_padding_bytes += size;
    }

    fn add_random_padding(&mut self) {
        let size = (self.random.next_u64() % MAX_RANDOM_PADDING_BYTES + 1) as usize;
        self.add_pending_padding(size);
    }

    // ========================================================================
    // Padding
    // ========================================================================

    fn maybe_add_extra_padding_for_header_protection(&mut self) {
        if !self.version.has_header_protection() || self.needs_full_padding {
            return;
        }
        let frame_bytes = self.packet_size() - self.packet_header_size();
        if frame_bytes >= self.version.min_plaintext_packet_size() {
            return;
        }
        let min_header_protection_padding = (1 + self.expansion_on_new_frame())
            .max(self.version.min_plaintext_packet_size() - frame_bytes)
            - self.expansion_on_new_frame();
        self.pending_padding_bytes = self
            .pending_padding_bytes
            .max(min_header_protection_padding);
    }

    /// Append the padding frame, if any, just before serialization.
    fn maybe_add_padding(&mut self) {
        if self.bytes_free() == 0 {
            // Don't pad full packets.
            return;
        }

        if self.packet.transmission_type == TransmissionType::ProbingRetransmission {
            self.needs_full_padding = true;
        }

        if matches!(
            self.packet.fate,
            SerializedPacketFate::Coalesce | SerializedPacketFate::LegacyEncapsulate
        ) {
            // The coalescer pads the final datagram; padding here would
            // squeeze out the other levels.
            self.needs_full_padding = false;
        }

        self.maybe_add_extra_padding_for_header_protection();

        if !self.needs_full_padding && self.pending_padding_bytes == 0 {
            return;
        }

        let padding_bytes: i32 = if self.needs_full_padding {
            -1
        } else {
            let bytes = self.pending_padding_bytes.min(self.bytes_free());
            self.pending_padding_bytes -= bytes;
            bytes as i32
        };

        let success = self.add_frame(
            QueuedFrame::Padding(PaddingFrame {
                num_padding_bytes: padding_bytes,
            }),
            self.packet.transmission_type,
        );
        if !success {
            error!(
                padding_bytes,
                transmission_type = ?self.packet.transmission_type,
                "failed to add padding frame"
            );
        }
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Serialize and emit the open packet, if there is anything to send.
    pub fn flush_current_packet(&mut self) {
        if !self.has_pending_frames() && self.pending_padding_bytes == 0 {
            return;
        }
        let buffer = self
            .delegate
            .packet_buffer()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_OUTGOING_PACKET_SIZE));
        if let Some(packet) = self.serialize_packet(buffer) {
            self.on_serialized_packet(packet);
        }
    }

    fn on_serialized_packet(&mut self, packet: SerializedPacket) {
        self.clear_packet();
        self.remove_soft_max_packet_length();
        self.delegate.on_serialized_packet(packet);
    }

    fn clear_packet(&mut self) {
        self.packet.has_ack = false;
        self.packet.has_stop_waiting = false;
        self.packet.has_crypto_handshake = false;
        self.packet.has_ack_frequency = false;
        self.packet.has_message = false;
        self.packet.transmission_type = TransmissionType::NotRetransmission;
        self.packet.fate = SerializedPacketFate::SendToWriter;
        self.packet.largest_acked = None;
        debug_assert!(self.packet.retransmittable_frames.is_empty());
        debug_assert!(self.packet.nonretransmittable_frames.is_empty());
        self.needs_full_padding = false;
    }

    /// Drop the half-built packet and report exactly one unrecoverable
    /// error. Any failure after the header was constructed lands here.
    fn fail_serialization(&mut self, report: UnrecoverableError, details: &str) {
        self.queued_frames.clear();
        self.packet.retransmittable_frames.clear();
        self.packet.nonretransmittable_frames.clear();
        self.packet_size = 0;
        self.clear_packet();
        error!("{details}");
        self.delegate.on_unrecoverable_error(report, details);
    }

    /// Build, pad and seal the open packet into `buffer`.
    ///
    /// On success the queued frames move into the returned packet. On
    /// failure the queued frames are cleared and the failure is reported;
    /// no partial packet is ever visible.
    fn serialize_packet(&mut self, mut buffer: BytesMut) -> Option<SerializedPacket> {
        debug_assert!(
            !self.queued_frames.is_empty() || self.pending_padding_bytes > 0,
            "attempt to serialize empty packet"
        );
        buffer.clear();

        let header = self.fill_packet_header();
        let is_mtu_discovery = self
            .queued_frames
            .iter()
            .any(|frame| matches!(frame, QueuedFrame::MtuDiscovery));
        self.packet.fate = self
            .delegate
            .serialized_packet_fate(is_mtu_discovery, self.packet.encryption_level);
        trace!(
            packet_number = self.packet.packet_number,
            fate = ?self.packet.fate,
            level = %self.packet.encryption_level,
            "serializing packet"
        );

        self.maybe_add_padding();

        if !self.sealer.has_keys(self.packet.encryption_level) {
            let details = format!(
                "Attempting to serialize at missing encryption level {}",
                self.packet.encryption_level
            );
            self.fail_serialization(UnrecoverableError::MissingEncryptionKeys, &details);
            return None;
        }

        debug_assert!(self.max_plaintext_size >= self.packet_size);
        // Build against packet_size, not the buffer capacity, so reduced
        // budgets are honored.
        let length = match self.build_data_packet(&header, self.packet_size, &mut buffer) {
            Ok(length) => length,
            Err(e) => {
                let details = format!("Failed to build packet: {e}");
                self.fail_serialization(UnrecoverableError::FailedToSerializePacket, &details);
                return None;
            }
        };

        // An ACK may have been truncated for length, but only if it is the
        // only frame and the packet was budgeted to the brim.
        let possibly_truncated_by_length = self.packet_size == self.max_plaintext_size
            && self.queued_frames.len() == 1
            && matches!(self.queued_frames.last(), Some(QueuedFrame::Ack(_)));
        if !possibly_truncated_by_length {
            debug_assert_eq!(self.packet_size, length);
        }

        let encrypted_length = self.sealer.seal_in_place(
            self.packet.encryption_level,
            self.packet.packet_number,
            header.size(),
            &mut buffer,
        );
        if encrypted_length == 0 {
            let details = format!(
                "Failed to encrypt packet number {}",
                self.packet.packet_number
            );
            self.fail_serialization(UnrecoverableError::FailedToSerializePacket, &details);
            return None;
        }

        self.packet_size = 0;
        self.queued_frames.clear();
        Some(SerializedPacket {
            packet_number: self.packet.packet_number,
            packet_number_length: header.packet_number_length,
            encrypted: buffer.freeze(),
            fate: self.packet.fate,
            encryption_level: self.packet.encryption_level,
            transmission_type: self.packet.transmission_type,
            retransmittable_frames: std::mem::take(&mut self.packet.retransmittable_frames),
            nonretransmittable_frames: std::mem::take(&mut self.packet.nonretransmittable_frames),
            has_ack: self.packet.has_ack,
            has_stop_waiting: self.packet.has_stop_waiting,
            has_crypto_handshake: self.packet.has_crypto_handshake,
            has_ack_frequency: self.packet.has_ack_frequency,
            has_message: self.packet.has_message,
            largest_acked: self.packet.largest_acked,
            peer_address: self.packet.peer_address,
        })
    }

    /// Write header and queued frames into `buffer` up to `packet_limit`
    /// plaintext bytes, then patch the long-header Length field.
    fn build_data_packet(
        &self,
        header: &PacketHeader,
        packet_limit: usize,
        buffer: &mut BytesMut,
    ) -> Result<usize, CodecError> {
        let (_, length_field_offset) = header::write_header(header, buffer)?;
        let ctx = FrameContext {
            version: self.version,
            packet_number: header.packet_number,
            packet_number_length: header.packet_number_length,
        };
        let frame_count = self.queued_frames.len();
        for (index, frame) in self.queued_frames.iter().enumerate() {
            let last_frame_in_packet = index + 1 == frame_count;
            let available = packet_limit - buffer.len();
            codec::write_frame(&ctx, frame, last_frame_in_packet, available, buffer)?;
        }
        header::patch_long_header_length(
            header,
            buffer,
            length_field_offset,
            self.sealer.tag_len(self.packet.encryption_level),
        )?;
        Ok(buffer.len())
    }

    // ========================================================================
    // Stream data
    // ========================================================================

    /// Write stream data, producing zero or more packets. The bytes come
    /// from the delegate's stream-data producer.
    pub fn consume_data(
        &mut self,
        id: StreamId,
        write_length: usize,
        offset: StreamOffset,
        state: StreamSendingState,
    ) -> ConsumedData {
        if !self.flusher_attached {
            error!("flusher is not attached when writing stream data");
        }
        let has_handshake = self.version.is_crypto_stream_id(id);
        self.maybe_bundle_ack_opportunistically();
        let fin = state != StreamSendingState::NoFin;
        if has_handshake && fin {
            error!("handshake packets should never send a fin");
        }
        // Crypto stream data is never combined with other retransmittable
        // frames, to keep handshake packets easy to reason about.
        if has_handshake && self.has_pending_retransmittable_frames() {
            self.flush_current_packet();
        }

        let mut total_bytes_consumed = 0usize;
        let mut fin_consumed = false;

        if !self.has_room_for_stream_frame(id, offset, write_length) {
            self.flush_current_packet();
        }

        if !fin && write_length == 0 {
            error!("attempt to consume empty data without FIN");
            return ConsumedData {
                bytes_consumed: 0,
                fin_consumed: false,
            };
        }

        let mut run_fast_path = !has_handshake
            && state != StreamSendingState::FinAndPadding
            && !self.has_pending_frames()
            && write_length - total_bytes_consumed > MAX_OUTGOING_PACKET_SIZE
            && self.latched_hard_max_packet_length == 0;

        while !run_fast_path
            && (has_handshake || self.delegate.should_generate_packet(true, false))
        {
            let needs_full_padding =
                has_handshake && self.config.fully_pad_crypto_handshake_packets;
            let transmission_type = self.next_transmission_type;
            let Some(bytes_consumed) = self.consume_data_to_fill_current_packet(
                id,
                write_length - total_bytes_consumed,
                offset + total_bytes_consumed as u64,
                fin,
                needs_full_padding,
                transmission_type,
            ) else {
                // The packet was flushed if it lacked room before this
                // call, so a failure here is a hard one.
                error!(stream_id = id.value(), "failed to consume stream data");
                return ConsumedData {
                    bytes_consumed: 0,
                    fin_consumed: false,
                };
            };

            total_bytes_consumed += bytes_consumed;
            fin_consumed = fin && total_bytes_consumed == write_length;
            if fin_consumed && state == StreamSendingState::FinAndPadding {
                self.add_random_padding();
            }
            debug_assert!(
                total_bytes_consumed == write_length
                    || (bytes_consumed > 0 && self.has_pending_frames())
            );

            if total_bytes_consumed == write_length {
                // Done writing; a pure-FIN write consumes zero bytes.
                break;
            }
            self.flush_current_packet();

            run_fast_path = !has_handshake
                && state != StreamSendingState::FinAndPadding
                && !self.has_pending_frames()
                && write_length - total_bytes_consumed > MAX_OUTGOING_PACKET_SIZE
                && self.latched_hard_max_packet_length == 0;
        }

        if run_fast_path {
            return self.consume_data_fast_path(
                id,
                write_length,
                offset,
                state != StreamSendingState::NoFin,
                total_bytes_consumed,
            );
        }

        if has_handshake {
            self.flush_current_packet();
        }

        ConsumedData {
            bytes_consumed: total_bytes_consumed,
            fin_consumed,
        }
    }

    /// Tight serialization loop for bulk data: one maximal single-frame
    /// packet per iteration, bypassing the frame queue.
    fn consume_data_fast_path(
        &mut self,
        id: StreamId,
        write_length: usize,
        offset: StreamOffset,
        fin: bool,
        mut total_bytes_consumed: usize,
    ) -> ConsumedData {
        debug_assert!(!self.version.is_crypto_stream_id(id));
        if self.attempting_to_send_unencrypted_stream_data() {
            return ConsumedData {
                bytes_consumed: total_bytes_consumed,
                fin_consumed: fin && total_bytes_consumed == write_length,
            };
        }

        while total_bytes_consumed < write_length
            && self.delegate.should_generate_packet(true, false)
        {
            let transmission_type = self.next_transmission_type;
            let bytes_consumed = self.create_and_serialize_stream_frame(
                id,
                write_length,
                total_bytes_consumed,
                offset + total_bytes_consumed as u64,
                fin,
                transmission_type,
            );
            if bytes_consumed == 0 {
                let details = "Failed in the stream frame fast path.";
                error!("{details}");
                self.delegate
                    .on_unrecoverable_error(UnrecoverableError::FailedToSerializePacket, details);
                break;
            }
            total_bytes_consumed += bytes_consumed;
        }

        ConsumedData {
            bytes_consumed: total_bytes_consumed,
            fin_consumed: fin && total_bytes_consumed == write_length,
        }
    }

    /// Fit one stream frame into the open packet. Returns the bytes
    /// consumed, or None when the frame could not be added.
    fn consume_data_to_fill_current_packet(
        &mut self,
        id: StreamId,
        data_size: usize,
        offset: StreamOffset,
        fin: bool,
        needs_full_padding: bool,
        transmission_type: TransmissionType,
    ) -> Option<usize> {
        if !self.has_room_for_stream_frame(id, offset, data_size) {
            return None;
        }
        let frame = self.create_stream_frame(id, data_size, offset, fin)?;
        // Multi-packet CHLOs are explicitly disallowed.
        if self.config.enforce_single_packet_chlo
            && self.stream_frame_is_client_hello(&frame)
            && frame.data.len() < data_size
        {
            let details = "Client hello won't fit in a single packet.";
            error!(
                frame_length = frame.data.len(),
                chlo_length = data_size,
                "{details}"
            );
            self.delegate
                .on_unrecoverable_error(UnrecoverableError::CryptoChloTooLarge, details);
            return None;
        }
        let bytes_consumed = frame.data.len();
        if !self.add_frame(QueuedFrame::Stream(frame), transmission_type) {
            // Fails when stream data is submitted at an unencrypted level.
            return None;
        }
        if needs_full_padding {
            self.needs_full_padding = true;
        }
        Some(bytes_consumed)
    }

    fn create_stream_frame(
        &mut self,
        id: StreamId,
        data_size: usize,
        offset: StreamOffset,
        fin: bool,
    ) -> Option<StreamFrame> {
        if data_size == 0 && !fin {
            error!(stream_id = id.value(), "stream frame with no data or fin");
            return None;
        }
        let min_frame_size =
            codec::min_stream_frame_size(&self.version, id, offset, true, data_size);
        let bytes_consumed = (self.bytes_free() - min_frame_size).min(data_size);
        let set_fin = fin && bytes_consumed == data_size;

        let data = if bytes_consumed == 0 {
            Bytes::new()
        } else {
            let Some(data) = self.delegate.stream_data(id, offset, bytes_consumed) else {
                error!(stream_id = id.value(), offset, "stream data unavailable");
                return None;
            };
            debug_assert_eq!(data.len(), bytes_consumed);
            data
        };
        Some(StreamFrame {
            stream_id: id,
            offset,
            data,
            fin: set_fin,
        })
    }

    fn stream_frame_is_client_hello(&self, frame: &StreamFrame) -> bool {
        if self.side.is_server() || !self.version.is_crypto_stream_id(frame.stream_id) {
            return false;
        }
        // The ClientHello is always sent with INITIAL encryption.
        self.packet.encryption_level == EncryptionLevel::Initial
    }

    /// Fast-path serializer: header, one stream frame, minimum-plaintext
    /// padding if required, seal, publish. Shares the sizing functions and
    /// frame writer with the slow path so both produce identical bytes.
    fn create_and_serialize_stream_frame(
        &mut self,
        id: StreamId,
        write_length: usize,
        iov_offset: usize,
        stream_offset: StreamOffset,
        fin: bool,
        transmission_type: TransmissionType,
    ) -> usize {
        debug_assert!(self.queued_frames.is_empty());
        debug_assert!(!self.version.is_crypto_stream_id(id));

        let header = self.fill_packet_header();
        self.packet.fate = self
            .delegate
            .serialized_packet_fate(false, self.packet.encryption_level);
        trace!(
            packet_number = self.packet.packet_number,
            fate = ?self.packet.fate,
            level = %self.packet.encryption_level,
            "fast-path serializing stream packet"
        );

        let mut buffer = self
            .delegate
            .packet_buffer()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_OUTGOING_PACKET_SIZE));
        buffer.clear();

        let (header_len, length_field_offset) = match header::write_header(&header, &mut buffer) {
            Ok(result) => result,
            Err(e) => {
                error!("failed to write packet header: {e}");
                return 0;
            }
        };

        debug_assert!(iov_offset < write_length || fin);
        let remaining_data_size = write_length - iov_offset;
        let mut min_frame_size = codec::min_stream_frame_size(
            &self.version,
            id,
            stream_offset,
            true,
            remaining_data_size,
        );
        let mut available_size = self.max_plaintext_size - header_len - min_frame_size;
        let mut bytes_consumed = available_size.min(remaining_data_size);
        let mut plaintext_bytes_written = min_frame_size + bytes_consumed;
        let mut needs_padding = false;
        if plaintext_bytes_written < self.version.min_plaintext_packet_size() {
            needs_padding = true;
            // Resize with the frame no longer last in the packet; padding
            // will follow it.
            min_frame_size = codec::min_stream_frame_size(
                &self.version,
                id,
                stream_offset,
                false,
                remaining_data_size,
            );
            available_size = self.max_plaintext_size - header_len - min_frame_size;
            bytes_consumed = available_size.min(remaining_data_size);
            plaintext_bytes_written = min_frame_size + bytes_consumed;
        }

        let set_fin = fin && bytes_consumed == remaining_data_size;
        let Some(data) = self.delegate.stream_data(id, stream_offset, bytes_consumed) else {
            error!(stream_id = id.value(), stream_offset, "stream data unavailable");
            return 0;
        };
        debug_assert_eq!(data.len(), bytes_consumed);
        let frame = StreamFrame {
            stream_id: id,
            offset: stream_offset,
            data,
            fin: set_fin,
        };
        trace!(?frame, "fast-path adding frame");

        let ctx = FrameContext {
            version: self.version,
            packet_number: header.packet_number,
            packet_number_length: header.packet_number_length,
        };
        let queued = QueuedFrame::Stream(frame);
        let available = self.max_plaintext_size - buffer.len();
        if codec::write_frame(&ctx, &queued, !needs_padding, available, &mut buffer).is_err() {
            error!("failed to append stream frame");
            return 0;
        }
        if needs_padding
            && plaintext_bytes_written < self.version.min_plaintext_packet_size()
        {
            let padding = self.version.min_plaintext_packet_size() - plaintext_bytes_written;
            buffer.put_bytes(0x00, padding);
        }

        if header::patch_long_header_length(
            &header,
            &mut buffer,
            length_field_offset,
            self.sealer.tag_len(self.packet.encryption_level),
        )
        .is_err()
        {
            error!("failed to patch long header length");
            return 0;
        }

        self.packet.transmission_type = transmission_type;

        debug_assert!(self.packet.encryption_level.protects_application_data());
        let encrypted_length = self.sealer.seal_in_place(
            self.packet.encryption_level,
            self.packet.packet_number,
            header_len,
            &mut buffer,
        );
        if encrypted_length == 0 {
            error!(
                packet_number = self.packet.packet_number,
                "failed to encrypt fast-path packet"
            );
            return 0;
        }

        self.packet_size = 0;
        let packet = SerializedPacket {
            packet_number: self.packet.packet_number,
            packet_number_length: header.packet_number_length,
            encrypted: buffer.freeze(),
            fate: self.packet.fate,
            encryption_level: self.packet.encryption_level,
            transmission_type: self.packet.transmission_type,
            retransmittable_frames: vec![queued],
            nonretransmittable_frames: Vec::new(),
            has_ack: false,
            has_stop_waiting: false,
            has_crypto_handshake: false,
            has_ack_frequency: false,
            has_message: false,
            largest_acked: None,
            peer_address: self.packet.peer_address,
        };
        self.on_serialized_packet(packet);
        bytes_consumed
    }

    // ========================================================================
    // Crypto data
    // ========================================================================

    /// Write crypto handshake data at `level`, one full packet at a time.
    /// Always flushes on return so a following write at another level
    /// starts fresh.
    pub fn consume_crypto_data(
        &mut self,
        level: EncryptionLevel,
        write_length: usize,
        offset: StreamOffset,
    ) -> usize {
        trace!(%level, write_length, offset, "consume_crypto_data");
        if !self.flusher_attached {
            error!("flusher is not attached when writing crypto data");
        }
        self.maybe_bundle_ack_opportunistically();
        // Crypto frames are not combined with other retransmittable frames.
        if self.has_pending_retransmittable_frames() {
            self.flush_current_packet();
        }

        let mut total_bytes_consumed = 0usize;

        while total_bytes_consumed < write_length
            && self.delegate.should_generate_packet(true, true)
        {
            let needs_full_padding = self.config.fully_pad_crypto_handshake_packets;
            let transmission_type = self.next_transmission_type;
            let Some(bytes_consumed) = self.consume_crypto_data_to_fill_current_packet(
                level,
                write_length - total_bytes_consumed,
                offset + total_bytes_consumed as u64,
                needs_full_padding,
                transmission_type,
            ) else {
                // Only non-retransmittable frames can be pending here, and
                // they should never crowd out a crypto frame.
                error!(%level, "failed to consume crypto data");
                return 0;
            };
            total_bytes_consumed += bytes_consumed;
            self.flush_current_packet();
        }

        // The handshake is never bundled with other retransmittable frames.
        self.flush_current_packet();

        total_bytes_consumed
    }

    fn consume_crypto_data_to_fill_current_packet(
        &mut self,
        level: EncryptionLevel,
        write_length: usize,
        offset: StreamOffset,
        needs_full_padding: bool,
        transmission_type: TransmissionType,
    ) -> Option<usize> {
        let frame = self.create_crypto_frame(level, write_length, offset)?;
        let bytes_consumed = frame.data.len();
        if needs_full_padding {
            self.needs_full_padding = true;
        }
        if !self.add_frame(QueuedFrame::Crypto(frame), transmission_type) {
            return None;
        }
        Some(bytes_consumed)
    }

    fn create_crypto_frame(
        &mut self,
        level: EncryptionLevel,
        write_length: usize,
        offset: StreamOffset,
    ) -> Option<CryptoFrame> {
        let min_frame_size = codec::min_crypto_frame_size(write_length, offset);
        if self.bytes_free() <= min_frame_size
            && (!self.remove_soft_max_packet_length() || self.bytes_free() <= min_frame_size)
        {
            return None;
        }
        let max_write_length = self.bytes_free() - min_frame_size;
        let bytes_consumed = max_write_length.min(write_length);
        let Some(data) = self.delegate.crypto_data(level, offset, bytes_consumed) else {
            error!(%level, offset, "crypto data unavailable");
            return None;
        };
        debug_assert_eq!(data.len(), bytes_consumed);
        Some(CryptoFrame {
            level,
            offset,
            data,
        })
    }

    // ========================================================================
    // Control frames and ACKs
    // ========================================================================

    /// Bundle a pending ACK, then try to add the control frame. PING and
    /// CONNECTION_CLOSE bypass the delegate's congestion check.
    pub fn consume_retransmittable_control_frame(&mut self, frame: QueuedFrame) -> bool {
        debug_assert!(frame.is_retransmittable(), "{frame:?}");
        let is_ping = matches!(frame, QueuedFrame::Ping(_));
        if frame.control_frame_id() == Some(INVALID_CONTROL_FRAME_ID)
            && !(self.config.let_connection_handle_pings && is_ping)
        {
            error!(?frame, "control frame with no control frame id");
        }
        self.maybe_bundle_ack_opportunistically();
        if self.has_pending_frames() {
            if self.add_frame(frame.clone(), self.next_transmission_type) {
                // The open packet had room.
                return true;
            }
        }
        debug_assert!(!self.has_pending_frames());
        let is_close = matches!(frame, QueuedFrame::ConnectionClose(_));
        if !is_ping && !is_close && !self.delegate.should_generate_packet(true, false) {
            return false;
        }
        let success = self.add_frame(frame, self.next_transmission_type);
        if !success {
            error!("failed to add control frame to a fresh packet");
        }
        success
    }

    /// Ask the session for a pending ACK and bundle it into the packet
    /// being built. Consulted at most once per write operation.
    pub fn maybe_bundle_ack_opportunistically(&mut self) {
        if self.packet.has_ack {
            return;
        }
        if !self.delegate.should_generate_packet(false, false) {
            return;
        }
        let frames = self.delegate.maybe_bundle_ack_opportunistically();
        let flushed = self.flush_ack_frame(frames);
        if !flushed {
            error!(
                level = %self.packet.encryption_level,
                "failed to flush bundled ACK frame"
            );
        }
    }

    /// Append ACK/STOP_WAITING frames, opening a fresh packet if needed.
    /// Callable even when the delegate would not otherwise permit a packet.
    pub fn flush_ack_frame(&mut self, frames: Vec<QueuedFrame>) -> bool {
        if !self.flusher_attached {
            error!("flusher is not attached when flushing an ACK frame");
        }
        for frame in frames {
            debug_assert!(
                matches!(frame, QueuedFrame::Ack(_) | QueuedFrame::StopWaiting(_)),
                "{frame:?}"
            );
            if self.has_pending_frames() {
                if self.add_frame(frame.clone(), self.next_transmission_type) {
                    // The open packet had room.
                    continue;
                }
            }
            debug_assert!(!self.has_pending_frames());
            // Nothing pending; the delegate decides whether a new packet
            // may be opened for the ACK.
            if !self.delegate.should_generate_packet(false, false) {
                return false;
            }
            let success = self.add_frame(frame, self.next_transmission_type);
            if !success {
                error!("failed to flush ACK frame into a fresh packet");
            }
        }
        true
    }

    // ========================================================================
    // Messages (DATAGRAM frames)
    // ========================================================================

    pub fn add_message_frame(&mut self, message_id: u64, data: Bytes) -> MessageStatus {
        if !self.flusher_attached {
            error!("flusher is not attached when adding a message frame");
        }
        self.maybe_bundle_ack_opportunistically();
        let message_length = data.len();
        if message_length as u64 > u64::from(self.current_largest_message_payload()) {
            return MessageStatus::TooLarge;
        }
        if !self.has_room_for_message_frame(message_length) {
            self.flush_current_packet();
        }
        let frame = QueuedFrame::Message(crate::frames::types::MessageFrame { message_id, data });
        if !self.add_frame(frame, self.next_transmission_type) {
            error!(message_id, "failed to add message frame");
            return MessageStatus::InternalError;
        }
        MessageStatus::Success
    }

    /// Largest message payload that fits the open packet shape right now.
    pub fn current_largest_message_payload(&self) -> u16 {
        if !self.version.supports_message_frames() {
            return 0;
        }
        let packet_header_size = header::packet_header_size(
            &self.version,
            self.destination_connection_id_length(),
            self.source_connection_id_length(),
            self.include_version_in_header(),
            self.include_nonce_in_public_header(),
            self.wire_packet_number_length(),
            // No retry token on packets carrying application data.
            0,
            0,
            self.length_length(),
        );
        let max_plaintext_size = if self.latched_hard_max_packet_length == 0 {
            self.max_plaintext_size
        } else {
            self.latched_hard_max_packet_length - self.sealer.max_overhead()
        };
        let mut largest_frame =
            max_plaintext_size - max_plaintext_size.min(packet_header_size);
        if largest_frame as u64 > self.max_datagram_frame_size {
            largest_frame = self.max_datagram_frame_size as usize;
        }
        (largest_frame - largest_frame.min(FRAME_TYPE_SIZE)) as u16
    }

    /// Largest message payload guaranteed to fit regardless of the open
    /// packet's header shape.
    pub fn guaranteed_largest_message_payload(&self) -> u16 {
        if !self.version.supports_message_frames() {
            return 0;
        }
        // Pre-TLS server packets may carry a diversification nonce.
        let may_include_nonce = !self.version.uses_crypto_frames() && self.side.is_server();
        let length_length = if self.version.has_long_header_lengths() && self.side.is_client() {
            2
        } else {
            0
        };
        let packet_header_size = header::packet_header_size(
            &self.version,
            self.destination_connection_id_length(),
            self.source_connection_id_length(),
            true,
            may_include_nonce,
            PacketNumberLength::Four,
            0,
            0,
            length_length,
        );
        let max_plaintext_size = if self.latched_hard_max_packet_length == 0 {
            self.max_plaintext_size
        } else {
            self.latched_hard_max_packet_length - self.sealer.max_overhead()
        };
        let mut largest_frame =
            max_plaintext_size - max_plaintext_size.min(packet_header_size);
        if largest_frame as u64 > self.max_datagram_frame_size {
            largest_frame = self.max_datagram_frame_size as usize;
        }
        let largest_payload = (largest_frame - largest_frame.min(FRAME_TYPE_SIZE)) as u16;
        debug_assert!(largest_payload <= self.current_largest_message_payload());
        largest_payload
    }

    // ========================================================================
    // MTU discovery and path probes
    // ========================================================================

    /// Emit a single full-size probe at `target_mtu`, then restore the
    /// previous limit. Must be called with no frames queued.
    pub fn generate_mtu_discovery_packet(&mut self, target_mtu: usize) {
        if !self.can_set_max_packet_length() {
            error!("MTU discovery packets require an empty frame queue");
            return;
        }
        let current_mtu = self.max_packet_length();

        self.set_max_packet_length(target_mtu);
        let transmission_type = self.next_transmission_type;
        let success = self.add_padded_saved_frame(QueuedFrame::MtuDiscovery, transmission_type);
        self.flush_current_packet();
        // add_frame can only fail if the packet is too full for a ping,
        // which no sane MTU produces.
        if !success {
            error!(target_mtu, "failed to send MTU discovery probe");
        }

        self.set_max_packet_length(current_mtu);
    }

    /// Padded PING probe for versions without IETF path frames.
    pub fn serialize_connectivity_probe(&mut self) -> Option<SerializedPacket> {
        debug_assert!(
            !self.version.has_ietf_quic_frames(),
            "IETF versions probe with PATH_CHALLENGE"
        );
        debug_assert!(!self.has_pending_frames());
        self.remove_soft_max_packet_length();
        let frames = [
            QueuedFrame::Ping(crate::frames::types::PingFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
            }),
            QueuedFrame::Padding(PaddingFrame {
                num_padding_bytes: -1,
            }),
        ];
        self.serialize_probe_packet(&frames)
    }

    /// PATH_CHALLENGE probe with a random payload, padded to full MTU.
    /// Returns the payload so the session can match the response.
    pub fn serialize_path_challenge(&mut self) -> Option<([u8; 8], SerializedPacket)> {
        debug_assert!(
            self.version.has_ietf_quic_frames(),
            "PATH_CHALLENGE requires IETF frames"
        );
        debug_assert!(!self.has_pending_frames());
        self.remove_soft_max_packet_length();
        let mut payload = [0u8; 8];
        self.random.fill_bytes(&mut payload);
        let frames = [
            QueuedFrame::PathChallenge(PathChallengeFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                payload,
            }),
            QueuedFrame::Padding(PaddingFrame {
                num_padding_bytes: -1,
            }),
        ];
        self.serialize_probe_packet(&frames)
            .map(|packet| (payload, packet))
    }

    /// PATH_RESPONSE echoing one or more received payloads, optionally
    /// padded to full MTU.
    pub fn serialize_path_response(
        &mut self,
        payloads: &[[u8; 8]],
        is_padded: bool,
    ) -> Option<SerializedPacket> {
        debug_assert!(
            self.version.has_ietf_quic_frames(),
            "PATH_RESPONSE requires IETF frames"
        );
        debug_assert!(!self.has_pending_frames());
        if payloads.is_empty() {
            error!("attempt to generate a path response with no payloads");
            return None;
        }
        self.remove_soft_max_packet_length();
        let mut frames: Vec<QueuedFrame> = payloads
            .iter()
            .map(|payload| {
                QueuedFrame::PathResponse(PathResponseFrame {
                    control_frame_id: INVALID_CONTROL_FRAME_ID,
                    payload: *payload,
                })
            })
            .collect();
        if is_padded {
            frames.push(QueuedFrame::Padding(PaddingFrame {
                num_padding_bytes: -1,
            }));
        }
        self.serialize_probe_packet(&frames)
    }

    /// Serialize a probe packet from `frames` without touching the queued
    /// frame state. Probes always travel forward secure.
    fn serialize_probe_packet(&mut self, frames: &[QueuedFrame]) -> Option<SerializedPacket> {
        debug_assert_eq!(
            self.packet.encryption_level,
            EncryptionLevel::ForwardSecure
        );
        let header = self.fill_packet_header();
        trace!(packet_number = self.packet.packet_number, "serializing probe");

        let mut buffer = BytesMut::with_capacity(MAX_OUTGOING_PACKET_SIZE);
        let (header_len, length_field_offset) =
            header::write_header(&header, &mut buffer).ok()?;
        let ctx = FrameContext {
            version: self.version,
            packet_number: header.packet_number,
            packet_number_length: header.packet_number_length,
        };
        for (index, frame) in frames.iter().enumerate() {
            let available = self.max_plaintext_size - buffer.len();
            codec::write_frame(&ctx, frame, index + 1 == frames.len(), available, &mut buffer)
                .ok()?;
        }
        header::patch_long_header_length(
            &header,
            &mut buffer,
            length_field_offset,
            self.sealer.tag_len(self.packet.encryption_level),
        )
        .ok()?;

        let encrypted_length = self.sealer.seal_in_place(
            self.packet.encryption_level,
            self.packet.packet_number,
            header_len,
            &mut buffer,
        );
        if encrypted_length == 0 {
            error!(
                packet_number = self.packet.packet_number,
                "failed to encrypt probe packet"
            );
            return None;
        }

        Some(SerializedPacket {
            packet_number: header.packet_number,
            packet_number_length: header.packet_number_length,
            encrypted: buffer.freeze(),
            fate: SerializedPacketFate::SendToWriter,
            encryption_level: self.packet.encryption_level,
            transmission_type: TransmissionType::NotRetransmission,
            retransmittable_frames: Vec::new(),
            nonretransmittable_frames: Vec::new(),
            has_ack: false,
            has_stop_waiting: false,
            has_crypto_handshake: false,
            has_ack_frequency: false,
            has_message: false,
            largest_acked: None,
            peer_address: self.packet.peer_address,
        })
    }

    /// Bundle a PATH_CHALLENGE into the open packet, or open a padded one.
    /// Failure is silent; the path validator retries on its own timer.
    pub fn add_path_challenge_frame(&mut self) -> Option<[u8; 8]> {
        let mut payload = [0u8; 8];
        self.random.fill_bytes(&mut payload);
        let frame = QueuedFrame::PathChallenge(PathChallengeFrame {
            control_frame_id: INVALID_CONTROL_FRAME_ID,
            payload,
        });
        if self.add_padded_frame_with_retry(frame) {
            return Some(payload);
        }
        debug!("cannot send PATH_CHALLENGE now");
        None
    }

    /// Bundle a PATH_RESPONSE echoing `payload` into the open packet, or
    /// open a padded one.
    pub fn add_path_response_frame(&mut self, payload: [u8; 8]) -> bool {
        let frame = QueuedFrame::PathResponse(PathResponseFrame {
            control_frame_id: INVALID_CONTROL_FRAME_ID,
            payload,
        });
        if self.add_padded_frame_with_retry(frame) {
            return true;
        }
        debug!("cannot send PATH_RESPONSE now");
        false
    }

    fn add_padded_frame_with_retry(&mut self, frame: QueuedFrame) -> bool {
        if self.has_pending_frames() {
            if self.add_padded_saved_frame(frame.clone(), TransmissionType::NotRetransmission) {
                return true;
            }
        }
        // Frame was not queued but the queued frames were flushed.
        debug_assert!(!self.has_pending_frames());
        if !self.delegate.should_generate_packet(false, false) {
            return false;
        }
        let success = self.add_padded_saved_frame(frame, TransmissionType::NotRetransmission);
        if !success {
            error!("failed to add padded frame to a fresh packet");
        }
        success
    }

    // ========================================================================
    // Coalescing
    // ========================================================================

    /// Serialize a coalesced datagram into `buffer`: the INITIAL packet is
    /// rebuilt with tail padding, the remaining levels are copied in
    /// ascending order. Returns the datagram length, or 0 on failure.
    pub fn serialize_coalesced_packet(
        &mut self,
        coalesced: &CoalescedPacket,
        buffer: &mut BytesMut,
    ) -> usize {
        if self.has_pending_frames() {
            error!("cannot serialize a coalesced packet with pending frames");
            return 0;
        }
        self.remove_soft_max_packet_length();
        if coalesced.length() == 0 {
            error!("attempt to serialize empty coalesced packet");
            return 0;
        }
        buffer.clear();
        if let Some(initial) = coalesced.initial_packet() {
            let mut padding_size = coalesced.max_packet_length() - coalesced.length();
            if self.side.is_server() && initial.has_connection_close() {
                // A closing server does not pad its INITIAL.
                padding_size = 0;
            }
            let initial_length =
                self.reserialize_initial_packet_in_coalesced_packet(initial, padding_size, buffer);
            if initial_length == 0 {
                error!("failed to reserialize INITIAL packet in coalesced packet");
                return 0;
            }
        }
        for level in [
            EncryptionLevel::Handshake,
            EncryptionLevel::ZeroRtt,
            EncryptionLevel::ForwardSecure,
        ] {
            if let Some(encrypted) = coalesced.encrypted_buffer(level) {
                buffer.extend_from_slice(encrypted);
            }
        }
        debug!(length = buffer.len(), "serialized coalesced packet");
        buffer.len()
    }

    /// Rebuild a previously serialized INITIAL packet with `padding_size`
    /// extra tail padding, reusing its original packet number. The live
    /// packet context is switched out for the duration and restored
    /// unconditionally.
    fn reserialize_initial_packet_in_coalesced_packet(
        &mut self,
        packet: &SerializedPacket,
        padding_size: usize,
        buffer: &mut BytesMut,
    ) -> usize {
        debug_assert_eq!(packet.encryption_level, EncryptionLevel::Initial);
        if packet.retransmittable_frames.is_empty() && packet.nonretransmittable_frames.is_empty()
        {
            error!("attempt to reserialize an empty INITIAL packet");
            return 0;
        }

        let saved = SavedPacketContext {
            packet_number: self.packet.packet_number,
            packet_number_length: self.packet.packet_number_length,
            encryption_level: self.packet.encryption_level,
        };
        // The serializer advances the packet number, so start one below
        // the number being reused.
        self.packet.packet_number = packet.packet_number - 1;
        self.packet.packet_number_length = packet.packet_number_length;
        self.packet.encryption_level = EncryptionLevel::Initial;

        let encrypted_length = self.reserialize_initial_frames(packet, padding_size, buffer);

        self.packet.packet_number = saved.packet_number;
        self.packet.packet_number_length = saved.packet_number_length;
        self.packet.encryption_level = saved.encryption_level;
        encrypted_length
    }

    fn reserialize_initial_frames(
        &mut self,
        packet: &SerializedPacket,
        padding_size: usize,
        buffer: &mut BytesMut,
    ) -> usize {
        for frame in &packet.nonretransmittable_frames {
            if !self.add_frame(frame.clone(), packet.transmission_type) {
                error!(?frame, "failed to requeue frame for reserialization");
                self.discard_reserialization_state();
                return 0;
            }
        }
        for frame in &packet.retransmittable_frames {
            if !self.add_frame(frame.clone(), packet.transmission_type) {
                error!(?frame, "failed to requeue frame for reserialization");
                self.discard_reserialization_state();
                return 0;
            }
        }
        if padding_size > 0 {
            trace!(padding_size, "adding tail padding to INITIAL packet");
            if !self.add_frame(
                QueuedFrame::Padding(PaddingFrame {
                    num_padding_bytes: padding_size as i32,
                }),
                packet.transmission_type,
            ) {
                error!(padding_size, "failed to add tail padding to INITIAL packet");
                self.discard_reserialization_state();
                return 0;
            }
        }

        let scratch = BytesMut::with_capacity(MAX_OUTGOING_PACKET_SIZE);
        let Some(serialized) = self.serialize_packet(scratch) else {
            // serialize_packet already cleared the queued state.
            return 0;
        };
        let encrypted_length = serialized.encrypted_length();
        buffer.extend_from_slice(&serialized.encrypted);
        // The requeued frames were clones owned by the coalesced packet;
        // drop them rather than publishing.
        self.clear_packet();
        encrypted_length
    }

    fn discard_reserialization_state(&mut self) {
        self.queued_frames.clear();
        self.packet.retransmittable_frames.clear();
        self.packet.nonretransmittable_frames.clear();
        self.packet_size = 0;
        self.needs_full_padding = false;
    }

    // ========================================================================
    // Flusher scope
    // ========================================================================

    /// Mark the start of a batch of write operations.
    pub fn attach_packet_flusher(&mut self) {
        self.flusher_attached = true;
        if self.write_start_packet_number.is_none() {
            self.write_start_packet_number = Some(self.next_sending_packet_number());
        }
    }

    /// Close the batch: flush the open packet and drain pending padding.
    pub fn flush(&mut self) {
        self.flush_current_packet();
        self.send_remaining_pending_padding();
        self.flusher_attached = false;
        if let Some(start) = self.write_start_packet_number.take() {
            trace!(
                packets_written = self.next_sending_packet_number() - start,
                "write batch finished"
            );
        }
    }

    /// Emit padding-only packets while padding is owed and the delegate
    /// permits.
    fn send_remaining_pending_padding(&mut self) {
        while self.pending_padding_bytes > 0
            && !self.has_pending_frames()
            && self.delegate.should_generate_packet(false, false)
        {
            self.flush_current_packet();
        }
    }
}

// ============================================================================
// Scoped guards
// ============================================================================

/// RAII batch scope: attaches the flusher on construction and flushes on
/// release. Write operations that may emit packets expect one to be active.
pub struct ScopedPacketFlusher<'a, D: AssemblerDelegate + StreamDataProducer> {
    assembler: &'a mut PacketAssembler<D>,
}

impl<'a, D: AssemblerDelegate + StreamDataProducer> ScopedPacketFlusher<'a, D> {
    pub fn new(assembler: &'a mut PacketAssembler<D>) -> Self {
        assembler.attach_packet_flusher();
        Self { assembler }
    }
}

impl<D: AssemblerDelegate + StreamDataProducer> core::ops::Deref for ScopedPacketFlusher<'_, D> {
    type Target = PacketAssembler<D>;

    fn deref(&self) -> &Self::Target {
        self.assembler
    }
}

impl<D: AssemblerDelegate + StreamDataProducer> core::ops::DerefMut for ScopedPacketFlusher<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.assembler
    }
}

impl<D: AssemblerDelegate + StreamDataProducer> Drop for ScopedPacketFlusher<'_, D> {
    fn drop(&mut self) {
        self.assembler.flush();
    }
}

/// Temporarily redirect packets to another peer address; flushes on both
/// edges when the address actually changes, restores on release.
pub struct ScopedPeerAddressContext<'a, D: AssemblerDelegate + StreamDataProducer> {
    assembler: &'a mut PacketAssembler<D>,
    old_peer_address: Option<SocketAddr>,
}

impl<'a, D: AssemblerDelegate + StreamDataProducer> ScopedPeerAddressContext<'a, D> {
    pub fn new(assembler: &'a mut PacketAssembler<D>, address: SocketAddr) -> Self {
        let old_peer_address = assembler.packet.peer_address;
        debug_assert!(
            old_peer_address.is_some(),
            "peer address context used before the peer address is initialized"
        );
        assembler.set_default_peer_address(address);
        Self {
            assembler,
            old_peer_address,
        }
    }
}

impl<D: AssemblerDelegate + StreamDataProducer> core::ops::Deref
    for ScopedPeerAddressContext<'_, D>
{
    type Target = PacketAssembler<D>;

    fn deref(&self) -> &Self::Target {
        self.assembler
    }
}

impl<D: AssemblerDelegate + StreamDataProducer> core::ops::DerefMut
    for ScopedPeerAddressContext<'_, D>
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.assembler
    }
}

impl<D: AssemblerDelegate + StreamDataProducer> Drop for ScopedPeerAddressContext<'_, D> {
    fn drop(&mut self) {
        if let Some(old) = self.old_peer_address {
            self.assembler.set_default_peer_address(old);
        }
    }
}
