//! # Queued frame types (RFC 9000 Section 19)
//!
//! Frames waiting in the packet under construction. Unlike parse-side
//! frames, queued frames own their payload bytes: they outlive the caller
//! that submitted them and are handed back to the session on emit for loss
//! tracking.
//!
//! ## Frame classification
//! - **Retransmittable**: owned by the session, reported back on emit so
//!   lost copies can be resent.
//! - **Ephemeral**: regenerated per packet (PADDING, ACK, STOP_WAITING,
//!   MTU discovery, path probes).

#![forbid(unsafe_code)]

use bytes::Bytes;
use tinyvec::TinyVec;

use crate::crypto::EncryptionLevel;
use crate::types::{ConnectionId, PacketNumber, StreamId, StreamOffset};
use crate::version::Version;

/// ACK Range: a gap followed by a run of acknowledged packet numbers
/// (RFC 9000 Section 19.3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u64,
    pub length: u64,
}

/// ACK frame (RFC 9000 Section 19.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number being acknowledged.
    pub largest_acked: PacketNumber,

    /// Ack delay in ack-delay units (already shifted by the exponent).
    pub ack_delay: u64,

    /// Packets acknowledged immediately below `largest_acked`.
    pub first_range: u64,

    /// Further (gap, length) pairs below the first range.
    pub ranges: TinyVec<[AckRange; 8]>,
}

/// STOP_WAITING frame (pre-IETF). Tracked for completeness of the packet
/// flags; neither carried version emits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopWaitingFrame {
    pub least_unacked: PacketNumber,
}

/// ACK_FREQUENCY frame (draft-ietf-quic-ack-frequency).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrequencyFrame {
    pub control_frame_id: u64,
    pub sequence_number: u64,
    pub packet_tolerance: u64,
    pub max_ack_delay_us: u64,
    pub reordering_threshold: u64,
}

/// STREAM frame (RFC 9000 Section 19.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: StreamOffset,
    pub data: Bytes,
    pub fin: bool,
}

/// CRYPTO frame (RFC 9000 Section 19.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub level: EncryptionLevel,
    pub offset: StreamOffset,
    pub data: Bytes,
}

/// DATAGRAM frame (RFC 9221). `message_id` is local bookkeeping and does
/// not appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub message_id: u64,
    pub data: Bytes,
}

/// PADDING frame. `num_padding_bytes == -1` means "fill the packet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingFrame {
    pub num_padding_bytes: i32,
}

/// PING frame (RFC 9000 Section 19.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub control_frame_id: u64,
}

/// PATH_CHALLENGE frame (RFC 9000 Section 19.17).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathChallengeFrame {
    pub control_frame_id: u64,
    pub payload: [u8; 8],
}

/// PATH_RESPONSE frame (RFC 9000 Section 19.18).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathResponseFrame {
    pub control_frame_id: u64,
    pub payload: [u8; 8],
}

/// RESET_STREAM frame (RFC 9000 Section 19.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub control_frame_id: u64,
    pub stream_id: StreamId,
    pub error_code: u64,
    pub final_size: u64,
}

/// STOP_SENDING frame (RFC 9000 Section 19.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub control_frame_id: u64,
    pub stream_id: StreamId,
    pub error_code: u64,
}

/// MAX_DATA frame (RFC 9000 Section 19.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub control_frame_id: u64,
    pub maximum_data: u64,
}

/// MAX_STREAM_DATA frame (RFC 9000 Section 19.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub control_frame_id: u64,
    pub stream_id: StreamId,
    pub maximum_stream_data: u64,
}

/// DATA_BLOCKED frame (RFC 9000 Section 19.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub control_frame_id: u64,
    pub data_limit: u64,
}

/// STREAM_DATA_BLOCKED frame (RFC 9000 Section 19.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub control_frame_id: u64,
    pub stream_id: StreamId,
    pub stream_data_limit: u64,
}

/// NEW_CONNECTION_ID frame (RFC 9000 Section 19.15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub control_frame_id: u64,
    pub sequence_number: u64,
    pub retire_prior_to: u64,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

/// RETIRE_CONNECTION_ID frame (RFC 9000 Section 19.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConnectionIdFrame {
    pub control_frame_id: u64,
    pub sequence_number: u64,
}

/// CONNECTION_CLOSE frame (RFC 9000 Section 19.19).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u64,
    /// Frame type that triggered the close; transport closes only.
    pub frame_type: Option<u64>,
    pub reason: Bytes,
    pub application_close: bool,
}

/// HANDSHAKE_DONE frame (RFC 9000 Section 19.20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeDoneFrame {
    pub control_frame_id: u64,
}

/// Unified queued frame type: one arm per wire-frame kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedFrame {
    Padding(PaddingFrame),
    Ping(PingFrame),
    Ack(AckFrame),
    StopWaiting(StopWaitingFrame),
    AckFrequency(AckFrequencyFrame),
    Stream(StreamFrame),
    Crypto(CryptoFrame),
    Message(MessageFrame),
    /// Probe frame used to test a larger path MTU; serializes as a PING.
    MtuDiscovery,
    PathChallenge(PathChallengeFrame),
    PathResponse(PathResponseFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone(HandshakeDoneFrame),
}

impl QueuedFrame {
    /// Whether loss of this frame requires the session to resend it.
    ///
    /// PADDING, ACK, STOP_WAITING, MTU discovery and path probes are
    /// regenerated per packet and never retransmitted as-is.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            QueuedFrame::Padding(_)
                | QueuedFrame::Ack(_)
                | QueuedFrame::StopWaiting(_)
                | QueuedFrame::MtuDiscovery
                | QueuedFrame::PathChallenge(_)
                | QueuedFrame::PathResponse(_)
        )
    }

    /// Whether this frame carries crypto handshake data in `version`.
    pub fn is_handshake(&self, version: &Version) -> bool {
        match self {
            QueuedFrame::Crypto(_) => true,
            QueuedFrame::Stream(frame) => version.is_crypto_stream_id(frame.stream_id),
            _ => false,
        }
    }

    /// Whether this is a control frame carrying a control-frame ID.
    pub fn is_control_frame(&self) -> bool {
        self.control_frame_id().is_some()
    }

    /// Control-frame ID for retransmittable control frames.
    pub fn control_frame_id(&self) -> Option<u64> {
        match self {
            QueuedFrame::Ping(f) => Some(f.control_frame_id),
            QueuedFrame::AckFrequency(f) => Some(f.control_frame_id),
            QueuedFrame::ResetStream(f) => Some(f.control_frame_id),
            QueuedFrame::StopSending(f) => Some(f.control_frame_id),
            QueuedFrame::MaxData(f) => Some(f.control_frame_id),
            QueuedFrame::MaxStreamData(f) => Some(f.control_frame_id),
            QueuedFrame::DataBlocked(f) => Some(f.control_frame_id),
            QueuedFrame::StreamDataBlocked(f) => Some(f.control_frame_id),
            QueuedFrame::NewConnectionId(f) => Some(f.control_frame_id),
            QueuedFrame::RetireConnectionId(f) => Some(f.control_frame_id),
            QueuedFrame::HandshakeDone(f) => Some(f.control_frame_id),
            _ => None,
        }
    }

    /// Stream ID for frames scoped to a stream.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            QueuedFrame::Stream(f) => Some(f.stream_id),
            QueuedFrame::ResetStream(f) => Some(f.stream_id),
            QueuedFrame::StopSending(f) => Some(f.stream_id),
            QueuedFrame::MaxStreamData(f) => Some(f.stream_id),
            QueuedFrame::StreamDataBlocked(f) => Some(f.stream_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_frame(id: u64) -> QueuedFrame {
        QueuedFrame::Stream(StreamFrame {
            stream_id: StreamId::new(id),
            offset: 0,
            data: Bytes::from_static(b"x"),
            fin: false,
        })
    }

    #[test]
    fn test_retransmittable_classification() {
        assert!(stream_frame(4).is_retransmittable());
        assert!(QueuedFrame::Ping(PingFrame { control_frame_id: 1 }).is_retransmittable());
        assert!(QueuedFrame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0,
            frame_type: None,
            reason: Bytes::new(),
            application_close: false,
        })
        .is_retransmittable());

        assert!(!QueuedFrame::Padding(PaddingFrame { num_padding_bytes: 3 }).is_retransmittable());
        assert!(!QueuedFrame::MtuDiscovery.is_retransmittable());
        assert!(!QueuedFrame::PathChallenge(PathChallengeFrame {
            control_frame_id: 0,
            payload: [0; 8],
        })
        .is_retransmittable());
    }

    #[test]
    fn test_handshake_classification() {
        let crypto = QueuedFrame::Crypto(CryptoFrame {
            level: EncryptionLevel::Initial,
            offset: 0,
            data: Bytes::from_static(b"chlo"),
        });
        assert!(crypto.is_handshake(&Version::RFC_V1));

        // Stream 1 is the crypto stream only under Google crypto.
        assert!(stream_frame(1).is_handshake(&Version::Q050));
        assert!(!stream_frame(1).is_handshake(&Version::RFC_V1));
        assert!(!stream_frame(4).is_handshake(&Version::Q050));
    }

    #[test]
    fn test_control_frame_id_accessor() {
        let frame = QueuedFrame::MaxData(MaxDataFrame {
            control_frame_id: 7,
            maximum_data: 1 << 20,
        });
        assert_eq!(frame.control_frame_id(), Some(7));
        assert!(stream_frame(4).control_frame_id().is_none());
    }
}
