//! Error types for the outgoing packet assembly path.

use thiserror::Error;

/// Wire encoding errors from the frame codec and header builder.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Output buffer cannot hold the encoding.
    #[error("buffer too short")]
    BufferTooShort,

    /// A field exceeded its encodable range.
    #[error("value out of range for encoding")]
    ValueOutOfRange,

    /// The frame kind has no encoding in the requested version.
    #[error("frame not encodable in this version")]
    UnsupportedFrame,

    /// Malformed input while parsing back a payload.
    #[error("frame encoding error")]
    FrameEncoding,
}

pub type Result<T> = core::result::Result<T, CodecError>;

/// Failures the assembly core cannot recover from in place.
///
/// Reported once per failure through the session delegate; the core never
/// emits a partial packet alongside one of these.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnrecoverableError {
    /// A ClientHello did not fit in a single packet while
    /// `enforce_single_packet_chlo` was set.
    #[error("client hello won't fit in a single packet")]
    CryptoChloTooLarge,

    /// Stream data was submitted at an encryption level that does not
    /// protect application data.
    #[error("attempt to send unencrypted stream data")]
    AttemptToSendUnencryptedStreamData,

    /// Serialization failed after the packet header was constructed; queued
    /// frames have been dropped.
    #[error("failed to serialize packet")]
    FailedToSerializePacket,

    /// No sealing keys are installed for the current encryption level.
    #[error("missing encryption keys")]
    MissingEncryptionKeys,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            UnrecoverableError::CryptoChloTooLarge.to_string(),
            "client hello won't fit in a single packet"
        );
        assert_eq!(CodecError::BufferTooShort.to_string(), "buffer too short");
    }
}
