//! # quicseal: outgoing QUIC packet assembly
//!
//! The send-path core of a QUIC stack: it accepts stream data, crypto data,
//! control frames, ACKs and datagrams from a session layer and transforms
//! them into encrypted wire-format packets obeying MTU, encryption-level,
//! header-protection and coalescing constraints (RFC 8999, RFC 9000,
//! RFC 9001, RFC 9221).
//!
//! ## Architecture Overview
//!
//! ```text
//! quicseal/
//! ├── types     - VarInt codec, connection IDs, send-path constants
//! ├── version   - version predicates (tag size, header shape, frames)
//! ├── error     - codec errors and the unrecoverable-error taxonomy
//! ├── crypto    - sealing (AEAD + header protection) and randomness traits
//! ├── config    - construction-time toggles
//! ├── frames    - queued frame types, sizing and wire encoding
//! ├── packet    - outgoing headers and packet number encoding
//! └── assembly  - the assembler, serializer, coalescer and delegates
//! ```
//!
//! ## Design Principles
//!
//! 1. **Pure state machine**: no sockets, no timers. The session calls in;
//!    finished packets flow out through the delegate.
//! 2. **Budget before bytes**: every frame is fit-tested against the
//!    remaining plaintext budget (including the expansion of the previous
//!    frame's length field) before it is committed.
//! 3. **No partial packets**: a failed serialization clears the queued
//!    frames and reports exactly one unrecoverable error.
//! 4. **Pluggable crypto**: record protection and randomness are traits;
//!    tests inject deterministic doubles.
//!
//! ## Usage sketch
//!
//! ```rust,ignore
//! use quicseal::assembly::{PacketAssembler, ScopedPacketFlusher, StreamSendingState};
//!
//! let mut assembler = PacketAssembler::new(cid, version, side, sealer, rng, config, session);
//! {
//!     let mut flusher = ScopedPacketFlusher::new(&mut assembler);
//!     flusher.consume_data(stream_id, len, offset, StreamSendingState::Fin);
//! } // open packet flushed, pending padding drained
//! ```

#![forbid(unsafe_code)]

pub mod assembly;
pub mod config;
pub mod crypto;
pub mod error;
pub mod frames;
pub mod packet;
pub mod types;
pub mod version;

pub use assembly::{
    AssemblerDelegate, CoalescedPacket, ConsumedData, MessageStatus, PacketAssembler,
    ScopedPacketFlusher, SerializedPacket, SerializedPacketFate, StreamDataProducer,
    StreamSendingState, TransmissionType,
};
pub use config::AssemblyConfig;
pub use crypto::{EncryptionLevel, OsRandom, PacketSealer, RandomSource};
pub use error::{CodecError, UnrecoverableError};
pub use frames::QueuedFrame;
pub use packet::{PacketHeader, PacketNumberLength};
pub use types::{ConnectionId, PacketNumber, Side, StreamId, VarIntCodec};
pub use version::Version;
