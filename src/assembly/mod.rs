//! The outgoing packet assembly subsystem: assembler, serializer,
//! coalescer and the session-facing delegate traits.

pub mod assembler;
pub mod coalescer;
pub mod delegate;
pub mod serialized;


pub use assembler::{
    ConsumedData, MessageStatus, PacketAssembler, ScopedPacketFlusher, ScopedPeerAddressContext,
    StreamSendingState,
};
pub use coalescer::CoalescedPacket;
pub use delegate::{AssemblerDelegate, StreamDataProducer};
pub use serialized::{SerializedPacket, SerializedPacketFate, TransmissionType};
