//! Wire protocol for the relay
//!
//! # Stream layout
//!
//! Every connection speaks the same byte stream regardless of transport
//! (the WebSocket backend unwraps its frames before this layer sees them):
//!
//! ```text
//! HELLO (15 bytes) --> OK (6 bytes) | ERROR (variable)
//! then zero or more framed packets in either direction:
//! ┌─────────────────┬──────────────────────────┐
//! │ Header (8 bytes)│ Payload (header.length)  │
//! └─────────────────┴──────────────────────────┘
//! ```
//!
//! All multibyte integers are big-endian on the wire irrespective of host
//! byte order.

pub mod handshake;
pub mod packets;

pub use handshake::{HandshakeResult, PROTOCOL_VERSION};
pub use packets::{
    AudioChunkPacket, InputEventPacket, PacketHeader, PacketType, VideoFramePacket,
};
