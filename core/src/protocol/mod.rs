//! Wire protocol: message types and the framing codec.
//!
//! The delivery connection carries length-prefixed JSON messages, each
//! discriminated by a `"T"` type field. `messages` defines the typed
//! envelopes for both directions, `wire` frames them over a stream
//! connection with absolute deadlines.

pub mod messages;
pub mod wire;

pub use messages::{
    parse_duration, ClientMessage, ConnAckParams, Notification, ServerMessage,
    BROKEN_HOST_MISMATCH, SYSTEM_CHANNEL_ID,
};
pub use wire::{
    read_wire_format_version, FramedProtocol, NetStream, Protocol, WireError,
    PROTOCOL_WIRE_VERSION,
};
