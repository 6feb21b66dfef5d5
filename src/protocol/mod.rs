//! The `protocol` module speaks the device <-> server wire protocol.
//!
//! - `codec`: the version byte and the length-prefixed JSON framing.
//! - `messages`: the typed messages exchanged over the codec, including the
//!   splitting of oversized BROADCASTs.

pub mod codec;
pub mod messages;

pub use codec::{
    MAX_FRAME_SIZE, PROTOCOL_WIRE_VERSION, Protocol, ProtocolError, read_wire_format_version,
    write_wire_format_version,
};
pub use messages::{
    AckMsg, BroadcastMsg, ConnAckMsg, ConnBrokenMsg, ConnWarnMsg, ConnectMsg, MAX_PAYLOAD_SIZE,
    Notification, NotificationsMsg, OnewayMsg, Payload, PingPongMsg, SYSTEM_CHANNEL_ID,
    SplittableMsg, TypeOnly,
};

#[cfg(test)]
mod tests;
