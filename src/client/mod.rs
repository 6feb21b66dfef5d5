//! The `client` module is the device end of the protocol.
//!
//! [`DeviceClient`] is what the `pushd client` subcommand runs; tests use it
//! to drive a server end to end.

pub mod device_client;

use crate::protocol::ProtocolError;

pub use device_client::{ClientEvent, DeviceClient};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected message {0:?}")]
    Unexpected(String),
    #[error("connection broken by server ({0})")]
    Broken(String),
}

#[cfg(test)]
mod tests;
