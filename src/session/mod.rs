//! The `session` module handles the long-lived connections from devices.
//!
//! [`run_session`] reads the wire format version and the CONNECT, registers
//! with the broker, then alternates between keepalive pings and the
//! exchanges the broker queues for the session, until something fails.

pub mod session;
pub mod tracker;

use std::time::Duration;

use crate::broker::BrokerError;
use crate::protocol::ProtocolError;

pub use session::run_session;
pub use tracker::SessionTracker;

/// Timing parameters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Pings are emitted each ping interval.
    pub ping_interval: Duration,
    /// Sending and waiting for the response must not take longer.
    pub exchange_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("unexpected wire format version {0}")]
    UnexpectedWireVersion(u8),
}
