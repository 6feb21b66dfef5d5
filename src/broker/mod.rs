//! The `broker` module registers device sessions and hands them deliveries.
//!
//! - `engine`: [`SimpleBroker`], a single owning task holding the registry
//!   of live sessions and dispatching deliveries to them.
//! - `session`: [`BrokerSession`], the broker side state of one session.
//! - `exchanges`: the [`Exchange`] implementations a session performs.
//! - `stats`: [`Statistics`] on devices online and deliveries requested.
//!
//! Sessions only ever see the broker through the [`Broker`] trait; the HTTP
//! API only through [`BrokerSending`].

pub mod engine;
pub mod exchanges;
pub mod session;
pub mod stats;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::persistence::{InternalChannelId, StoreError};
use crate::protocol::ConnectMsg;

pub use engine::SimpleBroker;
pub use exchanges::{
    BroadcastExchange, ConnMeta, ConnMetaExchange, UnicastExchange, filter_by_level,
};
pub use session::{BrokerSession, Delivery, ExchangeScratchArea};
pub use stats::{StatsReport, Statistics, Tally};

/// Channel levels known for a session.
pub type LevelsMap = HashMap<InternalChannelId, i64>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The session must end; the reason is meant for logs.
    #[error("session aborted ({0})")]
    Abort(String),
    #[error("broker is not running")]
    Stopped,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl BrokerError {
    pub fn abort(reason: impl Into<String>) -> Self {
        BrokerError::Abort(reason.into())
    }
}

/// Registration facet of the broker, used by sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Registers a session for the device in `connect`, feeding it what is
    /// pending for the device.
    async fn register(&self, connect: &ConnectMsg) -> Result<BrokerSession, BrokerError>;

    /// Unregisters the session. Does not wait for the removal.
    async fn unregister(&self, sess: &BrokerSession);
}

/// Notification sending facet of the broker.
#[async_trait]
pub trait BrokerSending: Send + Sync {
    /// Requests delivery of the current state of a broadcast channel.
    async fn broadcast(&self, chan_id: InternalChannelId);

    /// Requests delivery over unicast channels.
    async fn unicast(&self, chan_ids: &[InternalChannelId]);
}

/// What a session should do for an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Nothing to send.
    Nop,
    /// Send the scratch area BROADCAST, expect an ACK.
    Broadcast,
    /// Send the scratch area NOTIFICATIONS, expect an ACK.
    Notifications,
    /// Send a message without reading any reply.
    Oneway(ConnMeta),
}

/// Leads a session through one protocol interaction, typically a delivery.
///
/// The same exchange may be handed to many sessions, so per session state
/// goes into the session's [`ExchangeScratchArea`].
pub trait Exchange: Send + Sync + fmt::Debug {
    fn prepare(&self, sess: &mut BrokerSession) -> Result<Outgoing, BrokerError>;

    /// Checks the reply to the window just sent; `done` is set for the last one.
    fn acked(&self, sess: &mut BrokerSession, done: bool) -> Result<(), BrokerError>;
}

/// Size of the broker queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    pub session_queue_size: usize,
    pub broker_queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_queue_size: 10,
            broker_queue_size: 10000,
        }
    }
}

/// Gets a string out of the CONNECT `Info` map.
pub fn get_info_string(
    connect: &ConnectMsg,
    name: &str,
    default: &str,
) -> Result<String, BrokerError> {
    match connect.info.get(name) {
        None => Ok(default.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(BrokerError::abort("unexpected value in message")),
    }
}
