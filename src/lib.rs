//! # pushd
//!
//! `pushd` is a push notification server. Devices keep a long-lived TLS
//! connection open; applications send notifications through a small HTTP
//! API. Broadcast channels are delivered to every connected device that is
//! behind, unicast notifications to the one device they address.
//!
//! ## Core Modules
//!
//! - `protocol`: the device wire protocol, framing and messages.
//! - `persistence`: stores of pending notifications per channel.
//! - `broker`: the registry of live sessions and the delivery dispatch.
//! - `session`: the state machine running each device connection.
//! - `transport`: the device listener and the HTTP API.
//! - `client`: the device end of the protocol.
//! - `config`: settings loading.
//! - `utils`: process-wide error type and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;
