//! Protocol messages
//!
//! Every message is a JSON object tagged by its `"T"` field. Field names
//! follow the capitalised wire names devices already speak (`DeviceId`,
//! `TopLevel`, ...), hence the explicit `rename`s.
//!
//! Outgoing messages the server may need to cut into several frames
//! implement [`SplittableMsg`]; fire-and-forget ones additionally implement
//! [`OnewayMsg`].

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use serde_json::value::RawValue;

/// Hex id of the system channel (shortened form of the nil UUID).
pub const SYSTEM_CHANNEL_ID: &str = "0";

/// Payload budget for a single BROADCAST frame; leaves room for the
/// envelope under the 16 bit frame length.
pub const MAX_PAYLOAD_SIZE: usize = 62 * 1024;

/// A raw JSON notification payload, forwarded verbatim.
pub type Payload = Box<RawValue>;

/// Messages that may require, and are capable of, splitting.
pub trait SplittableMsg {
    /// Narrows the message to its next window. Returns `true` once the
    /// window just produced is the last one.
    fn split(&mut self) -> bool;
}

/// Messages that are not followed by a response.
pub trait OnewayMsg: SplittableMsg {
    /// Whether the session keeps running after sending the message.
    fn oneway_continue(&self) -> bool;
}

/// CONNECT message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectMsg {
    #[serde(rename = "T", default)]
    pub kind: String,
    #[serde(rename = "ClientVer", default)]
    pub client_ver: String,
    #[serde(rename = "DeviceId", default)]
    pub device_id: String,
    #[serde(rename = "Authorization", default)]
    pub authorization: String,
    /// Platform details etc.
    #[serde(rename = "Info", default, skip_serializing_if = "HashMap::is_empty")]
    pub info: HashMap<String, Value>,
    /// Hex encoded channel ids to the levels known by the client.
    #[serde(rename = "Levels", default, deserialize_with = "null_as_default")]
    pub levels: HashMap<String, i64>,
}

impl ConnectMsg {
    pub fn new(device_id: impl Into<String>, levels: HashMap<String, i64>) -> Self {
        Self {
            kind: "connect".to_string(),
            device_id: device_id.into(),
            levels,
            ..Self::default()
        }
    }
}

/// CONNACK message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnAckMsg {
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(rename = "Params")]
    pub params: ConnAckParams,
}

/// Connection parameters sent by the server on connection acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnAckParams {
    /// Ping interval formatted as a duration string, e.g. `"10s"`.
    #[serde(rename = "PingInterval")]
    pub ping_interval: String,
}

impl ConnAckMsg {
    pub fn new(ping_interval: std::time::Duration) -> Self {
        Self {
            kind: "connack".to_string(),
            params: ConnAckParams {
                ping_interval: format_duration(ping_interval),
            },
        }
    }
}

/// Formats a duration the compact way clients parse it (`1m30s`, `500ms`).
pub fn format_duration(d: std::time::Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    humantime::format_duration(d).to_string().replace(' ', "")
}

/// PING/PONG messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPongMsg {
    #[serde(rename = "T", default)]
    pub kind: String,
}

impl PingPongMsg {
    pub fn ping() -> Self {
        Self {
            kind: "ping".to_string(),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: "pong".to_string(),
        }
    }
}

/// ACKnowledgement message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckMsg {
    #[serde(rename = "T", default)]
    pub kind: String,
}

impl AckMsg {
    pub fn ack() -> Self {
        Self {
            kind: "ack".to_string(),
        }
    }
}

/// CONNBROKEN message: the server is breaking the connection for `reason`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnBrokenMsg {
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(rename = "Reason")]
    pub reason: String,
}

pub const BROKEN_HOST_MISMATCH: &str = "host-mismatch";

impl ConnBrokenMsg {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            kind: "connbroken".to_string(),
            reason: reason.into(),
        }
    }
}

impl SplittableMsg for ConnBrokenMsg {
    fn split(&mut self) -> bool {
        true
    }
}

impl OnewayMsg for ConnBrokenMsg {
    fn oneway_continue(&self) -> bool {
        false
    }
}

/// CONNWARN message: the server warns about partial functionality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnWarnMsg {
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(rename = "Reason")]
    pub reason: String,
}

pub const WARN_UNAUTHORIZED: &str = "unauthorized";

impl ConnWarnMsg {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            kind: "connwarn".to_string(),
            reason: reason.into(),
        }
    }
}

impl SplittableMsg for ConnWarnMsg {
    fn split(&mut self) -> bool {
        true
    }
}

impl OnewayMsg for ConnWarnMsg {
    fn oneway_continue(&self) -> bool {
        true
    }
}

/// BROADCAST message.
///
/// `payloads` always holds the window about to be sent; while splitting,
/// the not yet sent tail waits in `pending`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastMsg {
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(rename = "AppId", default, skip_serializing_if = "String::is_empty")]
    pub app_id: String,
    #[serde(rename = "ChanId")]
    pub chan_id: String,
    #[serde(rename = "TopLevel")]
    pub top_level: i64,
    #[serde(
        rename = "Payloads",
        default,
        serialize_with = "empty_as_null",
        deserialize_with = "null_as_default"
    )]
    pub payloads: Vec<Payload>,
    #[serde(skip)]
    pending: Vec<Payload>,
    #[serde(skip)]
    splitting: bool,
}

impl BroadcastMsg {
    pub fn new(chan_id: impl Into<String>, top_level: i64, payloads: Vec<Payload>) -> Self {
        Self {
            kind: "broadcast".to_string(),
            chan_id: chan_id.into(),
            top_level,
            payloads,
            ..Self::default()
        }
    }

    /// Resets the splitting state so the message storage can be reused.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.splitting = false;
    }

    pub fn is_splitting(&self) -> bool {
        self.splitting
    }
}

impl SplittableMsg for BroadcastMsg {
    fn split(&mut self) -> bool {
        let prev_top = if self.splitting {
            let prev_top = self.top_level;
            self.payloads = std::mem::take(&mut self.pending);
            self.top_level = prev_top + self.payloads.len() as i64;
            prev_top
        } else {
            self.top_level - self.payloads.len() as i64
        };
        let mut size = 0;
        for (i, payload) in self.payloads.iter().enumerate() {
            size += payload.get().len();
            // a window always carries at least one payload
            if size > MAX_PAYLOAD_SIZE && i > 0 {
                self.pending = self.payloads.split_off(i);
                self.top_level = prev_top + i as i64;
                self.splitting = true;
                return false;
            }
        }
        self.splitting = false;
        true
    }
}

/// A single unicast notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "A")]
    pub app_id: String,
    #[serde(rename = "M")]
    pub msg_id: String,
    #[serde(rename = "P")]
    pub payload: Payload,
}

impl PartialEq for Notification {
    fn eq(&self, other: &Self) -> bool {
        self.app_id == other.app_id
            && self.msg_id == other.msg_id
            && self.payload.get() == other.payload.get()
    }
}

/// Extracts the payloads of the notifications.
pub fn extract_payloads(notifications: &[Notification]) -> Vec<Payload> {
    notifications.iter().map(|n| n.payload.clone()).collect()
}

/// NOTIFICATIONS message.
///
/// Like [`BroadcastMsg`], `notifications` holds the window about to be sent
/// and the rest waits in `pending` while splitting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsMsg {
    #[serde(rename = "T")]
    pub kind: String,
    #[serde(
        rename = "Notifications",
        default,
        serialize_with = "empty_as_null",
        deserialize_with = "null_as_default"
    )]
    pub notifications: Vec<Notification>,
    #[serde(skip)]
    pending: Vec<Notification>,
    #[serde(skip)]
    splitting: bool,
}

impl NotificationsMsg {
    pub fn new(notifications: Vec<Notification>) -> Self {
        Self {
            kind: "notifications".to_string(),
            notifications,
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        self.notifications.clear();
        self.pending.clear();
        self.splitting = false;
    }

    pub fn is_splitting(&self) -> bool {
        self.splitting
    }
}

impl Notification {
    /// Approximate encoded size, `{"A":..,"M":..,"P":..},` included.
    fn wire_size(&self) -> usize {
        self.app_id.len() + self.msg_id.len() + self.payload.get().len() + 20
    }
}

impl SplittableMsg for NotificationsMsg {
    fn split(&mut self) -> bool {
        if self.splitting {
            self.notifications = std::mem::take(&mut self.pending);
        }
        let mut size = 0;
        for (i, notification) in self.notifications.iter().enumerate() {
            size += notification.wire_size();
            if size > MAX_PAYLOAD_SIZE && i > 0 {
                self.pending = self.notifications.split_off(i);
                self.splitting = true;
                return false;
            }
        }
        self.splitting = false;
        true
    }
}

/// Envelope used to peek at the type of an incoming message.
#[derive(Debug, Deserialize)]
pub struct TypeOnly {
    #[serde(rename = "T", default)]
    pub kind: String,
}

fn empty_as_null<S, T>(items: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    if items.is_empty() {
        serializer.serialize_none()
    } else {
        serializer.collect_seq(items)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
