use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::ClientError;
use crate::protocol::{
    AckMsg, BroadcastMsg, ConnAckMsg, ConnBrokenMsg, ConnWarnMsg, ConnectMsg, Notification,
    NotificationsMsg, PROTOCOL_WIRE_VERSION, Payload, PingPongMsg, Protocol, ProtocolError,
    TypeOnly, write_wire_format_version,
};

/// What the device got from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { ping_interval: Duration },
    Ping,
    Broadcast {
        chan_id: String,
        top_level: i64,
        payloads: Vec<String>,
    },
    Notifications(Vec<Notification>),
    Warned(String),
    Broken(String),
}

/// Device side of the protocol: connects, then answers pings and
/// acknowledges deliveries while tracking channel levels.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    device_id: String,
    levels: HashMap<String, i64>,
    exchange_timeout: Duration,
}

impl DeviceClient {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            levels: HashMap::new(),
            exchange_timeout: Duration::from_secs(5),
        }
    }

    /// Levels to claim in CONNECT, by hex channel id.
    pub fn with_levels(mut self, levels: HashMap<String, i64>) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_exchange_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn levels(&self) -> &HashMap<String, i64> {
        &self.levels
    }

    /// Dials `addr` over plain TCP and runs the client.
    pub async fn dial(
        &mut self,
        addr: &str,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<(), ClientError> {
        let conn = TcpStream::connect(addr).await?;
        conn.set_nodelay(true)?;
        self.run(conn, events).await
    }

    /// Runs the client over `conn` until the connection ends or the event
    /// receiver goes away.
    pub async fn run<S>(
        &mut self,
        mut conn: S,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_wire_format_version(&mut conn, PROTOCOL_WIRE_VERSION, self.exchange_timeout)
            .await?;
        let mut proto = Protocol::new(conn);
        proto.set_deadline(Instant::now() + self.exchange_timeout);
        proto
            .write_message(&ConnectMsg::new(self.device_id.clone(), self.levels.clone()))
            .await?;
        let connack: ConnAckMsg = proto.read_message().await?;
        if connack.kind != "connack" {
            return Err(ClientError::Unexpected(connack.kind));
        }
        let ping_interval = humantime::parse_duration(&connack.params.ping_interval)
            .map_err(|_| ClientError::Unexpected(connack.params.ping_interval.clone()))?;
        info!("{} connected, ping interval {ping_interval:?}", self.device_id);
        if events
            .send(ClientEvent::Connected { ping_interval })
            .await
            .is_err()
        {
            return Ok(());
        }

        loop {
            // the server pings at least this often
            proto.set_deadline(Instant::now() + ping_interval + self.exchange_timeout);
            let frame = proto.read_frame().await?.to_vec();
            let TypeOnly { kind } = decode(&frame)?;
            let event = match kind.as_str() {
                "ping" => {
                    proto.write_message(&PingPongMsg::pong()).await?;
                    ClientEvent::Ping
                }
                "broadcast" => {
                    let bcast: BroadcastMsg = decode(&frame)?;
                    proto.write_message(&AckMsg::ack()).await?;
                    self.levels.insert(bcast.chan_id.clone(), bcast.top_level);
                    ClientEvent::Broadcast {
                        chan_id: bcast.chan_id,
                        top_level: bcast.top_level,
                        payloads: bcast.payloads.iter().map(payload_text).collect(),
                    }
                }
                "notifications" => {
                    let notifs: NotificationsMsg = decode(&frame)?;
                    proto.write_message(&AckMsg::ack()).await?;
                    ClientEvent::Notifications(notifs.notifications)
                }
                "connwarn" => {
                    let warn: ConnWarnMsg = decode(&frame)?;
                    ClientEvent::Warned(warn.reason)
                }
                "connbroken" => {
                    let broken: ConnBrokenMsg = decode(&frame)?;
                    // best effort, the server is closing
                    let _ = events.send(ClientEvent::Broken(broken.reason.clone())).await;
                    return Err(ClientError::Broken(broken.reason));
                }
                _ => return Err(ClientError::Unexpected(kind)),
            };
            debug!("{} got {event:?}", self.device_id);
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(frame).map_err(|e| ClientError::Protocol(ProtocolError::Decode(e)))
}

fn payload_text(payload: &Payload) -> String {
    payload.get().to_string()
}
