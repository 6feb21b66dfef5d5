use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::session::SessionConfig;

/// Top-level configuration settings for the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub broker: BrokerSettings,
    pub store: StoreSettings,
    pub log: LogSettings,
}

/// Listening addresses, TLS material and what the HTTP API tells about
/// the server.
///
/// Without both PEM files the device listener speaks plain TCP, which is
/// only meant for development. Without both stats credentials `/stats` is
/// open.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub addr: String,
    pub http_addr: String,
    pub cert_pem_file: Option<PathBuf>,
    pub key_pem_file: Option<PathBuf>,
    pub delivery_domain: String,
    pub stats_user: Option<String>,
    pub stats_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub exchange_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrokerSettings {
    pub session_queue_size: usize,
    pub broker_queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Directory of the sled database.
    pub path: String,
    pub max_messages_per_channel: Option<usize>,
    pub max_notifications_per_app: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let session = SessionConfig::default();
        let broker = BrokerConfig::default();
        Self {
            server: ServerSettings {
                addr: "127.0.0.1:9090".to_string(),
                http_addr: "127.0.0.1:8080".to_string(),
                cert_pem_file: None,
                key_pem_file: None,
                delivery_domain: String::new(),
                stats_user: None,
                stats_password: None,
            },
            session: SessionSettings {
                ping_interval: session.ping_interval,
                exchange_timeout: session.exchange_timeout,
            },
            broker: BrokerSettings {
                session_queue_size: broker.session_queue_size,
                broker_queue_size: broker.broker_queue_size,
            },
            store: StoreSettings {
                backend: StoreBackend::Memory,
                path: "pushd_db".to_string(),
                max_messages_per_channel: None,
                max_notifications_per_app: 64,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl From<SessionSettings> for SessionConfig {
    fn from(s: SessionSettings) -> Self {
        SessionConfig {
            ping_interval: s.ping_interval,
            exchange_timeout: s.exchange_timeout,
        }
    }
}

impl From<BrokerSettings> for BrokerConfig {
    fn from(b: BrokerSettings) -> Self {
        BrokerConfig {
            session_queue_size: b.session_queue_size,
            broker_queue_size: b.broker_queue_size,
        }
    }
}

/// Settings as loaded from files or environment; missing values are
/// filled from [`Settings::default`].
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub session: Option<PartialSessionSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub store: Option<PartialStoreSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub addr: Option<String>,
    pub http_addr: Option<String>,
    pub cert_pem_file: Option<PathBuf>,
    pub key_pem_file: Option<PathBuf>,
    pub delivery_domain: Option<String>,
    pub stats_user: Option<String>,
    pub stats_password: Option<String>,
}

/// Durations are humantime strings, e.g. `10s` or `1m 30s`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSessionSettings {
    pub ping_interval: Option<String>,
    pub exchange_timeout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub session_queue_size: Option<usize>,
    pub broker_queue_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialStoreSettings {
    pub backend: Option<StoreBackend>,
    pub path: Option<String>,
    pub max_messages_per_channel: Option<usize>,
    pub max_notifications_per_app: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}
