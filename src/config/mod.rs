//! The `config` module loads the server settings.
//!
//! Sources, later ones winning: built-in defaults, an optional
//! `config/default.{toml,json,yaml,...}` file, and `PUSHD_` prefixed
//! environment variables using `__` between sections and keys
//! (`PUSHD_SESSION__PING_INTERVAL=30s`).

mod settings;

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, LogSettings, ServerSettings, SessionSettings, Settings, StoreBackend,
    StoreSettings,
};

pub const DEFAULT_CONFIG_FILE: &str = "config/default";
pub const ENV_PREFIX: &str = "PUSHD";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Loads the configuration from `file` (extension optional, the file may be
/// missing) and environment variables, merged over the defaults.
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    merge(partial)
}

fn parse_duration(key: &str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => humantime::parse_duration(v.trim())
            .map_err(|e| ConfigError::Message(format!("{key}: {e}"))),
    }
}

fn merge(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let default = Settings::default();
    let server = partial.server.unwrap_or_default();
    let session = partial.session.unwrap_or_default();
    let broker = partial.broker.unwrap_or_default();
    let store = partial.store.unwrap_or_default();
    let log = partial.log.unwrap_or_default();

    let settings = Settings {
        server: ServerSettings {
            addr: server.addr.unwrap_or(default.server.addr),
            http_addr: server.http_addr.unwrap_or(default.server.http_addr),
            cert_pem_file: server.cert_pem_file.or(default.server.cert_pem_file),
            key_pem_file: server.key_pem_file.or(default.server.key_pem_file),
            delivery_domain: server.delivery_domain.unwrap_or(default.server.delivery_domain),
            stats_user: server.stats_user.or(default.server.stats_user),
            stats_password: server.stats_password.or(default.server.stats_password),
        },
        session: SessionSettings {
            ping_interval: parse_duration(
                "session.ping_interval",
                session.ping_interval,
                default.session.ping_interval,
            )?,
            exchange_timeout: parse_duration(
                "session.exchange_timeout",
                session.exchange_timeout,
                default.session.exchange_timeout,
            )?,
        },
        broker: BrokerSettings {
            session_queue_size: broker
                .session_queue_size
                .unwrap_or(default.broker.session_queue_size),
            broker_queue_size: broker
                .broker_queue_size
                .unwrap_or(default.broker.broker_queue_size),
        },
        store: StoreSettings {
            backend: store.backend.unwrap_or(default.store.backend),
            path: store.path.unwrap_or(default.store.path),
            max_messages_per_channel: store
                .max_messages_per_channel
                .or(default.store.max_messages_per_channel),
            max_notifications_per_app: store
                .max_notifications_per_app
                .unwrap_or(default.store.max_notifications_per_app),
        },
        log: LogSettings {
            level: log.level.unwrap_or(default.log.level),
        },
    };
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.session.ping_interval.is_zero() || settings.session.exchange_timeout.is_zero() {
        return Err(ConfigError::Message(
            "session intervals must be positive".to_string(),
        ));
    }
    if settings.broker.session_queue_size == 0 || settings.broker.broker_queue_size == 0 {
        return Err(ConfigError::Message(
            "broker queue sizes must be positive".to_string(),
        ));
    }
    if settings.server.cert_pem_file.is_some() != settings.server.key_pem_file.is_some() {
        return Err(ConfigError::Message(
            "server.cert_pem_file and server.key_pem_file go together".to_string(),
        ));
    }
    if settings.server.stats_user.is_some() != settings.server.stats_password.is_some() {
        return Err(ConfigError::Message(
            "server.stats_user and server.stats_password go together".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
