use super::*;
use crate::broker::BrokerConfig;
use crate::session::SessionConfig;
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const NO_FILE: &str = "does/not/exist/pushd";

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.addr, "127.0.0.1:9090");
    assert_eq!(settings.server.http_addr, "127.0.0.1:8080");
    assert_eq!(settings.server.cert_pem_file, None);
    assert_eq!(settings.server.delivery_domain, "");
    assert_eq!(settings.server.stats_user, None);
    assert_eq!(settings.session.ping_interval, Duration::from_secs(10));
    assert_eq!(settings.session.exchange_timeout, Duration::from_secs(5));
    assert_eq!(settings.broker.session_queue_size, 10);
    assert_eq!(settings.broker.broker_queue_size, 10000);
    assert_eq!(settings.store.backend, StoreBackend::Memory);
    assert_eq!(settings.store.max_notifications_per_app, 64);
    assert_eq!(settings.log.level, "info");

    assert_eq!(SessionConfig::from(settings.session), SessionConfig::default());
    assert_eq!(BrokerConfig::from(settings.broker), BrokerConfig::default());
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    temp_env::with_vars_unset(["PUSHD_SERVER__ADDR", "PUSHD_SESSION__PING_INTERVAL"], || {
        let settings = load_config_from(NO_FILE).unwrap();
        assert_eq!(settings, Settings::default());
    });
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pushd.toml");
    let toml = r#"
        [server]
        addr = "0.0.0.0:9999"
        cert_pem_file = "/etc/pushd/cert.pem"
        key_pem_file = "/etc/pushd/key.pem"
        delivery_domain = "push.example.com"
        stats_user = "admin"
        stats_password = "secret"

        [session]
        ping_interval = "1m 30s"

        [store]
        backend = "sled"
        path = "/var/lib/pushd"
        max_messages_per_channel = 100
    "#;
    fs::write(&path, toml).unwrap();

    let settings = load_config_from(path.to_str().unwrap()).unwrap();
    assert_eq!(settings.server.addr, "0.0.0.0:9999");
    assert_eq!(settings.server.http_addr, "127.0.0.1:8080");
    assert_eq!(
        settings.server.cert_pem_file,
        Some(PathBuf::from("/etc/pushd/cert.pem"))
    );
    assert_eq!(settings.server.delivery_domain, "push.example.com");
    assert_eq!(settings.server.stats_user.as_deref(), Some("admin"));
    assert_eq!(settings.server.stats_password.as_deref(), Some("secret"));
    assert_eq!(settings.session.ping_interval, Duration::from_secs(90));
    assert_eq!(settings.session.exchange_timeout, Duration::from_secs(5));
    assert_eq!(settings.store.backend, StoreBackend::Sled);
    assert_eq!(settings.store.path, "/var/lib/pushd");
    assert_eq!(settings.store.max_messages_per_channel, Some(100));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("pushd.toml");
    fs::write(&path, "[session]\nping_interval = \"20s\"\n").unwrap();

    temp_env::with_vars(
        [
            ("PUSHD_SESSION__PING_INTERVAL", Some("500ms")),
            ("PUSHD_BROKER__SESSION_QUEUE_SIZE", Some("3")),
            ("PUSHD_LOG__LEVEL", Some("debug")),
        ],
        || {
            let settings = load_config_from(path.to_str().unwrap()).unwrap();
            assert_eq!(settings.session.ping_interval, Duration::from_millis(500));
            assert_eq!(settings.broker.session_queue_size, 3);
            assert_eq!(settings.log.level, "debug");
        },
    );
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    temp_env::with_var("PUSHD_SESSION__EXCHANGE_TIMEOUT", Some("soon"), || {
        let err = load_config_from(NO_FILE).unwrap_err();
        assert!(err.to_string().contains("session.exchange_timeout"));
    });
    temp_env::with_var("PUSHD_BROKER__BROKER_QUEUE_SIZE", Some("0"), || {
        assert!(load_config_from(NO_FILE).is_err());
    });
    temp_env::with_var("PUSHD_SERVER__CERT_PEM_FILE", Some("/tmp/cert.pem"), || {
        assert!(load_config_from(NO_FILE).is_err());
    });
    temp_env::with_var("PUSHD_SERVER__STATS_USER", Some("admin"), || {
        let err = load_config_from(NO_FILE).unwrap_err();
        assert!(err.to_string().contains("stats_password"));
    });
}
