use super::*;
use crate::broker::{BrokerConfig, SimpleBroker};
use crate::persistence::{InMemoryPendingStore, InternalChannelId, PendingStore};
use crate::protocol::{
    AckMsg, ConnAckMsg, ConnBrokenMsg, ConnWarnMsg, ConnectMsg, Notification, NotificationsMsg,
    PingPongMsg, Protocol, read_wire_format_version,
};
use crate::session::{SessionConfig, SessionTracker, run_session};
use chrono::Utc;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;
use tokio::time::Instant;

async fn recv(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("client still running")
}

/// Server end: reads the version byte and CONNECT, replies CONNACK.
async fn fake_server_accept(mut conn: DuplexStream) -> (Protocol<DuplexStream>, ConnectMsg) {
    let version = read_wire_format_version(&mut conn, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(version, 0);
    let mut proto = Protocol::new(conn);
    proto.set_deadline(Instant::now() + Duration::from_secs(2));
    let connect: ConnectMsg = proto.read_message().await.unwrap();
    proto
        .write_message(&ConnAckMsg::new(Duration::from_millis(200)))
        .await
        .unwrap();
    (proto, connect)
}

#[tokio::test]
async fn test_client_against_session() {
    let store = Arc::new(InMemoryPendingStore::new());
    let payload = RawValue::from_string(r#"{"a":1}"#.to_string()).unwrap();
    store
        .append_to_channel(
            &InternalChannelId::system(),
            payload,
            Utc::now() + chrono::Duration::hours(1),
        )
        .unwrap();
    let broker = Arc::new(SimpleBroker::new(store, BrokerConfig::default()));
    broker.start().await;

    let (client_end, server_end) = duplex(64 * 1024);
    let session_broker = broker.clone();
    tokio::spawn(async move {
        let cfg = SessionConfig {
            ping_interval: Duration::from_millis(100),
            exchange_timeout: Duration::from_secs(1),
        };
        let mut track = SessionTracker::new();
        run_session(server_end, "duplex", session_broker.as_ref(), cfg, &mut track).await
    });

    let (tx, mut events) = mpsc::channel(8);
    let client = tokio::spawn(async move {
        let levels = HashMap::from([("0".to_string(), 0)]);
        let mut client = DeviceClient::new("dev-1").with_levels(levels);
        let res = client.run(client_end, tx).await;
        (client, res)
    });

    assert_eq!(
        recv(&mut events).await,
        ClientEvent::Connected {
            ping_interval: Duration::from_millis(100)
        }
    );
    assert_eq!(
        recv(&mut events).await,
        ClientEvent::Broadcast {
            chan_id: "0".to_string(),
            top_level: 1,
            payloads: vec![r#"{"a":1}"#.to_string()],
        }
    );
    assert_eq!(recv(&mut events).await, ClientEvent::Ping);

    // dropping the receiver stops the client at its next event
    drop(events);
    let (client, res) = client.await.unwrap();
    assert!(res.is_ok());
    assert_eq!(client.levels().get("0"), Some(&1));
    broker.stop().await;
}

#[tokio::test]
async fn test_client_answers_and_reports() {
    let (client_end, server_end) = duplex(64 * 1024);
    let (tx, mut events) = mpsc::channel(8);
    let client = tokio::spawn(async move {
        let mut client = DeviceClient::new("dev-2");
        client.run(client_end, tx).await
    });

    let (mut proto, connect) = fake_server_accept(server_end).await;
    assert_eq!(connect.kind, "connect");
    assert_eq!(connect.device_id, "dev-2");
    assert!(matches!(recv(&mut events).await, ClientEvent::Connected { .. }));

    proto.write_message(&PingPongMsg::ping()).await.unwrap();
    let pong: PingPongMsg = proto.read_message().await.unwrap();
    assert_eq!(pong.kind, "pong");
    assert_eq!(recv(&mut events).await, ClientEvent::Ping);

    proto.write_message(&ConnWarnMsg::new("slow down")).await.unwrap();
    assert_eq!(
        recv(&mut events).await,
        ClientEvent::Warned("slow down".to_string())
    );

    let notification = Notification {
        app_id: "app1".to_string(),
        msg_id: "m1".to_string(),
        payload: RawValue::from_string("42".to_string()).unwrap(),
    };
    proto
        .write_message(&NotificationsMsg::new(vec![notification.clone()]))
        .await
        .unwrap();
    let ack: AckMsg = proto.read_message().await.unwrap();
    assert_eq!(ack.kind, "ack");
    assert_eq!(
        recv(&mut events).await,
        ClientEvent::Notifications(vec![notification])
    );

    proto.write_message(&ConnBrokenMsg::new("host-mismatch")).await.unwrap();
    assert_eq!(
        recv(&mut events).await,
        ClientEvent::Broken("host-mismatch".to_string())
    );
    let res = client.await.unwrap();
    assert!(matches!(res, Err(ClientError::Broken(reason)) if reason == "host-mismatch"));
}

#[tokio::test]
async fn test_client_rejects_unknown_message() {
    let (client_end, server_end) = duplex(64 * 1024);
    let (tx, mut events) = mpsc::channel(8);
    let client = tokio::spawn(async move { DeviceClient::new("dev-3").run(client_end, tx).await });

    let (mut proto, _) = fake_server_accept(server_end).await;
    recv(&mut events).await;
    proto
        .write_message(&serde_json::json!({"T": "warp"}))
        .await
        .unwrap();
    let res = client.await.unwrap();
    assert!(matches!(res, Err(ClientError::Unexpected(kind)) if kind == "warp"));
}
