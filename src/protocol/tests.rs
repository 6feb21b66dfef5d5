use super::*;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::time::Instant;

fn payload(s: &str) -> Payload {
    RawValue::from_string(s.to_string()).unwrap()
}

fn many_parts(count: usize) -> Vec<Payload> {
    let bloat = "x".repeat(1024 * 2);
    (0..count)
        .map(|i| payload(&format!(r#"{{"b":{i},"bloat":"{bloat}"}}"#)))
        .collect()
}

#[tokio::test]
async fn test_write_message_frames_with_length_prefix() {
    let (client, mut server) = duplex(1024);
    let mut proto = Protocol::new(client);
    proto.set_deadline(Instant::now() + Duration::from_secs(1));
    proto.write_message(&PingPongMsg::ping()).await.unwrap();

    let mut buf = [0u8; 14];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[..2], &[0, 12]);
    assert_eq!(&buf[2..], br#"{"T":"ping"}"#);
}

#[tokio::test]
async fn test_read_message_decodes_frame() {
    let (client, mut server) = duplex(1024);
    let mut proto = Protocol::new(client);
    server.write_all(b"\x00\x0b{\"T\":\"ack\"}").await.unwrap();

    proto.set_deadline(Instant::now() + Duration::from_secs(1));
    let ack: AckMsg = proto.read_message().await.unwrap();
    assert_eq!(ack.kind, "ack");
}

#[tokio::test]
async fn test_read_message_short_read() {
    let (client, mut server) = duplex(1024);
    let mut proto = Protocol::new(client);
    server.write_all(b"\x00\x20{\"T\":").await.unwrap();
    drop(server);

    proto.set_deadline(Instant::now() + Duration::from_secs(1));
    let err = proto.read_message::<AckMsg>().await.unwrap_err();
    assert!(err.is_eof(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_read_message_malformed_json() {
    let (client, mut server) = duplex(1024);
    let mut proto = Protocol::new(client);
    server.write_all(b"\x00\x03{{{").await.unwrap();

    proto.set_deadline(Instant::now() + Duration::from_secs(1));
    let err = proto.read_message::<AckMsg>().await.unwrap_err();
    assert!(matches!(err, ProtocolError::Decode(_)));
}

#[tokio::test]
async fn test_read_message_deadline() {
    let (client, _server) = duplex(1024);
    let mut proto = Protocol::new(client);

    proto.set_deadline(Instant::now() + Duration::from_millis(50));
    let err = proto.read_message::<AckMsg>().await.unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout));
}

#[tokio::test]
async fn test_write_message_rejects_oversized_frame() {
    let (client, _server) = duplex(1024);
    let mut proto = Protocol::new(client);
    let msg = BroadcastMsg::new("0", 32, many_parts(32));

    proto.set_deadline(Instant::now() + Duration::from_secs(1));
    let err = proto.write_message(&msg).await.unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge(n) if n > MAX_FRAME_SIZE));
}

#[tokio::test]
async fn test_wire_format_version_byte() {
    let (mut client, mut server) = duplex(16);
    write_wire_format_version(&mut client, PROTOCOL_WIRE_VERSION, Duration::from_secs(1))
        .await
        .unwrap();
    let ver = read_wire_format_version(&mut server, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(ver, PROTOCOL_WIRE_VERSION);
}

#[tokio::test]
async fn test_wire_format_version_timeout() {
    let (_client, mut server) = duplex(16);
    let err = read_wire_format_version(&mut server, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout));
}

#[test]
fn test_split_broadcast_msg_nop() {
    let mut b = BroadcastMsg::new("0", 2, vec![payload(r#"{"b":1}"#), payload(r#"{"b":2}"#)]);
    assert!(b.split());
    assert_eq!(b.top_level, 2);
    assert_eq!(b.payloads.len(), 2);
    assert!(!b.is_splitting());
}

#[test]
fn test_split_broadcast_msg_many_parts() {
    let payloads = many_parts(33);
    let n = payloads.len();
    let mut b = BroadcastMsg::new("0", 500, payloads.clone());

    assert!(!b.split());
    let n1 = b.payloads.len();
    assert_eq!(b.top_level, 500 - n as i64 + n1 as i64);
    let buf = serde_json::to_vec(&b).unwrap();
    assert!(buf.len() <= MAX_FRAME_SIZE);
    assert!(buf.len() + payloads[n1].get().len() > MAX_PAYLOAD_SIZE);

    assert!(b.split());
    let n2 = b.payloads.len();
    assert_eq!(b.top_level, 500);
    assert_eq!(n1 + n2, n);
}

#[test]
fn test_split_broadcast_msg_three_parts_reassemble() {
    let payloads = many_parts(61);
    let n = payloads.len() as i64;
    let mut b = BroadcastMsg::new("0", n, payloads.clone());

    let mut seen = Vec::new();
    let mut tops = Vec::new();
    loop {
        let done = b.split();
        seen.extend(b.payloads.iter().map(|p| p.get().to_string()));
        tops.push(b.top_level);
        assert_eq!(b.top_level, seen.len() as i64);
        if done {
            break;
        }
    }
    assert_eq!(tops.len(), 3);
    assert!(tops.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*tops.last().unwrap(), n);
    let original: Vec<_> = payloads.iter().map(|p| p.get().to_string()).collect();
    assert_eq!(seen, original);

    b.reset();
    assert!(!b.is_splitting());
}

#[test]
fn test_split_oversized_single_payload_makes_progress() {
    let huge = payload(&format!(r#""{}""#, "y".repeat(MAX_PAYLOAD_SIZE + 10)));
    let mut b = BroadcastMsg::new("0", 2, vec![huge, payload("1")]);

    assert!(!b.split());
    assert_eq!(b.payloads.len(), 1);
    assert_eq!(b.top_level, 1);
    assert!(b.split());
    assert_eq!(b.payloads.len(), 1);
    assert_eq!(b.top_level, 2);
}

#[test]
fn test_split_notifications_msg_windows() {
    let bloat = "z".repeat(4000);
    let notifications: Vec<_> = (0..20)
        .map(|i| Notification {
            app_id: "app1".to_string(),
            msg_id: format!("m{i}"),
            payload: payload(&format!(r#""{bloat}""#)),
        })
        .collect();
    let mut msg = NotificationsMsg::new(notifications.clone());

    let mut seen = Vec::new();
    loop {
        let done = msg.split();
        let buf = serde_json::to_vec(&msg).unwrap();
        assert!(buf.len() <= MAX_FRAME_SIZE);
        assert!(!msg.notifications.is_empty());
        seen.extend(std::mem::take(&mut msg.notifications));
        if done {
            break;
        }
        assert!(msg.is_splitting());
    }
    assert_eq!(seen, notifications);
    assert!(!msg.is_splitting());
}

#[test]
fn test_split_notifications_msg_small_is_one_window() {
    let n = Notification {
        app_id: "app1".to_string(),
        msg_id: "m1".to_string(),
        payload: payload("1"),
    };
    let mut msg = NotificationsMsg::new(vec![n.clone(), n]);
    assert!(msg.split());
    assert_eq!(msg.notifications.len(), 2);
}

#[test]
fn test_broadcast_empty_payloads_are_null() {
    let b = BroadcastMsg::new("0", 0, Vec::new());
    let json = serde_json::to_string(&b).unwrap();
    assert_eq!(
        json,
        r#"{"T":"broadcast","ChanId":"0","TopLevel":0,"Payloads":null}"#
    );
    let back: BroadcastMsg = serde_json::from_str(&json).unwrap();
    assert!(back.payloads.is_empty());
}

#[test]
fn test_broadcast_payloads_forwarded_verbatim() {
    let b = BroadcastMsg::new("0", 1, vec![payload(r#"{"b": 1}"#)]);
    let json = serde_json::to_string(&b).unwrap();
    assert!(json.contains(r#""Payloads":[{"b": 1}]"#));
}

#[test]
fn test_connack_ping_interval_format() {
    assert_eq!(
        ConnAckMsg::new(Duration::from_secs(10)).params.ping_interval,
        "10s"
    );
    assert_eq!(
        ConnAckMsg::new(Duration::from_secs(90)).params.ping_interval,
        "1m30s"
    );
    assert_eq!(
        ConnAckMsg::new(Duration::from_millis(500)).params.ping_interval,
        "500ms"
    );
    let json = serde_json::to_string(&ConnAckMsg::new(Duration::from_secs(10))).unwrap();
    assert_eq!(json, r#"{"T":"connack","Params":{"PingInterval":"10s"}}"#);
}

#[test]
fn test_connect_msg_decoding() {
    let msg: ConnectMsg = serde_json::from_str(
        r#"{"T":"connect","DeviceId":"DEV1","Levels":{"0":5},"Info":{"device":"m1"}}"#,
    )
    .unwrap();
    assert_eq!(msg.kind, "connect");
    assert_eq!(msg.device_id, "DEV1");
    assert_eq!(msg.levels.get(SYSTEM_CHANNEL_ID), Some(&5));
    assert_eq!(msg.info["device"], "m1");

    let msg: ConnectMsg = serde_json::from_str(r#"{"T":"connect","Levels":null}"#).unwrap();
    assert!(msg.levels.is_empty());

    let roundtrip = ConnectMsg::new("DEV2", HashMap::from([("0".to_string(), 3)]));
    let json = serde_json::to_string(&roundtrip).unwrap();
    assert_eq!(serde_json::from_str::<ConnectMsg>(&json).unwrap(), roundtrip);
}

#[test]
fn test_oneway_messages() {
    let mut broken = ConnBrokenMsg::new(messages::BROKEN_HOST_MISMATCH);
    assert!(broken.split());
    assert!(!broken.oneway_continue());
    let mut warn = ConnWarnMsg::new(messages::WARN_UNAUTHORIZED);
    assert!(warn.split());
    assert!(warn.oneway_continue());
    assert_eq!(
        serde_json::to_string(&warn).unwrap(),
        r#"{"T":"connwarn","Reason":"unauthorized"}"#
    );
}
