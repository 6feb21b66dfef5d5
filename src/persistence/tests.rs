use super::*;
use chrono::Duration;
use serde_json::value::RawValue;
use tempfile::{TempDir, tempdir};

fn payload(s: &str) -> Payload {
    RawValue::from_string(s.to_string()).unwrap()
}

fn later() -> DateTime<Utc> {
    Utc::now() + Duration::hours(1)
}

fn create_test_sled_store(max: Option<usize>) -> (TempDir, SledPendingStore) {
    let dir = tempdir().unwrap();
    let store = SledPendingStore::new(dir.path().to_str().unwrap(), max).unwrap();
    (dir, store)
}

fn payload_strings(notifications: &[Notification]) -> Vec<String> {
    notifications
        .iter()
        .map(|n| n.payload.get().to_string())
        .collect()
}

#[test]
fn test_channel_id_from_hex() {
    assert_eq!(
        InternalChannelId::from_hex("0").unwrap(),
        InternalChannelId::system()
    );
    assert_eq!(
        InternalChannelId::from_hex(&"0".repeat(32)).unwrap(),
        InternalChannelId::system()
    );

    let hex_id = "f1c9bf7096084cb2a154979ce00c7f50";
    let chan = InternalChannelId::from_hex(hex_id).unwrap();
    assert!(chan.is_broadcast());
    assert!(!chan.is_system());
    assert_eq!(chan.as_str(), format!("B{hex_id}"));
    assert_eq!(chan.to_hex(), Some(hex_id));
}

#[test]
fn test_channel_id_from_hex_rejects_garbage() {
    let not_hex = "g".repeat(32);
    let too_short = "0".repeat(31);
    for bad in ["", "00", "abc", not_hex.as_str(), too_short.as_str()] {
        let err = InternalChannelId::from_hex(bad).unwrap_err();
        assert!(matches!(err, StoreError::InvalidChannelId), "{bad:?}");
        assert_eq!(err.to_string(), "expected 128 bits hex repr");
    }
}

#[test]
fn test_unicast_channel_id() {
    let chan = InternalChannelId::unicast("user1", "dev1");
    assert!(chan.is_unicast());
    assert!(!chan.is_broadcast());
    assert_eq!(chan.to_hex(), None);
    assert_eq!(chan.unicast_user_and_device(), Some(("user1", "dev1")));
    assert_eq!(InternalChannelId::system().unicast_user_and_device(), None);
}

#[test]
fn test_memory_store_channel_names() {
    let store = InMemoryPendingStore::new();
    assert_eq!(
        store.get_internal_channel_id("system").unwrap(),
        InternalChannelId::system()
    );
    assert!(matches!(
        store.get_internal_channel_id("other"),
        Err(StoreError::UnknownChannel)
    ));
}

#[test]
fn test_memory_store_append_and_snapshot() {
    let store = InMemoryPendingStore::new();
    let chan = InternalChannelId::system();

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 0);
    assert!(notifications.is_empty());

    store
        .append_to_channel(&chan, payload(r#"{"b":1}"#), later())
        .unwrap();
    store
        .append_to_channel(&chan, payload(r#"{"b":2}"#), later())
        .unwrap();

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 2);
    assert_eq!(payload_strings(&notifications), [r#"{"b":1}"#, r#"{"b":2}"#]);
}

#[test]
fn test_memory_store_snapshot_skips_expired() {
    let store = InMemoryPendingStore::new();
    let chan = InternalChannelId::system();

    store
        .append_to_channel(&chan, payload("1"), Utc::now() - Duration::seconds(1))
        .unwrap();
    store.append_to_channel(&chan, payload("2"), later()).unwrap();

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 2, "expiry does not move the top level");
    assert_eq!(payload_strings(&notifications), ["2"]);

    let (_, unfiltered, meta) = store.get_channel_unfiltered(&chan).unwrap();
    assert_eq!(unfiltered.len(), 2);
    assert_eq!(meta.len(), 2);
}

#[test]
fn test_memory_store_unicast_append_keeps_top_level() {
    let store = InMemoryPendingStore::new();
    let chan = InternalChannelId::unicast("u", "d");

    store
        .append_to_unicast_channel(&chan, "app1", payload("1"), "m1", Metadata::expiring(later()))
        .unwrap();

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 0);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].app_id, "app1");
    assert_eq!(notifications[0].msg_id, "m1");
}

#[test]
fn test_memory_store_scrub() {
    let store = InMemoryPendingStore::new();
    let chan = InternalChannelId::unicast("u", "d");
    let tagged = Metadata {
        expiration: Some(later()),
        replace_tag: "tag1".to_string(),
    };

    store
        .append_to_unicast_channel(&chan, "app1", payload("1"), "m1", tagged.clone())
        .unwrap();
    store
        .append_to_unicast_channel(&chan, "app1", payload("2"), "m2", Metadata::expiring(later()))
        .unwrap();
    store
        .append_to_unicast_channel(&chan, "app2", payload("3"), "m3", tagged)
        .unwrap();

    store.scrub(&chan, Some("app1"), Some("tag1")).unwrap();
    let (_, notifications, meta) = store.get_channel_unfiltered(&chan).unwrap();
    let ids: Vec<_> = notifications.iter().map(|n| n.msg_id.as_str()).collect();
    assert_eq!(ids, ["m2", "m3"]);
    assert_eq!(meta[1].replace_tag, "tag1");

    store.scrub(&chan, Some("app1"), None).unwrap();
    let (_, notifications) = store.get_channel_snapshot(&chan).unwrap();
    let ids: Vec<_> = notifications.iter().map(|n| n.msg_id.as_str()).collect();
    assert_eq!(ids, ["m3"]);
}

#[test]
fn test_memory_store_drop_by_msg_id() {
    let store = InMemoryPendingStore::new();
    let chan = InternalChannelId::unicast("u", "d");
    for i in 1..=3 {
        store
            .append_to_unicast_channel(
                &chan,
                "app",
                payload(&i.to_string()),
                &format!("m{i}"),
                Metadata::expiring(later()),
            )
            .unwrap();
    }
    let (_, delivered) = store.get_channel_snapshot(&chan).unwrap();

    store.drop_by_msg_id(&chan, &delivered[1..2]).unwrap();
    let (_, left, meta) = store.get_channel_unfiltered(&chan).unwrap();
    let ids: Vec<_> = left.iter().map(|n| n.msg_id.as_str()).collect();
    assert_eq!(ids, ["m1", "m3"]);
    assert_eq!(meta.len(), 2);

    store.drop_by_msg_id(&chan, &left).unwrap();
    let (_, left) = store.get_channel_snapshot(&chan).unwrap();
    assert!(left.is_empty());
}

#[test]
fn test_filter_out_by_msg_id_head_and_scattered() {
    let mk = |id: &str| Notification {
        app_id: "app".to_string(),
        msg_id: id.to_string(),
        payload: payload("0"),
    };
    let orig = vec![mk("a"), mk("b"), mk("c")];

    let rest = filter_out_by_msg_id(orig.clone(), &[mk("a"), mk("b")]);
    assert_eq!(rest, vec![mk("c")]);

    let rest = filter_out_by_msg_id(orig.clone(), &[mk("c"), mk("a")]);
    assert_eq!(rest, vec![mk("b")]);

    let rest = filter_out_by_msg_id(orig.clone(), &[]);
    assert_eq!(rest, orig);
}

#[test]
fn test_tokens() {
    let store = InMemoryPendingStore::new();
    let token = store.register("DEV1", "app1").unwrap();

    let chan = store
        .get_internal_channel_id_from_token(&token, "app1", "", "")
        .unwrap();
    assert_eq!(chan, InternalChannelId::unicast("DEV1", "DEV1"));

    assert!(matches!(
        store.get_internal_channel_id_from_token(&token, "app2", "", ""),
        Err(StoreError::Unauthorized)
    ));
    assert!(matches!(
        store.get_internal_channel_id_from_token("!!not base64", "app1", "", ""),
        Err(StoreError::UnknownToken)
    ));

    let chan = store
        .get_internal_channel_id_from_token("", "", "user", "dev")
        .unwrap();
    assert_eq!(chan, InternalChannelId::unicast("user", "dev"));

    assert!(matches!(
        store.get_internal_channel_id_from_token("", "", "", ""),
        Err(StoreError::UnknownToken)
    ));
}

#[test]
fn test_sled_store_append_and_snapshot() {
    let (_dir, store) = create_test_sled_store(None);
    let chan = InternalChannelId::system();

    store
        .append_to_channel(&chan, payload(r#"{"b":1}"#), later())
        .unwrap();
    store
        .append_to_channel(&chan, payload(r#"{"b":2}"#), later())
        .unwrap();

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 2);
    assert_eq!(payload_strings(&notifications), [r#"{"b":1}"#, r#"{"b":2}"#]);
}

#[test]
fn test_sled_store_empty_channel() {
    let (_dir, store) = create_test_sled_store(None);
    let chan = InternalChannelId::from_hex("f1c9bf7096084cb2a154979ce00c7f50").unwrap();
    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 0);
    assert!(notifications.is_empty());
}

#[test]
fn test_sled_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap();
    let chan = InternalChannelId::system();
    {
        let store = SledPendingStore::new(path, None).unwrap();
        store.append_to_channel(&chan, payload("1"), later()).unwrap();
        store.flush().unwrap();
    }

    let store = SledPendingStore::new(path, None).unwrap();
    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 1);
    assert_eq!(payload_strings(&notifications), ["1"]);
}

#[test]
fn test_sled_store_max_messages_limit() {
    let (_dir, store) = create_test_sled_store(Some(3));
    let chan = InternalChannelId::system();

    for i in 0..5 {
        store
            .append_to_channel(&chan, payload(&i.to_string()), later())
            .unwrap();
    }

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 5);
    assert_eq!(payload_strings(&notifications), ["2", "3", "4"]);
}

#[test]
fn test_sled_store_unicast_scrub_and_drop() {
    let (_dir, store) = create_test_sled_store(Some(1));
    let chan = InternalChannelId::unicast("u", "d");
    for i in 1..=3 {
        store
            .append_to_unicast_channel(
                &chan,
                if i == 2 { "app2" } else { "app1" },
                payload(&i.to_string()),
                &format!("m{i}"),
                Metadata::expiring(later()),
            )
            .unwrap();
    }

    let (top, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(top, 0);
    assert_eq!(notifications.len(), 3, "retention cap applies to broadcast only");

    store.scrub(&chan, Some("app2"), None).unwrap();
    let (_, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(payload_strings(&notifications), ["1", "3"]);

    store.drop_by_msg_id(&chan, &notifications[..1]).unwrap();
    let (_, notifications) = store.get_channel_snapshot(&chan).unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].msg_id, "m3");
}

#[test]
fn test_sled_store_scrub_removes_expired() {
    let (_dir, store) = create_test_sled_store(None);
    let chan = InternalChannelId::system();
    store
        .append_to_channel(&chan, payload("1"), Utc::now() - Duration::seconds(5))
        .unwrap();
    store.append_to_channel(&chan, payload("2"), later()).unwrap();

    store.scrub(&chan, None, None).unwrap();
    let (top, notifications, _) = store.get_channel_unfiltered(&chan).unwrap();
    assert_eq!(top, 2);
    assert_eq!(payload_strings(&notifications), ["2"]);
}
