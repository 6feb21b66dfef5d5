//! In-memory pending store
//!
//! Channels live in a mutex-guarded map; nothing survives a restart.
//! Good for development and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{
    InternalChannelId, Metadata, PendingStore, Snapshot, StoreError, channel_from_token,
    filter_out_by_msg_id, filter_out_obsolete, survives_scrub, token_for,
};
use crate::protocol::{Notification, Payload};

#[derive(Debug, Default)]
struct Channel {
    top_level: i64,
    notifications: Vec<Notification>,
    meta: Vec<Metadata>,
}

#[derive(Debug, Default)]
pub struct InMemoryPendingStore {
    store: Mutex<HashMap<InternalChannelId, Channel>>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<InternalChannelId, Channel>> {
        // a panic while holding the lock leaves the map consistent
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(
        &self,
        chan_id: &InternalChannelId,
        notification: Notification,
        inc: i64,
        meta: Metadata,
    ) {
        let mut store = self.lock();
        let channel = store.entry(chan_id.clone()).or_default();
        channel.top_level += inc;
        channel.notifications.push(notification);
        channel.meta.push(meta);
    }
}

impl PendingStore for InMemoryPendingStore {
    fn get_internal_channel_id(&self, name: &str) -> Result<InternalChannelId, StoreError> {
        if name == "system" {
            return Ok(InternalChannelId::system());
        }
        Err(StoreError::UnknownChannel)
    }

    fn append_to_channel(
        &self,
        chan_id: &InternalChannelId,
        payload: Payload,
        expiration: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let notification = Notification {
            app_id: String::new(),
            msg_id: String::new(),
            payload,
        };
        self.append(chan_id, notification, 1, Metadata::expiring(expiration));
        Ok(())
    }

    fn append_to_unicast_channel(
        &self,
        chan_id: &InternalChannelId,
        app_id: &str,
        payload: Payload,
        msg_id: &str,
        meta: Metadata,
    ) -> Result<(), StoreError> {
        let notification = Notification {
            app_id: app_id.to_string(),
            msg_id: msg_id.to_string(),
            payload,
        };
        self.append(chan_id, notification, 0, meta);
        Ok(())
    }

    fn get_channel_snapshot(&self, chan_id: &InternalChannelId) -> Result<Snapshot, StoreError> {
        let (top_level, notifications, meta) = self.get_channel_unfiltered(chan_id)?;
        Ok((
            top_level,
            filter_out_obsolete(notifications, &meta, Utc::now()),
        ))
    }

    fn get_channel_unfiltered(
        &self,
        chan_id: &InternalChannelId,
    ) -> Result<(i64, Vec<Notification>, Vec<Metadata>), StoreError> {
        let store = self.lock();
        Ok(match store.get(chan_id) {
            Some(channel) => (
                channel.top_level,
                channel.notifications.clone(),
                channel.meta.clone(),
            ),
            None => (0, Vec::new(), Vec::new()),
        })
    }

    fn scrub(
        &self,
        chan_id: &InternalChannelId,
        app_id: Option<&str>,
        replace_tag: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut store = self.lock();
        let Some(channel) = store.get_mut(chan_id) else {
            return Ok(());
        };
        let notifications = std::mem::take(&mut channel.notifications);
        let meta = std::mem::take(&mut channel.meta);
        for (notification, meta) in notifications.into_iter().zip(meta) {
            if survives_scrub(&notification, &meta, app_id, replace_tag, now) {
                channel.notifications.push(notification);
                channel.meta.push(meta);
            }
        }
        Ok(())
    }

    fn drop_by_msg_id(
        &self,
        chan_id: &InternalChannelId,
        targets: &[Notification],
    ) -> Result<(), StoreError> {
        let mut store = self.lock();
        let Some(channel) = store.get_mut(chan_id) else {
            return Ok(());
        };
        let meta_by_id: HashMap<String, Metadata> = channel
            .notifications
            .iter()
            .zip(&channel.meta)
            .map(|(n, m)| (n.msg_id.clone(), m.clone()))
            .collect();
        channel.notifications =
            filter_out_by_msg_id(std::mem::take(&mut channel.notifications), targets);
        channel.meta = channel
            .notifications
            .iter()
            .map(|n| meta_by_id.get(&n.msg_id).cloned().unwrap_or_default())
            .collect();
        Ok(())
    }

    fn register(&self, device_id: &str, app_id: &str) -> Result<String, StoreError> {
        Ok(token_for(device_id, app_id))
    }

    fn get_internal_channel_id_from_token(
        &self,
        token: &str,
        app_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<InternalChannelId, StoreError> {
        channel_from_token(token, app_id, user_id, device_id)
    }
}
