//! Pending store backed by `sled`
//!
//! Each channel gets its own tree whose keys are big endian ids from
//! `Db::generate_id`, so iteration yields notifications in append order.
//! Channel top levels live in a separate `levels` tree.
//!
//! Configuration options supported:
//! - `max_messages_per_channel`: optional cap on the notifications kept per
//!   broadcast channel; when exceeded the oldest ones are removed. The top
//!   level is unaffected, devices further behind get what is retained.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sled::{Db, IVec, Tree};
use tracing::debug;

use super::{
    InternalChannelId, Metadata, PendingStore, Snapshot, StoreError, channel_from_token,
    filter_out_by_msg_id, filter_out_obsolete, survives_scrub, token_for,
};
use crate::protocol::{Notification, Payload};

#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredNotification {
    app_id: String,
    msg_id: String,
    payload: String,
    meta: Metadata,
}

impl StoredNotification {
    fn into_parts(self) -> Result<(Notification, Metadata), StoreError> {
        let payload = RawValue::from_string(self.payload)?;
        Ok((
            Notification {
                app_id: self.app_id,
                msg_id: self.msg_id,
                payload,
            },
            self.meta,
        ))
    }
}

pub struct SledPendingStore {
    db: Db,
    levels: Tree,
    max_messages_per_channel: Option<usize>,
    // appends take it exclusively so snapshots see top level and
    // notifications from the same moment
    consistency: RwLock<()>,
}

impl SledPendingStore {
    /// Opens or creates a sled database at `path`.
    pub fn new(path: &str, max_messages_per_channel: Option<usize>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::with_db(db, max_messages_per_channel)
    }

    pub fn with_db(db: Db, max_messages_per_channel: Option<usize>) -> Result<Self, StoreError> {
        let levels = db.open_tree("levels")?;
        Ok(Self {
            db,
            levels,
            max_messages_per_channel,
            consistency: RwLock::new(()),
        })
    }

    fn channel_tree(&self, chan_id: &InternalChannelId) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("chan:{chan_id}"))?)
    }

    fn top_level(&self, chan_id: &InternalChannelId) -> Result<i64, StoreError> {
        Ok(self
            .levels
            .get(chan_id.as_str())?
            .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
            .map(i64::from_be_bytes)
            .unwrap_or(0))
    }

    fn entries(&self, tree: &Tree) -> Result<Vec<(IVec, Notification, Metadata)>, StoreError> {
        let mut acc = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let stored: StoredNotification = serde_json::from_slice(&value)?;
            let (notification, meta) = stored.into_parts()?;
            acc.push((key, notification, meta));
        }
        Ok(acc)
    }

    fn append(
        &self,
        chan_id: &InternalChannelId,
        notification: StoredNotification,
        inc: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.consistency.write().unwrap_or_else(|e| e.into_inner());
        let tree = self.channel_tree(chan_id)?;
        let key = self.db.generate_id()?.to_be_bytes();
        tree.insert(key, serde_json::to_vec(&notification)?)?;
        if inc != 0 {
            let top_level = self.top_level(chan_id)? + inc;
            self.levels
                .insert(chan_id.as_str(), &top_level.to_be_bytes())?;
        }
        if let Some(max) = self.max_messages_per_channel {
            if chan_id.is_broadcast() && tree.len() > max {
                let excess = tree.len() - max;
                let keys: Vec<IVec> = tree
                    .iter()
                    .keys()
                    .take(excess)
                    .collect::<Result<_, _>>()?;
                for key in keys {
                    tree.remove(key)?;
                }
                debug!("trimmed {excess} notifications from channel {chan_id}");
            }
        }
        Ok(())
    }

    fn retain(
        &self,
        chan_id: &InternalChannelId,
        mut keep: impl FnMut(&Notification, &Metadata) -> bool,
    ) -> Result<(), StoreError> {
        let _guard = self.consistency.write().unwrap_or_else(|e| e.into_inner());
        let tree = self.channel_tree(chan_id)?;
        for (key, notification, meta) in self.entries(&tree)? {
            if !keep(&notification, &meta) {
                tree.remove(key)?;
            }
        }
        Ok(())
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledPendingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledPendingStore")
            .field("db", &"sled::Db")
            .field("max_messages_per_channel", &self.max_messages_per_channel)
            .finish()
    }
}

impl PendingStore for SledPendingStore {
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
        let stored = StoredNotification {
            app_id: String::new(),
            msg_id: String::new(),
            payload: payload.get().to_string(),
            meta: Metadata::expiring(expiration),
        };
        self.append(chan_id, stored, 1)
    }

    fn append_to_unicast_channel(
        &self,
        chan_id: &InternalChannelId,
        app_id: &str,
        payload: Payload,
        msg_id: &str,
        meta: Metadata,
    ) -> Result<(), StoreError> {
        let stored = StoredNotification {
            app_id: app_id.to_string(),
            msg_id: msg_id.to_string(),
            payload: payload.get().to_string(),
            meta,
        };
        self.append(chan_id, stored, 0)
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
        let _guard = self.consistency.read().unwrap_or_else(|e| e.into_inner());
        let top_level = self.top_level(chan_id)?;
        let tree = self.channel_tree(chan_id)?;
        let (notifications, meta) = self
            .entries(&tree)?
            .into_iter()
            .map(|(_, n, m)| (n, m))
            .unzip();
        Ok((top_level, notifications, meta))
    }

    fn scrub(
        &self,
        chan_id: &InternalChannelId,
        app_id: Option<&str>,
        replace_tag: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.retain(chan_id, |n, m| {
            survives_scrub(n, m, app_id, replace_tag, now)
        })
    }

    fn drop_by_msg_id(
        &self,
        chan_id: &InternalChannelId,
        targets: &[Notification],
    ) -> Result<(), StoreError> {
        let (_, notifications, _) = self.get_channel_unfiltered(chan_id)?;
        let kept: Vec<String> = filter_out_by_msg_id(notifications, targets)
            .into_iter()
            .map(|n| n.msg_id)
            .collect();
        self.retain(chan_id, |n, _| kept.contains(&n.msg_id))
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
