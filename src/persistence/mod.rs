//! The `persistence` module keeps the pending notifications per channel.
//!
//! The broker only depends on the narrow [`PendingStore`] trait. Two stores
//! are provided: [`InMemoryPendingStore`] and [`SledPendingStore`], the latter
//! keeping channels across restarts in an embedded `sled` database.
//!
//! Broadcast channels count every append in their top level. Unicast
//! channels hold per-device notifications which are dropped once acked; their
//! top level does not move.

pub mod memory_store;
pub mod sled_store;

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{Notification, Payload};

pub use memory_store::InMemoryPendingStore;
pub use sled_store::SledPendingStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown channel name")]
    UnknownChannel,
    #[error("expected 128 bits hex repr")]
    InvalidChannelId,
    #[error("unknown token")]
    UnknownToken,
    #[error("unauthorized")]
    Unauthorized,
    #[error("store backend: {0}")]
    Backend(#[from] sled::Error),
    #[error("stored data: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Store-internal channel id.
///
/// `0` is the system channel, `B<hex>` a broadcast channel and
/// `U<user>:<device>` a unicast channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InternalChannelId(String);

impl InternalChannelId {
    pub fn system() -> Self {
        Self("0".to_string())
    }

    /// Builds the channel id for a user/device pair.
    pub fn unicast(user_id: &str, device_id: &str) -> Self {
        Self(format!("U{user_id}:{device_id}"))
    }

    /// Parses the hex form devices use in CONNECT levels.
    pub fn from_hex(hex_repr: &str) -> Result<Self, StoreError> {
        if hex_repr == crate::protocol::SYSTEM_CHANNEL_ID {
            return Ok(Self::system());
        }
        if hex_repr.len() != 32 {
            return Err(StoreError::InvalidChannelId);
        }
        let mut id = [0u8; 16];
        hex::decode_to_slice(hex_repr, &mut id).map_err(|_| StoreError::InvalidChannelId)?;
        if id == [0u8; 16] {
            return Ok(Self::system());
        }
        Ok(Self(format!("B{hex_repr}")))
    }

    /// Hex form of a broadcast channel id, `None` for unicast channels.
    pub fn to_hex(&self) -> Option<&str> {
        if self.is_system() {
            return Some(crate::protocol::SYSTEM_CHANNEL_ID);
        }
        self.0.strip_prefix('B')
    }

    pub fn is_system(&self) -> bool {
        self.0 == "0"
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.starts_with('B') || self.is_system()
    }

    pub fn is_unicast(&self) -> bool {
        self.0.starts_with('U')
    }

    /// User and device ids of a unicast channel.
    pub fn unicast_user_and_device(&self) -> Option<(&str, &str)> {
        self.0.strip_prefix('U')?.split_once(':')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InternalChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bookkeeping kept next to every stored notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub replace_tag: String,
}

impl Metadata {
    pub fn expiring(expiration: DateTime<Utc>) -> Self {
        Self {
            expiration: Some(expiration),
            replace_tag: String::new(),
        }
    }

    /// Whether the notification expired before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp < now)
    }
}

/// A channel snapshot: top level plus the live notifications.
pub type Snapshot = (i64, Vec<Notification>);

/// Storage of pending notifications the broker delivers from.
pub trait PendingStore: Send + Sync {
    /// Resolves a channel name to its internal id.
    fn get_internal_channel_id(&self, name: &str) -> Result<InternalChannelId, StoreError>;

    /// Appends a broadcast notification, bumping the channel top level.
    fn append_to_channel(
        &self,
        chan_id: &InternalChannelId,
        payload: Payload,
        expiration: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Appends a notification to a unicast channel.
    fn append_to_unicast_channel(
        &self,
        chan_id: &InternalChannelId,
        app_id: &str,
        payload: Payload,
        msg_id: &str,
        meta: Metadata,
    ) -> Result<(), StoreError>;

    /// Current top level and live notifications of a channel.
    fn get_channel_snapshot(&self, chan_id: &InternalChannelId) -> Result<Snapshot, StoreError>;

    /// Everything stored in a channel, expired entries included.
    fn get_channel_unfiltered(
        &self,
        chan_id: &InternalChannelId,
    ) -> Result<(i64, Vec<Notification>, Vec<Metadata>), StoreError>;

    /// Removes expired notifications and, given an app id, the app's
    /// notifications (only the ones with `replace_tag` if that is non-empty).
    fn scrub(
        &self,
        chan_id: &InternalChannelId,
        app_id: Option<&str>,
        replace_tag: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Drops the notifications whose message ids appear in `targets`.
    fn drop_by_msg_id(
        &self,
        chan_id: &InternalChannelId,
        targets: &[Notification],
    ) -> Result<(), StoreError>;

    /// Issues a token for an app on a device.
    fn register(&self, device_id: &str, app_id: &str) -> Result<String, StoreError>;

    /// Resolves a unicast channel from a token or a user/device pair.
    fn get_internal_channel_id_from_token(
        &self,
        token: &str,
        app_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<InternalChannelId, StoreError>;
}

/// Filters out the notifications whose metadata says they expired.
pub fn filter_out_obsolete(
    notifications: Vec<Notification>,
    meta: &[Metadata],
    now: DateTime<Utc>,
) -> Vec<Notification> {
    notifications
        .into_iter()
        .zip(meta)
        .filter(|(_, m)| !m.is_expired(now))
        .map(|(n, _)| n)
        .collect()
}

/// Returns the notifications from `orig` whose message id is not in `targets`.
pub fn filter_out_by_msg_id(orig: Vec<Notification>, targets: &[Notification]) -> Vec<Notification> {
    // common case: the acked notifications are the head of the channel
    if !targets.is_empty()
        && orig.len() >= targets.len()
        && orig
            .iter()
            .zip(targets)
            .all(|(o, t)| o.msg_id == t.msg_id)
    {
        return orig.into_iter().skip(targets.len()).collect();
    }
    let ids: HashSet<&str> = targets.iter().map(|t| t.msg_id.as_str()).collect();
    orig.into_iter()
        .filter(|n| !ids.contains(n.msg_id.as_str()))
        .collect()
}

/// Whether a stored notification survives a scrub.
fn survives_scrub(
    notification: &Notification,
    meta: &Metadata,
    app_id: Option<&str>,
    replace_tag: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    if meta.is_expired(now) {
        return false;
    }
    match (app_id, replace_tag) {
        (Some(app), Some(tag)) if !tag.is_empty() => {
            !(notification.app_id == app && meta.replace_tag == tag)
        }
        (Some(app), _) => notification.app_id != app,
        (None, _) => true,
    }
}

fn token_for(device_id: &str, app_id: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{app_id}::{device_id}"))
}

fn channel_from_token(
    token: &str,
    app_id: &str,
    user_id: &str,
    device_id: &str,
) -> Result<InternalChannelId, StoreError> {
    use base64::Engine;
    if !token.is_empty() && !app_id.is_empty() {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|_| StoreError::UnknownToken)?;
        let decoded = String::from_utf8(decoded).map_err(|_| StoreError::UnknownToken)?;
        let device = decoded
            .strip_prefix(app_id)
            .and_then(|rest| rest.strip_prefix("::"))
            .ok_or(StoreError::Unauthorized)?;
        return Ok(InternalChannelId::unicast(device, device));
    }
    if !user_id.is_empty() && !device_id.is_empty() {
        return Ok(InternalChannelId::unicast(user_id, device_id));
    }
    Err(StoreError::UnknownToken)
}

#[cfg(test)]
mod tests;
