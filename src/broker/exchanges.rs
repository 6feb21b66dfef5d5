//! Exchanges
//!
//! [`BroadcastExchange`] delivers a snapshot of a broadcast channel,
//! [`UnicastExchange`] the pending notifications of a device and
//! [`ConnMetaExchange`] a one-way CONNBROKEN/CONNWARN.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

use super::{BrokerError, BrokerSession, Delivery, Exchange, LevelsMap, Outgoing};
use crate::persistence::{InternalChannelId, PendingStore};
use crate::protocol::messages::extract_payloads;
use crate::protocol::{AckMsg, ConnBrokenMsg, ConnWarnMsg, Notification, OnewayMsg};

/// Returns the part of `notifications` a client at `client_level` misses.
///
/// A client further behind than what is retained gets everything retained;
/// a client claiming to be ahead gets the last entry.
pub fn filter_by_level(
    client_level: i64,
    top_level: i64,
    notifications: &[Notification],
) -> &[Notification] {
    let count = notifications.len() as i64;
    if count == 0 {
        return &[];
    }
    let mut delta = top_level - client_level;
    if delta < 0 {
        delta = 1;
    }
    if delta < count {
        &notifications[(count - delta) as usize..]
    } else {
        notifications
    }
}

fn check_ack(ack: &AckMsg) -> Result<(), BrokerError> {
    if ack.kind != "ack" {
        return Err(BrokerError::abort("expected ACK message"));
    }
    Ok(())
}

/// Leads a session through delivering a BROADCAST.
#[derive(Debug, Clone)]
pub struct BroadcastExchange {
    pub chan_id: InternalChannelId,
    pub top_level: i64,
    pub notifications: Vec<Notification>,
}

impl Exchange for BroadcastExchange {
    fn prepare(&self, sess: &mut BrokerSession) -> Result<Outgoing, BrokerError> {
        let client_level = sess.levels().get(&self.chan_id).copied().unwrap_or(0);
        let notifications = filter_by_level(client_level, self.top_level, &self.notifications);
        if notifications.is_empty() && self.top_level >= client_level {
            // nothing new and no resync needed
            return Ok(Outgoing::Nop);
        }

        let scratch = sess.scratch_mut();
        let msg = &mut scratch.broadcast;
        msg.reset();
        msg.kind = "broadcast".to_string();
        msg.chan_id = self.chan_id.to_hex().unwrap_or_default().to_string();
        msg.top_level = self.top_level;
        msg.payloads = extract_payloads(notifications);
        scratch.ack = AckMsg::default();
        Ok(Outgoing::Broadcast)
    }

    fn acked(&self, sess: &mut BrokerSession, done: bool) -> Result<(), BrokerError> {
        check_ack(&sess.scratch().ack)?;
        if done {
            sess.levels_mut().insert(self.chan_id.clone(), self.top_level);
        }
        Ok(())
    }
}

/// Leads a session through delivering the pending notifications of a
/// device, window by window. Each acked window is dropped from the store.
#[derive(Debug, Clone)]
pub struct UnicastExchange {
    pub chan_id: InternalChannelId,
}

impl Exchange for UnicastExchange {
    fn prepare(&self, sess: &mut BrokerSession) -> Result<Outgoing, BrokerError> {
        let (_, notifications) = sess.get(&self.chan_id)?;
        if notifications.is_empty() {
            return Ok(Outgoing::Nop);
        }
        let scratch = sess.scratch_mut();
        scratch.notifications.reset();
        scratch.notifications.kind = "notifications".to_string();
        scratch.notifications.notifications = notifications;
        scratch.ack = AckMsg::default();
        Ok(Outgoing::Notifications)
    }

    fn acked(&self, sess: &mut BrokerSession, _done: bool) -> Result<(), BrokerError> {
        check_ack(&sess.scratch().ack)?;
        let delivered = std::mem::take(&mut sess.scratch_mut().notifications.notifications);
        sess.drop_by_msg_id(&self.chan_id, &delivered)?;
        Ok(())
    }
}

/// A one-way connection level message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConnMeta {
    Broken(ConnBrokenMsg),
    Warn(ConnWarnMsg),
}

impl ConnMeta {
    /// Whether the session goes on after sending the message.
    pub fn oneway_continue(&self) -> bool {
        match self {
            ConnMeta::Broken(msg) => msg.oneway_continue(),
            ConnMeta::Warn(msg) => msg.oneway_continue(),
        }
    }
}

/// Sends a CONNBROKEN or CONNWARN.
#[derive(Debug, Clone)]
pub struct ConnMetaExchange {
    pub msg: ConnMeta,
}

impl Exchange for ConnMetaExchange {
    fn prepare(&self, _sess: &mut BrokerSession) -> Result<Outgoing, BrokerError> {
        Ok(Outgoing::Oneway(self.msg.clone()))
    }

    // one-way messages get no reply, so there is nothing to check
    fn acked(&self, _sess: &mut BrokerSession, _done: bool) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Queues the exchanges covering what is pending for a freshly registered
/// device: one BROADCAST per broadcast channel whose level differs from the
/// device's, then its unicast notifications.
pub(super) fn feed_pending(
    store: &dyn PendingStore,
    device_id: &str,
    levels: &LevelsMap,
    queue: &mpsc::Sender<Delivery>,
) -> usize {
    let mut channels = vec![InternalChannelId::system()];
    channels.extend(
        levels
            .keys()
            .filter(|id| id.is_broadcast() && !id.is_system())
            .cloned(),
    );
    channels.sort();

    let mut fed = 0;
    for chan_id in channels {
        let (top_level, notifications) = match store.get_channel_snapshot(&chan_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // next broadcast will try again
                error!("unsuccessful, get channel snapshot for {chan_id}: {e}");
                continue;
            }
        };
        let client_level = levels.get(&chan_id).copied().unwrap_or(0);
        if client_level != top_level {
            let exchange = BroadcastExchange {
                chan_id,
                top_level,
                notifications,
            };
            fed += feed(queue, device_id, Arc::new(exchange));
        }
    }
    let exchange = UnicastExchange {
        chan_id: InternalChannelId::unicast(device_id, device_id),
    };
    fed + feed(queue, device_id, Arc::new(exchange))
}

/// Puts an exchange on a session queue without waiting.
pub(super) fn feed(
    queue: &mpsc::Sender<Delivery>,
    device_id: &str,
    exchange: Arc<dyn Exchange>,
) -> usize {
    match queue.try_send(Delivery::Exchange(exchange)) {
        Ok(()) => 1,
        Err(TrySendError::Full(_)) => {
            warn!("session queue of {device_id} is full, dropping delivery");
            0
        }
        Err(TrySendError::Closed(_)) => 0,
    }
}
