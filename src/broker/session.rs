use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use super::{Exchange, LevelsMap};
use crate::persistence::{InternalChannelId, PendingStore, Snapshot, StoreError};
use crate::protocol::{AckMsg, BroadcastMsg, Notification, NotificationsMsg};

/// An item on a session queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    Exchange(Arc<dyn Exchange>),
    /// A newer session for the same device took over.
    Kicked,
}

/// Message storage reused across the exchanges of a session.
#[derive(Debug, Default)]
pub struct ExchangeScratchArea {
    pub broadcast: BroadcastMsg,
    pub notifications: NotificationsMsg,
    pub ack: AckMsg,
}

/// Broker side state of a registered session.
pub struct BrokerSession {
    pub(super) serial: u64,
    device_id: String,
    model: String,
    image_channel: String,
    levels: LevelsMap,
    exchanges: mpsc::Receiver<Delivery>,
    // weak so the queue closes once the broker lets go of the session
    feed: mpsc::WeakSender<Delivery>,
    store: Arc<dyn PendingStore>,
    scratch: ExchangeScratchArea,
}

impl BrokerSession {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        serial: u64,
        device_id: String,
        model: String,
        image_channel: String,
        levels: LevelsMap,
        exchanges: mpsc::Receiver<Delivery>,
        feed: mpsc::WeakSender<Delivery>,
        store: Arc<dyn PendingStore>,
    ) -> Self {
        Self {
            serial,
            device_id,
            model,
            image_channel,
            levels,
            exchanges,
            feed,
            store,
            scratch: ExchangeScratchArea::default(),
        }
    }

    /// Waits for the next delivery. `None` once the broker dropped the session.
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        self.exchanges.recv().await
    }

    /// Queues an exchange for the session. Returns false if the queue is
    /// full or the session was let go by the broker.
    pub fn feed(&self, exchange: Arc<dyn Exchange>) -> bool {
        match self.feed.upgrade() {
            Some(sender) => sender.try_send(Delivery::Exchange(exchange)).is_ok(),
            None => false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_image_model(&self) -> &str {
        &self.model
    }

    pub fn device_image_channel(&self) -> &str {
        &self.image_channel
    }

    pub fn levels(&self) -> &LevelsMap {
        &self.levels
    }

    pub fn levels_mut(&mut self) -> &mut LevelsMap {
        &mut self.levels
    }

    pub fn scratch(&self) -> &ExchangeScratchArea {
        &self.scratch
    }

    pub fn scratch_mut(&mut self) -> &mut ExchangeScratchArea {
        &mut self.scratch
    }

    /// The unicast channel of the device.
    pub fn internal_channel_id(&self) -> InternalChannelId {
        InternalChannelId::unicast(&self.device_id, &self.device_id)
    }

    /// Gets the content of a channel.
    pub fn get(&self, chan_id: &InternalChannelId) -> Result<Snapshot, StoreError> {
        self.store.get_channel_snapshot(chan_id).inspect_err(|e| {
            error!("unsuccessful, get channel snapshot for {chan_id}: {e}");
        })
    }

    /// Drops delivered notifications from a channel.
    pub fn drop_by_msg_id(
        &self,
        chan_id: &InternalChannelId,
        targets: &[Notification],
    ) -> Result<(), StoreError> {
        self.store
            .drop_by_msg_id(chan_id, targets)
            .inspect_err(|e| error!("unsuccessful, drop from channel {chan_id}: {e}"))
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("serial", &self.serial)
            .field("device_id", &self.device_id)
            .field("model", &self.model)
            .field("image_channel", &self.image_channel)
            .field("levels", &self.levels)
            .finish()
    }
}
