//! The simple broker
//!
//! [`SimpleBroker`] implements [`Broker`] and [`BrokerSending`] within one
//! process. All registry mutation and delivery dispatch happens on a single
//! owning task fed through two bounded queues, one for registrations and
//! one for delivery requests. The task only ever enqueues to session queues
//! without waiting, so a stalled session cannot hold up the others.
//!
//! While running, the broker also keeps [`Statistics`] and logs them every
//! [`STATS_INTERVAL`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::exchanges::{feed, feed_pending};
use super::stats::{STATS_INTERVAL, Statistics};
use super::{
    BroadcastExchange, Broker, BrokerConfig, BrokerError, BrokerSending, BrokerSession, Delivery,
    LevelsMap, UnicastExchange, get_info_string,
};
use crate::persistence::{InternalChannelId, PendingStore};
use crate::protocol::ConnectMsg;

#[derive(Debug)]
enum SessionCommand {
    Register {
        device_id: String,
        serial: u64,
        queue: mpsc::Sender<Delivery>,
        levels: LevelsMap,
        registered: oneshot::Sender<()>,
    },
    Unregister {
        device_id: String,
        serial: u64,
    },
}

#[derive(Debug)]
enum DeliveryRequest {
    Broadcast(InternalChannelId),
    Unicast(InternalChannelId),
}

/// Registry entry of a live session.
#[derive(Debug)]
struct Entry {
    serial: u64,
    queue: mpsc::Sender<Delivery>,
}

/// State owned by the broker task.
struct BrokerLoop {
    store: Arc<dyn PendingStore>,
    stats: Arc<Statistics>,
    registry: HashMap<String, Entry>,
    session_rx: mpsc::Receiver<SessionCommand>,
    delivery_rx: mpsc::Receiver<DeliveryRequest>,
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

/// Broker for everything in just one process.
pub struct SimpleBroker {
    store: Arc<dyn PendingStore>,
    session_queue_size: usize,
    session_tx: mpsc::Sender<SessionCommand>,
    delivery_tx: mpsc::Sender<DeliveryRequest>,
    state: Arc<Mutex<BrokerLoop>>,
    running: Mutex<Option<Running>>,
    // true while stopped; wakes registrations stuck behind a stop
    stopped: watch::Sender<bool>,
    stats: Arc<Statistics>,
    next_serial: AtomicU64,
}

impl SimpleBroker {
    pub fn new(store: Arc<dyn PendingStore>, cfg: BrokerConfig) -> Self {
        let (session_tx, session_rx) = mpsc::channel(cfg.broker_queue_size.max(1));
        let (delivery_tx, delivery_rx) = mpsc::channel(cfg.broker_queue_size.max(1));
        let stats = Arc::new(Statistics::new());
        let state = BrokerLoop {
            store: store.clone(),
            stats: stats.clone(),
            registry: HashMap::new(),
            session_rx,
            delivery_rx,
        };
        Self {
            store,
            session_queue_size: cfg.session_queue_size.max(1),
            session_tx,
            delivery_tx,
            state: Arc::new(Mutex::new(state)),
            running: Mutex::new(None),
            stopped: watch::Sender::new(true),
            stats,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Starts the broker task. Does nothing if already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (stop, stop_rx) = oneshot::channel();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut state = state.lock().await;
            state.run(stop_rx).await;
        });
        let reporter = self.stats.spawn_reporter(STATS_INTERVAL);
        *running = Some(Running {
            stop,
            handle,
            reporter,
        });
        self.stopped.send_replace(false);
        debug!("broker started");
    }

    /// Stops the broker task, returning once it has exited.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            stop,
            handle,
            reporter,
        }) = running.take()
        else {
            return;
        };
        self.stopped.send_replace(true);
        reporter.abort();
        let _ = stop.send(());
        if let Err(e) = handle.await {
            error!("broker task ended abnormally: {e}");
        }
        debug!("broker stopped");
    }

    pub async fn running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }
}

impl std::fmt::Debug for SimpleBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleBroker")
            .field("session_queue_size", &self.session_queue_size)
            .finish_non_exhaustive()
    }
}

impl BrokerLoop {
    async fn run(&mut self, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(cmd) = self.session_rx.recv() => self.handle_session(cmd),
                Some(req) = self.delivery_rx.recv() => self.handle_delivery(req),
            }
        }
    }

    fn handle_session(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Register {
                device_id,
                serial,
                queue,
                levels,
                registered,
            } => {
                if registered.is_closed() {
                    // the registration was given up while queued
                    return;
                }
                let entry = Entry {
                    serial,
                    queue: queue.clone(),
                };
                if let Some(prev) = self.registry.insert(device_id.clone(), entry) {
                    // kick it; dropping its queue sender closes the queue anyway
                    let _ = prev.queue.try_send(Delivery::Kicked);
                    debug!("kicked previous session of {device_id}");
                }
                feed_pending(self.store.as_ref(), &device_id, &levels, &queue);
                self.stats.set_devices_online(self.registry.len());
                if registered.send(()).is_err() {
                    // given up while being fed
                    self.registry.remove(&device_id);
                    self.stats.set_devices_online(self.registry.len());
                }
            }
            SessionCommand::Unregister { device_id, serial } => {
                // unregister only the current session
                if self
                    .registry
                    .get(&device_id)
                    .is_some_and(|entry| entry.serial == serial)
                {
                    self.registry.remove(&device_id);
                    self.stats.set_devices_online(self.registry.len());
                }
            }
        }
    }

    fn handle_delivery(&mut self, req: DeliveryRequest) {
        match req {
            DeliveryRequest::Broadcast(chan_id) => {
                let (top_level, notifications) = match self.store.get_channel_snapshot(&chan_id)
                {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        // next broadcast will try again
                        error!("unsuccessful, get channel snapshot for {chan_id}: {e}");
                        return;
                    }
                };
                let exchange = Arc::new(BroadcastExchange {
                    chan_id,
                    top_level,
                    notifications,
                });
                self.stats.increase_broadcasts();
                for (device_id, entry) in &self.registry {
                    feed(&entry.queue, device_id, exchange.clone());
                }
            }
            DeliveryRequest::Unicast(chan_id) => {
                let Some((_, device_id)) = chan_id.unicast_user_and_device() else {
                    return;
                };
                self.stats.increase_unicasts();
                if let Some(entry) = self.registry.get(device_id) {
                    let exchange = Arc::new(UnicastExchange {
                        chan_id: chan_id.clone(),
                    });
                    feed(&entry.queue, device_id, exchange);
                }
            }
        }
    }
}

#[async_trait]
impl Broker for SimpleBroker {
    async fn register(&self, connect: &ConnectMsg) -> Result<BrokerSession, BrokerError> {
        let model = get_info_string(connect, "device", "?")?;
        let image_channel = get_info_string(connect, "channel", "?")?;
        let mut levels = LevelsMap::new();
        for (hex_id, level) in &connect.levels {
            let chan_id = InternalChannelId::from_hex(hex_id)
                .map_err(|e| BrokerError::abort(e.to_string()))?;
            levels.insert(chan_id, *level);
        }

        let mut stopped = self.stopped.subscribe();
        if !self.running().await {
            return Err(BrokerError::Stopped);
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (queue, exchanges) = mpsc::channel(self.session_queue_size);
        let feed = queue.downgrade();
        let (registered, registered_rx) = oneshot::channel();
        let registration = async {
            self.session_tx
                .send(SessionCommand::Register {
                    device_id: connect.device_id.clone(),
                    serial,
                    queue,
                    levels: levels.clone(),
                    registered,
                })
                .await
                .map_err(|_| BrokerError::Stopped)?;
            registered_rx.await.map_err(|_| BrokerError::Stopped)
        };
        let shutdown = async {
            // an error means the broker itself is gone
            let _ = stopped.wait_for(|stopped| *stopped).await;
        };
        tokio::select! {
            res = registration => res?,
            _ = shutdown => return Err(BrokerError::Stopped),
        }

        Ok(BrokerSession::new(
            serial,
            connect.device_id.clone(),
            model,
            image_channel,
            levels,
            exchanges,
            feed,
            self.store.clone(),
        ))
    }

    async fn unregister(&self, sess: &BrokerSession) {
        let cmd = SessionCommand::Unregister {
            device_id: sess.device_id().to_string(),
            serial: sess.serial,
        };
        if self.session_tx.send(cmd).await.is_err() {
            debug!("broker gone, not unregistering {}", sess.device_id());
        }
    }
}

#[async_trait]
impl BrokerSending for SimpleBroker {
    async fn broadcast(&self, chan_id: InternalChannelId) {
        if self
            .delivery_tx
            .send(DeliveryRequest::Broadcast(chan_id))
            .await
            .is_err()
        {
            error!("broker gone, dropping broadcast request");
        }
    }

    async fn unicast(&self, chan_ids: &[InternalChannelId]) {
        for chan_id in chan_ids {
            if self
                .delivery_tx
                .send(DeliveryRequest::Unicast(chan_id.clone()))
                .await
                .is_err()
            {
                error!("broker gone, dropping unicast request");
                return;
            }
        }
    }
}
