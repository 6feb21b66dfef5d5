use std::fmt::Display;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep_until};

use super::{SessionConfig, SessionError, SessionTracker};
use crate::broker::{Broker, BrokerError, BrokerSession, Delivery, Exchange, Outgoing};
use crate::protocol::{
    AckMsg, ConnAckMsg, ConnectMsg, PROTOCOL_WIRE_VERSION, PingPongMsg, Protocol, SplittableMsg,
    read_wire_format_version,
};

/// Runs the session with a device over `conn` until it ends, always
/// unregistering from the broker once registered.
pub async fn run_session<S, B>(
    mut conn: S,
    peer: impl Display,
    broker: &B,
    cfg: SessionConfig,
    track: &mut SessionTracker,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: Broker + ?Sized,
{
    track.start(peer);
    let version = match read_wire_format_version(&mut conn, cfg.exchange_timeout).await {
        Ok(version) => version,
        Err(e) => return track.end(Err(e.into())),
    };
    if version != PROTOCOL_WIRE_VERSION {
        return track.end(Err(SessionError::UnexpectedWireVersion(version)));
    }
    let mut proto = Protocol::new(conn);
    let mut sess = match session_start(&mut proto, broker, cfg).await {
        Ok(sess) => sess,
        Err(e) => return track.end(Err(e)),
    };
    track.registered(&sess);
    let result = SessionLoop::new(&mut proto, &mut sess, cfg, track).run().await;
    broker.unregister(&sess).await;
    track.end(result)
}

async fn session_start<S, B>(
    proto: &mut Protocol<S>,
    broker: &B,
    cfg: SessionConfig,
) -> Result<BrokerSession, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: Broker + ?Sized,
{
    proto.set_deadline(Instant::now() + cfg.exchange_timeout);
    let connect: ConnectMsg = proto.read_message().await?;
    if connect.kind != "connect" {
        return Err(BrokerError::abort("expected CONNECT message").into());
    }
    proto.write_message(&ConnAckMsg::new(cfg.ping_interval)).await?;
    Ok(broker.register(&connect).await?)
}

struct SessionLoop<'a, S> {
    proto: &'a mut Protocol<S>,
    sess: &'a mut BrokerSession,
    track: &'a SessionTracker,
    cfg: SessionConfig,
    interval_start: Instant,
}

impl<'a, S> SessionLoop<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(
        proto: &'a mut Protocol<S>,
        sess: &'a mut BrokerSession,
        cfg: SessionConfig,
        track: &'a SessionTracker,
    ) -> Self {
        Self {
            proto,
            sess,
            track,
            cfg,
            interval_start: Instant::now(),
        }
    }

    fn ping_deadline(&self) -> Instant {
        self.interval_start + self.cfg.ping_interval
    }

    /// Restarts the ping interval from now.
    fn ping_timer_reset(&mut self) {
        self.interval_start = Instant::now();
    }

    fn exchange_deadline(&mut self) {
        self.proto
            .set_deadline(Instant::now() + self.cfg.exchange_timeout);
    }

    async fn run(mut self) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                _ = sleep_until(self.ping_deadline()) => self.do_ping().await?,
                delivery = self.sess.next_delivery() => match delivery {
                    Some(Delivery::Exchange(exchange)) => self.perform(exchange).await?,
                    Some(Delivery::Kicked) | None => {
                        return Err(BrokerError::abort("terminated").into());
                    }
                },
            }
        }
    }

    async fn do_ping(&mut self) -> Result<(), SessionError> {
        self.track
            .effective_ping_interval(self.interval_start.elapsed());
        self.exchange_deadline();
        self.proto.write_message(&PingPongMsg::ping()).await?;
        let pong: PingPongMsg = self.proto.read_message().await?;
        if pong.kind != "pong" {
            return Err(BrokerError::abort("expected PONG message").into());
        }
        self.ping_timer_reset();
        Ok(())
    }

    async fn perform(&mut self, exchange: Arc<dyn Exchange>) -> Result<(), SessionError> {
        let outgoing = exchange.prepare(self.sess)?;
        match outgoing {
            Outgoing::Nop => {
                if Instant::now() >= self.ping_deadline() {
                    // late, ping here
                    self.do_ping().await?;
                }
                Ok(())
            }
            Outgoing::Oneway(msg) => {
                self.exchange_deadline();
                self.proto.write_message(&msg).await?;
                if !msg.oneway_continue() {
                    return Err(BrokerError::abort("session broken for reason").into());
                }
                self.ping_timer_reset();
                Ok(())
            }
            Outgoing::Broadcast => self.deliver(exchange.as_ref(), true).await,
            Outgoing::Notifications => self.deliver(exchange.as_ref(), false).await,
        }
    }

    /// Sends the scratch area BROADCAST (or NOTIFICATIONS) window by window,
    /// reading an ACK for each.
    async fn deliver(&mut self, exchange: &dyn Exchange, broadcast: bool) -> Result<(), SessionError> {
        loop {
            let scratch = self.sess.scratch_mut();
            let done = if broadcast {
                scratch.broadcast.split()
            } else {
                scratch.notifications.split()
            };
            self.exchange_deadline();
            let scratch = self.sess.scratch();
            if broadcast {
                self.proto.write_message(&scratch.broadcast).await?;
            } else {
                self.proto.write_message(&scratch.notifications).await?;
            }
            let ack: AckMsg = self.proto.read_message().await?;
            self.sess.scratch_mut().ack = ack;
            if done {
                self.ping_timer_reset();
            }
            exchange.acked(self.sess, done)?;
            if done {
                return Ok(());
            }
        }
    }
}
