use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::TransportError;
use crate::broker::Broker;
use crate::session::{SessionConfig, SessionTracker, run_session};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Builds a TLS acceptor from a PEM certificate chain and a PEM private key.
pub fn load_tls_acceptor(
    cert_pem_file: impl AsRef<Path>,
    key_pem_file: impl AsRef<Path>,
) -> Result<TlsAcceptor, TransportError> {
    let cert_chain = CertificateDer::pem_file_iter(cert_pem_file)?
        .collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(key_pem_file)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Listens for device connections, running a session per connection.
pub struct DeviceListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl DeviceListener {
    /// Binds the listener; without an acceptor sessions run over plain TCP.
    pub async fn bind(addr: &str, tls: Option<TlsAcceptor>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever. Temporary accept errors are retried.
    pub async fn accept_loop(
        self,
        broker: Arc<dyn Broker>,
        cfg: SessionConfig,
    ) -> Result<(), TransportError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("listening for devices on {addr} (tls: {})", self.tls.is_some());
        }
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_temporary(&e) => {
                    warn!("device listener: {e} -- retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
                Err(e) => {
                    error!("device listener: {e}");
                    return Err(e.into());
                }
            };
            let broker = broker.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer, tls, broker, cfg).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    broker: Arc<dyn Broker>,
    cfg: SessionConfig,
) {
    let _ = stream.set_nodelay(true);
    match tls {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(cfg.exchange_timeout, acceptor.accept(stream));
            match handshake.await {
                Ok(Ok(stream)) => serve(stream, peer, broker.as_ref(), cfg).await,
                Ok(Err(e)) => debug!("tls handshake with {peer} failed: {e}"),
                Err(_) => debug!("tls handshake with {peer} timed out"),
            }
        }
        None => serve(stream, peer, broker.as_ref(), cfg).await,
    }
}

async fn serve<S>(stream: S, peer: SocketAddr, broker: &dyn Broker, cfg: SessionConfig)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut track = SessionTracker::new();
    // the tracker already logged how the session ended
    let _ = run_session(stream, peer, broker, cfg, &mut track).await;
}

fn is_temporary(e: &io::Error) -> bool {
    // out of file descriptors (ENFILE, EMFILE) passes once sessions end
    if e.raw_os_error().is_some_and(|code| code == 23 || code == 24) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
