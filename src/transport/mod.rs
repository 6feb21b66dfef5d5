//! The `transport` module exposes the server to the network.
//!
//! - `listener`: the device listener, TLS (or plain TCP during development)
//!   connections each running a device session.
//! - `api`: the HTTP API applications use to send notifications, plus the
//!   `/delivery-hosts` and `/stats` endpoints.

pub mod api;
pub mod listener;

pub use api::{ApiError, ApiState, StatsAuth, router, serve_api};
pub use listener::{DeviceListener, load_tls_acceptor};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("pem: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),
}
