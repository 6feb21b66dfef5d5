//! CLI for pushd
//!
//! Subcommands:
//! - `server`: run the device listener and the HTTP API
//! - `client`: connect as a device and print what arrives (useful for smoke tests)

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use pushd::broker::SimpleBroker;
use pushd::client::DeviceClient;
use pushd::config::{Settings, StoreBackend, load_config};
use pushd::persistence::{InMemoryPendingStore, PendingStore, SledPendingStore};
use pushd::transport::{ApiState, DeviceListener, StatsAuth, load_tls_acceptor, serve_api};
use pushd::utils::{self, logging};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pushd")]
enum Command {
    /// Start the push server
    Server,
    /// Connect as a device and print the received events
    Client {
        /// Device listener address
        #[arg(long, default_value = "127.0.0.1:9090")]
        addr: String,
        #[arg(long, default_value = "pushd-client")]
        device_id: String,
        /// Known channel levels, as `<hex channel id>=<level>`
        #[arg(long = "level", value_parser = parse_level)]
        levels: Vec<(String, i64)>,
    },
}

fn parse_level(s: &str) -> Result<(String, i64), String> {
    let (chan, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <channel>=<level>, got {s:?}"))?;
    let level = level.parse().map_err(|e| format!("level of {chan}: {e}"))?;
    Ok((chan.to_string(), level))
}

#[tokio::main]
async fn main() {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let cmd = Command::parse();
    match cmd {
        Command::Server => {
            if let Err(e) = run_server().await {
                // the configured level may never have been applied
                logging::init("info");
                error!("Server failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Client {
            addr,
            device_id,
            levels,
        } => {
            logging::init("info");
            if let Err(e) = run_client(&addr, &device_id, levels.into_iter().collect()).await {
                error!("Client failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn open_store(settings: &Settings) -> utils::error::Result<Arc<dyn PendingStore>> {
    let store: Arc<dyn PendingStore> = match settings.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryPendingStore::new()),
        StoreBackend::Sled => {
            info!("opening sled store at {}", settings.store.path);
            Arc::new(SledPendingStore::new(
                &settings.store.path,
                settings.store.max_messages_per_channel,
            )?)
        }
    };
    Ok(store)
}

async fn run_server() -> utils::error::Result<()> {
    let settings = load_config()?;
    logging::init(&settings.log.level);

    let store = open_store(&settings)?;
    let broker = Arc::new(SimpleBroker::new(store.clone(), settings.broker.into()));
    broker.start().await;

    let tls = match (&settings.server.cert_pem_file, &settings.server.key_pem_file) {
        (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
        _ => {
            warn!("no TLS material configured, devices connect over plain TCP");
            None
        }
    };
    let devices = DeviceListener::bind(&settings.server.addr, tls).await?;
    let http = tokio::net::TcpListener::bind(&settings.server.http_addr).await?;
    info!("HTTP API listening on {}", settings.server.http_addr);
    let mut api = ApiState::new(
        store,
        broker.clone(),
        broker.stats(),
        settings.store.max_notifications_per_app,
    );
    api.delivery_hosts = vec![devices.local_addr()?.to_string()];
    api.delivery_domain = settings.server.delivery_domain.clone();
    if let (Some(user), Some(password)) = (
        settings.server.stats_user.clone(),
        settings.server.stats_password.clone(),
    ) {
        api.stats_auth = Some(StatsAuth { user, password });
    }

    let result: utils::error::Result<()> = tokio::select! {
        res = devices.accept_loop(broker.clone(), settings.session.into()) => {
            error!("device listener exited unexpectedly");
            res.map_err(Into::into)
        }
        res = serve_api(http, api) => {
            error!("HTTP API exited unexpectedly");
            res.map_err(Into::into)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };
    broker.stop().await;
    result
}

async fn run_client(
    addr: &str,
    device_id: &str,
    levels: HashMap<String, i64>,
) -> Result<(), pushd::client::ClientError> {
    let mut client = DeviceClient::new(device_id).with_levels(levels);
    let (tx, mut rx) = mpsc::channel(16);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            println!("{event:?}");
        }
    });
    let res = client.dial(addr, tx).await;
    let _ = printer.await;
    res
}
