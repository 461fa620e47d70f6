//! mesa client entry point.
//!
//! A headless player host: it builds a notification hub, attaches the
//! network [`Connection`] and a logging receptor, asks the connection to
//! connect, and then pumps the hub once per tick until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! mesa-client [OPTIONS]
//!
//! Options:
//!   --config  <PATH>          TOML config file [default: mesa.toml]
//!   --id      <ID>            Network id to announce [default: client-<uuid>]
//!   --address <HOST[:PORT]>   Server address; omit to auto-discover
//! ```
//!
//! # Pump loop (for beginners)
//!
//! Nothing in the network layer runs on its own.  Every tick the loop below
//! calls [`Hub::pump`], which publishes a `TimerTick`; the connection reacts
//! to it by processing whatever socket completions have arrived since the
//! last tick.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mesa_client::infrastructure::network::{Connection, ConnectionConfig};
use mesa_core::{load_config, Bus, Hub, Kind, Notification, Receptor, ReceptorId};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Headless mesa player.
#[derive(Debug, Parser)]
#[command(name = "mesa-client", about = "Headless mesa tabletop client", version)]
struct Cli {
    /// Path of the TOML configuration file.  Missing files mean defaults.
    #[arg(long, default_value = "mesa.toml", env = "MESA_CONFIG")]
    config: PathBuf,

    /// Network id announced to the server.
    #[arg(long, env = "MESA_CLIENT_ID")]
    id: Option<String>,

    /// Server address as `host[:port]`.  Omit to wait for a UDP announcement.
    #[arg(long, env = "MESA_SERVER_ADDRESS")]
    address: Option<String>,
}

// ── Logging receptor ──────────────────────────────────────────────────────────

/// Stands in for the UI: logs what the network layer reports.
struct ConsoleReceptor {
    id: ReceptorId,
}

impl Receptor for ConsoleReceptor {
    fn receptor_id(&self) -> ReceptorId {
        self.id
    }

    fn handle_local(&mut self, n: &Notification) -> bool {
        match (n.kind, n.error.as_deref()) {
            (Kind::TimerTick, _) => return false,
            (Kind::ConnectResponse, Some(e)) => error!("connection failed: {e}"),
            (Kind::ConnectResponse, None) => {
                info!("connected as {}", n.client_id.as_deref().unwrap_or("?"))
            }
            (Kind::Disconnected, Some(e)) => warn!("disconnected: {e}"),
            (Kind::Disconnected, None) => info!("disconnected"),
            (kind, _) => info!(
                "{kind:?} from {:?} ({} payload bytes)",
                n.client_id,
                n.payload.len()
            ),
        }
        true
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    let client_id = cli
        .id
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
    info!("mesa client starting as '{client_id}'");

    let bus = Bus::new();
    let mut hub = Hub::with_bus(bus.clone());
    hub.register_local(Box::new(ConsoleReceptor {
        id: bus.allocate_id(),
    }));
    hub.attach(Box::new(Connection::new(
        bus.clone(),
        ConnectionConfig::from(&config),
    )));

    let mut connect = Notification::new(Kind::Connect).with_client_id(client_id);
    if let Some(address) = cli.address {
        connect = connect.with_address(address);
    }
    hub.enqueue(connect);

    let mut ticker = tokio::time::interval(Duration::from_millis(
        config.timing.tick_interval_ms.max(1),
    ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                hub.pump();
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("failed to listen for Ctrl+C: {e}");
                }
                break;
            }
        }
    }

    info!("shutting down");
    hub.enqueue(Notification::new(Kind::Disconnect));
    hub.dispatch();
    // Deliver the resulting Disconnected to the console.
    hub.dispatch();
    Ok(())
}
