//! mesa server entry point.
//!
//! Builds a notification hub, attaches the [`Server`] receptor and a
//! session receptor, starts listening and pumps the hub once per tick until
//! Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! mesa-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>   TOML config file [default: mesa.toml]
//!   --port   <PORT>   Game port, overrides the config file
//! ```
//!
//! There is no table here, so the session receptor answers every snapshot
//! request with an empty snapshot.  That is enough for players to be moved
//! from pending to active and join the relay.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mesa_core::{load_config, Bus, Hub, Kind, Notification, Origin, Receptor, ReceptorId};
use mesa_server::infrastructure::network::{Server, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Headless mesa session server.
#[derive(Debug, Parser)]
#[command(name = "mesa-server", about = "Headless mesa tabletop server", version)]
struct Cli {
    /// Path of the TOML configuration file.  Missing files mean defaults.
    #[arg(long, default_value = "mesa.toml", env = "MESA_CONFIG")]
    config: PathBuf,

    /// TCP port players connect to.
    #[arg(long, env = "MESA_GAME_PORT")]
    port: Option<u16>,
}

// ── Session receptor ──────────────────────────────────────────────────────────

/// Logs network events and hands newcomers an empty table.
struct SessionReceptor {
    id: ReceptorId,
    bus: Bus,
}

impl Receptor for SessionReceptor {
    fn receptor_id(&self) -> ReceptorId {
        self.id
    }

    fn handle_local(&mut self, n: &Notification) -> bool {
        match n.kind {
            Kind::TimerTick => return false,
            Kind::StateSnapshot
                if n.for_pending_clients && n.origin == Origin::Local && !n.remote =>
            {
                debug!("answering snapshot request");
                self.bus.enqueue(
                    Notification::remote(Kind::StateSnapshot).for_pending_clients(),
                );
            }
            Kind::Error => warn!(
                "{}",
                n.error.as_deref().unwrap_or("unspecified network error")
            ),
            Kind::Disconnected => info!("player {:?} left", n.client_id),
            Kind::ConnectResponse => info!("player {:?} joined", n.client_id),
            kind => debug!(
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
    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.network.game_port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    info!("mesa server starting on port {}", config.network.game_port);

    let bus = Bus::new();
    let mut hub = Hub::with_bus(bus.clone());
    hub.register_local(Box::new(SessionReceptor {
        id: bus.allocate_id(),
        bus: bus.clone(),
    }));
    hub.attach(Box::new(Server::new(
        bus.clone(),
        ServerConfig::from(&config),
    )));
    hub.enqueue(Notification::new(Kind::Start));

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
    hub.enqueue(Notification::new(Kind::Stop));
    hub.dispatch();
    Ok(())
}
