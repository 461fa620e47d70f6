//! Network infrastructure for the client role.
//!
//! [`Connection`] is a hub receptor that owns at most one TCP connection to a
//! session server.
//!
//! Architecture:
//! - Local notifications drive it: `Connect` (explicit address, or empty
//!   for UDP auto-discovery), `Disconnect`, and `TimerTick`.
//! - Remote-flagged notifications reach it through `handle_remote` once it is
//!   connected; each one is serialized, framed and queued for writing.
//! - Socket completions (connect finished, bytes read, write done) arrive on
//!   channels and are processed only on `TimerTick`, so every state change
//!   happens on the dispatch thread.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//!            Connect(addr)                 connect ok (on tick)
//!   Idle ─────────────────▶ Connecting ───────────────────────▶ Connected
//!    ▲  │                      │ connect failed                    │
//!    │  │ Connect("")          ▼                                   │
//!    │  └──▶ Discovering ──▶ (reply: Connect(found addr))          │
//!    │          │ timeout                                          │
//!    └──────────┴─────────────── Disconnect / I/O error ◀──────────┘
//! ```
//!
//! Every failure is reported as a notification: connect problems as an
//! errored `ConnectResponse`, and a lost connection as `Disconnected`
//! carrying the reason.

pub mod discovery;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use mesa_core::config::NetConfig;
use mesa_core::protocol::address::{parse_address, AddressError, DEFAULT_ANNOUNCE_PORT, DEFAULT_GAME_PORT, DEFAULT_HOST};
use mesa_core::protocol::codec::{
    decode_notification, frame_notification, FrameDecoder, OversizePolicy, ProtocolError,
    DEFAULT_MAX_FRAME_LEN,
};
use mesa_core::transport::{SendQueue, SocketId, Stream, StreamEvent, StreamEventRx, StreamEventTx};
use mesa_core::{Bus, Kind, Notification, Origin, Receptor, ReceptorId};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use discovery::{Discovery, DiscoveryError, DiscoveryPoll};

/// Errors that can occur in the client network layer.
///
/// None of these escape the receptor API: each one ends up as the `error`
/// text of a notification.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("discovery already in progress")]
    DiscoveryInProgress,

    #[error("already connected")]
    AlreadyConnected,

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The host name did not resolve to any address.
    #[error("could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// TCP connection to the server failed.
    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Settings for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub default_host: String,
    pub game_port: u16,
    pub announce_port: u16,
    pub tick_interval_ms: u64,
    pub discovery_timeout_ms: u64,
    pub max_frame_len: usize,
    pub oversize_policy: OversizePolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_host: DEFAULT_HOST.to_string(),
            game_port: DEFAULT_GAME_PORT,
            announce_port: DEFAULT_ANNOUNCE_PORT,
            tick_interval_ms: 30,
            discovery_timeout_ms: 3000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            oversize_policy: OversizePolicy::Warn,
        }
    }
}

impl From<&NetConfig> for ConnectionConfig {
    fn from(cfg: &NetConfig) -> Self {
        Self {
            default_host: cfg.network.default_host.clone(),
            game_port: cfg.network.game_port,
            announce_port: cfg.network.announce_port,
            tick_interval_ms: cfg.timing.tick_interval_ms,
            discovery_timeout_ms: cfg.timing.discovery_timeout_ms,
            max_frame_len: cfg.limits.max_frame_len,
            oversize_policy: cfg.limits.oversize_policy(),
        }
    }
}

type ConnectResult = (SocketId, Result<TcpStream, ConnectionError>);

enum Link {
    Idle,
    Connecting {
        socket: SocketId,
        client_id: String,
        task: JoinHandle<()>,
    },
    Connected {
        stream: Stream,
        decoder: FrameDecoder,
        queue: SendQueue,
    },
}

struct PendingDiscovery {
    discovery: Discovery,
    client_id: String,
}

/// Client-side connection receptor.
pub struct Connection {
    id: ReceptorId,
    bus: Bus,
    config: ConnectionConfig,
    link: Link,
    discovery: Option<PendingDiscovery>,
    next_socket: SocketId,
    connect_attempts: u64,
    connects_tx: mpsc::UnboundedSender<ConnectResult>,
    connects_rx: mpsc::UnboundedReceiver<ConnectResult>,
    events_tx: StreamEventTx,
    events_rx: StreamEventRx,
}

impl Connection {
    /// Creates an idle connection and subscribes it to local delivery on
    /// `bus`.  Hand it to the hub with [`mesa_core::Hub::attach`].
    pub fn new(bus: Bus, config: ConnectionConfig) -> Self {
        let id = bus.allocate_id();
        bus.register_local(id);
        let (connects_tx, connects_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            bus,
            config,
            link: Link::Idle,
            discovery: None,
            next_socket: SocketId::new(1),
            connect_attempts: 0,
            connects_tx,
            connects_rx,
            events_tx,
            events_rx,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected { .. })
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_some()
    }

    /// Number of TCP connection attempts started so far.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    /// Connects to `address` (`host[:port]`, defaults filled in) as
    /// `client_id`.  The outcome arrives as a `ConnectResponse` notification.
    pub fn connect_explicit(&mut self, client_id: &str, address: &str, local_port: Option<u16>) {
        if let Err(e) = self.try_connect_explicit(client_id, address, local_port) {
            warn!("connect to '{address}' failed: {e}");
            self.bus
                .enqueue(Notification::error(Kind::ConnectResponse, e.to_string()));
        }
    }

    /// Waits for a server announcement, then connects to it as `client_id`.
    pub fn connect_auto(&mut self, client_id: &str) {
        if let Err(e) = self.try_connect_auto(client_id) {
            warn!("auto-connect failed: {e}");
            self.bus
                .enqueue(Notification::error(Kind::ConnectResponse, e.to_string()));
        }
    }

    /// Closes the connection, reporting `reason` in the `Disconnected`
    /// notification.  Does nothing when not connected.
    pub fn disconnect(&mut self, reason: &str) {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => {}
            Link::Connecting { task, socket, .. } => {
                task.abort();
                info!("connection attempt {socket} cancelled");
                self.bus.enqueue(Notification::error(
                    Kind::ConnectResponse,
                    "connection attempt cancelled",
                ));
            }
            Link::Connected { stream, .. } => {
                info!("disconnecting {}: {reason}", stream.id());
                drop(stream);
                self.bus.deregister_remote(self.id);
                let mut n = Notification::new(Kind::Disconnected);
                if !reason.is_empty() {
                    n = n.with_error(reason);
                }
                self.bus.enqueue(n);
            }
        }
    }

    /// Serializes `notification` and queues it for writing.
    pub fn send(&mut self, notification: &Notification) {
        let Link::Connected { stream, queue, .. } = &mut self.link else {
            debug!("not connected, dropping outbound {:?}", notification.kind);
            return;
        };
        match frame_notification(notification) {
            Ok(frame) => {
                if let Some(bytes) = queue.push(frame) {
                    stream.write(bytes);
                }
            }
            Err(e) => error!("failed to encode outbound {:?}: {e}", notification.kind),
        }
    }

    fn try_connect_explicit(
        &mut self,
        client_id: &str,
        address: &str,
        local_port: Option<u16>,
    ) -> Result<(), ConnectionError> {
        if self.discovery.is_some() {
            return Err(ConnectionError::DiscoveryInProgress);
        }
        if !matches!(self.link, Link::Idle) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let (host, port) = parse_address(address, &self.config.default_host, self.config.game_port)?;

        let socket = self.next_socket.bump();
        self.connect_attempts += 1;
        info!("connecting to {host}:{port} as '{client_id}' ({socket})");
        let tx = self.connects_tx.clone();
        let task = tokio::spawn(async move {
            let result = open_stream(host, port, local_port).await;
            let _ = tx.send((socket, result));
        });
        self.link = Link::Connecting {
            socket,
            client_id: client_id.to_string(),
            task,
        };
        Ok(())
    }

    fn try_connect_auto(&mut self, client_id: &str) -> Result<(), ConnectionError> {
        if self.discovery.is_some() {
            return Err(ConnectionError::DiscoveryInProgress);
        }
        if !matches!(self.link, Link::Idle) {
            return Err(ConnectionError::AlreadyConnected);
        }
        let discovery = Discovery::open(
            self.config.announce_port,
            self.config.tick_interval_ms,
            self.config.discovery_timeout_ms,
        )?;
        self.discovery = Some(PendingDiscovery {
            discovery,
            client_id: client_id.to_string(),
        });
        Ok(())
    }

    /// One `TimerTick`: advance discovery, then drain I/O completions.
    fn on_tick(&mut self) {
        self.poll_discovery();
        while let Ok((socket, result)) = self.connects_rx.try_recv() {
            self.on_connect_result(socket, result);
        }
        while let Ok((socket, event)) = self.events_rx.try_recv() {
            self.on_stream_event(socket, event);
        }
    }

    fn poll_discovery(&mut self) {
        let Some(pending) = self.discovery.as_mut() else {
            return;
        };
        let outcome = pending.discovery.tick();
        if outcome == DiscoveryPoll::Waiting {
            return;
        }
        let Some(PendingDiscovery { client_id, .. }) = self.discovery.take() else {
            return;
        };
        match outcome {
            DiscoveryPoll::Found(address) => {
                info!("discovered server at {address}");
                self.connect_explicit(&client_id, &address, None);
            }
            DiscoveryPoll::TimedOut => {
                let message = "timed out waiting for a server announcement";
                error!("{message}");
                self.bus
                    .enqueue(Notification::error(Kind::ConnectResponse, message));
            }
            DiscoveryPoll::Failed(e) => {
                error!("discovery failed: {e}");
                self.bus.enqueue(Notification::error(
                    Kind::ConnectResponse,
                    format!("discovery failed: {e}"),
                ));
            }
            DiscoveryPoll::Waiting => {}
        }
    }

    fn on_connect_result(&mut self, socket: SocketId, result: Result<TcpStream, ConnectionError>) {
        let current = matches!(&self.link, Link::Connecting { socket: s, .. } if *s == socket);
        if !current {
            trace!("ignoring stale connect result for {socket}");
            return;
        }
        let Link::Connecting { client_id, .. } = std::mem::replace(&mut self.link, Link::Idle)
        else {
            return;
        };
        match result {
            Ok(tcp) => {
                let mut stream = Stream::new(socket, tcp, self.events_tx.clone());
                stream.start_reading();
                info!(
                    "connected to {:?} as '{client_id}' ({socket})",
                    stream.peer_addr()
                );
                self.link = Link::Connected {
                    stream,
                    decoder: FrameDecoder::new(self.config.max_frame_len, self.config.oversize_policy),
                    queue: SendQueue::new(),
                };
                self.bus.register_remote(self.id);
                // Local copy for the UI, remote copy identifies us to the server.
                self.bus.enqueue(
                    Notification::new(Kind::ConnectResponse)
                        .with_delivery(true, true)
                        .with_client_id(client_id),
                );
            }
            Err(e) => {
                warn!("{e}");
                self.bus
                    .enqueue(Notification::error(Kind::ConnectResponse, e.to_string()));
            }
        }
    }

    fn on_stream_event(&mut self, socket: SocketId, event: StreamEvent) {
        let Link::Connected {
            stream,
            decoder,
            queue,
        } = &mut self.link
        else {
            trace!("ignoring {event:?} for {socket}: not connected");
            return;
        };
        if stream.id() != socket {
            trace!("ignoring stale event for {socket}");
            return;
        }

        let reason = match event {
            StreamEvent::Data(bytes) => match receive(decoder, &bytes) {
                Ok(inbound) => {
                    for n in inbound {
                        self.bus.enqueue(n.into_inbound());
                    }
                    None
                }
                Err(e) => Some(format!("error receiving data from server: {e}")),
            },
            StreamEvent::Written => {
                if let Some(bytes) = queue.complete() {
                    stream.write(bytes);
                }
                None
            }
            StreamEvent::Closed => Some("connection closed by server".to_string()),
            StreamEvent::ReadFailed(e) => Some(format!("error receiving data: {e}")),
            StreamEvent::WriteFailed(e) => Some(format!("error sending data: {e}")),
        };
        if let Some(reason) = reason {
            error!("{reason}");
            self.disconnect(&reason);
        }
    }
}

/// Feeds one read into the decoder and parses every completed frame.
///
/// Parsing stops at the first bad frame; frames decoded before it are
/// dropped along with the connection.
fn receive(decoder: &mut FrameDecoder, bytes: &[u8]) -> Result<Vec<Notification>, ConnectionError> {
    let mut inbound = Vec::new();
    for payload in decoder.push(bytes)? {
        inbound.push(decode_notification(&payload)?);
    }
    Ok(inbound)
}

async fn open_stream(
    host: String,
    port: u16,
    local_port: Option<u16>,
) -> Result<TcpStream, ConnectionError> {
    let lookup = tokio::net::lookup_host((host.clone(), port)).await;
    let addrs = match lookup {
        Ok(addrs) => addrs,
        Err(source) => return Err(ConnectionError::Resolve { host, port, source }),
    };
    let mut last_error = None;
    for addr in addrs {
        match connect_one(addr, local_port).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    let source = last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"));
    Err(ConnectionError::ConnectFailed { host, port, source })
}

async fn connect_one(addr: SocketAddr, local_port: Option<u16>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // Ports at or below 1024 are privileged; those requests are ignored.
    if let Some(port) = local_port.filter(|p| *p > 1024) {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, port).into()
        };
        socket.set_reuseaddr(true)?;
        socket.bind(local)?;
    }
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl Receptor for Connection {
    fn receptor_id(&self) -> ReceptorId {
        self.id
    }

    fn handle_local(&mut self, notification: &Notification) -> bool {
        // Peers must not be able to steer our own connection.
        if notification.origin == Origin::Remote {
            return false;
        }
        match notification.kind {
            Kind::TimerTick => {
                self.on_tick();
                true
            }
            Kind::Connect => {
                let client_id = notification.client_id.clone().unwrap_or_default();
                match notification.address.as_deref() {
                    None | Some("") => self.connect_auto(&client_id),
                    Some(address) => {
                        self.connect_explicit(&client_id, address, notification.local_port)
                    }
                }
                true
            }
            Kind::Disconnect => {
                self.disconnect("");
                true
            }
            _ => false,
        }
    }

    fn handle_remote(&mut self, notification: &Notification) -> bool {
        self.send(notification);
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
