//! Server: accepts players, onboards them and fans their notifications out.
//!
//! # Pending and active clients (for beginners)
//!
//! A freshly accepted socket is not ready for the live notification stream:
//! it first needs a full copy of the table.  So the server keeps two lists.
//!
//! - **pending** – accepted, waiting for a state snapshot.  On accept the
//!   server publishes a local `StateSnapshot` request marked
//!   `for_pending_clients`; whoever owns the table answers with a
//!   remote-flagged snapshot carrying the same marker.  The socket is
//!   already being read so a hang-up is noticed, and an identifying
//!   `ConnectResponse` is captured and published right away.  Any other
//!   frame is held until activation.
//! - **active** – the snapshot went out.  Held frames are processed and the
//!   client takes part in the broadcast fan-out.
//!
//! ```text
//!  accept ──▶ pending ── remote StateSnapshot{for_pending} ──▶ active
//!                │                                               │
//!                └── remote Error{for_pending} (rejected) ──▶ removed ◀── I/O / protocol error
//! ```
//!
//! # Relaying
//!
//! Every frame an active client sends is forwarded byte for byte to every
//! *other* active client, then decoded and published locally.  Frames from
//! one client keep their order at every peer; frames from different clients
//! may interleave.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::time::Duration;

use mesa_core::config::NetConfig;
use mesa_core::protocol::address::{DEFAULT_ANNOUNCE_PORT, DEFAULT_GAME_PORT};
use mesa_core::protocol::codec::{
    decode_notification, encode_frame, frame_notification, FrameDecoder, OversizePolicy,
    ProtocolError, DEFAULT_MAX_FRAME_LEN,
};
use mesa_core::transport::{SendQueue, SocketId, Stream, StreamEvent, StreamEventRx, StreamEventTx};
use mesa_core::{Bus, Kind, Notification, Origin, Receptor, ReceptorId};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::announcer::Announcer;

/// Pause before re-arming `accept` after it failed (e.g. out of descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Error type for server operations and client removal reasons.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("duplicate client id '{0}'")]
    DuplicateClientId(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("error receiving data: {0}")]
    Receive(#[source] io::Error),

    #[error("error sending data: {0}")]
    Send(#[source] io::Error),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Settings for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub game_port: u16,
    pub announce_port: u16,
    pub tick_interval_ms: u64,
    pub announce_interval_ms: u64,
    pub max_frame_len: usize,
    pub oversize_policy: OversizePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            game_port: DEFAULT_GAME_PORT,
            announce_port: DEFAULT_ANNOUNCE_PORT,
            tick_interval_ms: 30,
            announce_interval_ms: 1000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            oversize_policy: OversizePolicy::Warn,
        }
    }
}

impl From<&NetConfig> for ServerConfig {
    fn from(cfg: &NetConfig) -> Self {
        Self {
            bind_address: cfg.network.bind_address.clone(),
            game_port: cfg.network.game_port,
            announce_port: cfg.network.announce_port,
            tick_interval_ms: cfg.timing.tick_interval_ms,
            announce_interval_ms: cfg.timing.announce_interval_ms,
            max_frame_len: cfg.limits.max_frame_len,
            oversize_policy: cfg.limits.oversize_policy(),
        }
    }
}

type Accepted = (SocketId, io::Result<TcpStream>);

/// One connected player.
struct ClientRecord {
    stream: Stream,
    /// Empty until the client identifies itself.
    id: String,
    decoder: FrameDecoder,
    queue: SendQueue,
    /// Frames received while pending, replayed on activation.
    held: Vec<Vec<u8>>,
}

impl ClientRecord {
    fn key(&self) -> SocketId {
        self.stream.id()
    }

    fn send(&mut self, frame: Vec<u8>) {
        if let Some(bytes) = self.queue.push(frame) {
            self.stream.write(bytes);
        }
    }

    fn matches(&self, wanted: Option<&str>) -> bool {
        wanted.map_or(true, |id| id == self.id)
    }
}

/// Listener state that exists only while the server is started.
struct Listening {
    listener: SocketId,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    announcer: Option<Announcer>,
}

impl Drop for Listening {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Server-side receptor.
pub struct Server {
    id: ReceptorId,
    bus: Bus,
    config: ServerConfig,
    listening: Option<Listening>,
    pending: Vec<ClientRecord>,
    active: Vec<ClientRecord>,
    next_socket: SocketId,
    accepts_tx: mpsc::UnboundedSender<Accepted>,
    accepts_rx: mpsc::UnboundedReceiver<Accepted>,
    events_tx: StreamEventTx,
    events_rx: StreamEventRx,
}

impl Server {
    /// Creates a stopped server and subscribes it to local delivery on
    /// `bus`.  Hand it to the hub with [`mesa_core::Hub::attach`].
    pub fn new(bus: Bus, config: ServerConfig) -> Self {
        let id = bus.allocate_id();
        bus.register_local(id);
        let (accepts_tx, accepts_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            bus,
            config,
            listening: None,
            pending: Vec::new(),
            active: Vec::new(),
            next_socket: SocketId::new(1),
            accepts_tx,
            accepts_rx,
            events_tx,
            events_rx,
        }
    }

    pub fn is_started(&self) -> bool {
        self.listening.is_some()
    }

    /// Address the listener is bound to, while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening.as_ref().map(|l| l.local_addr)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ids of the pending clients that have identified themselves.
    pub fn pending_client_ids(&self) -> Vec<String> {
        identified(&self.pending)
    }

    /// Ids of the active clients that have identified themselves.
    pub fn active_client_ids(&self) -> Vec<String> {
        identified(&self.active)
    }

    /// Opens the listener.  Failure is reported as an `Error` notification
    /// and leaves the server stopped.
    pub fn start(&mut self) {
        if let Err(e) = self.try_start() {
            error!("failed to start server: {e}");
            self.bus.enqueue(Notification::error(Kind::Error, e.to_string()));
        }
    }

    /// Releases the listener and drops every client.
    pub fn stop(&mut self) {
        let Some(listening) = self.listening.take() else {
            error!("server is already stopped");
            return;
        };
        self.bus.deregister_remote(self.id);
        drop(listening);
        let dropped = self.pending.len() + self.active.len();
        self.pending.clear();
        self.active.clear();
        while self.accepts_rx.try_recv().is_ok() {}
        info!("server stopped, {dropped} client(s) dropped");
    }

    fn try_start(&mut self) -> Result<(), ServerError> {
        if self.listening.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let ip: IpAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|_| ServerError::InvalidBindAddress(self.config.bind_address.clone()))?;
        let addr = SocketAddr::new(ip, self.config.game_port);
        let bind_failed = |source| ServerError::Bind { addr, source };

        let std_listener = StdTcpListener::bind(addr).map_err(bind_failed)?;
        std_listener.set_nonblocking(true).map_err(bind_failed)?;
        let local_addr = std_listener.local_addr().map_err(bind_failed)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_failed)?;

        let listener_id = self.next_socket.bump();
        let accept_task = tokio::spawn(accept_loop(listener_id, listener, self.accepts_tx.clone()));

        let announcer = match Announcer::open(
            Announcer::broadcast_target(self.config.announce_port),
            local_addr.port(),
            self.config.tick_interval_ms,
            self.config.announce_interval_ms,
        ) {
            Ok(announcer) => Some(announcer),
            Err(e) => {
                error!("failed to open broadcast socket: {e}");
                None
            }
        };

        self.listening = Some(Listening {
            listener: listener_id,
            local_addr,
            accept_task,
            announcer,
        });
        self.bus.register_remote(self.id);
        info!("server listening on {local_addr}");
        Ok(())
    }

    /// One `TimerTick`: announce if due, then drain I/O completions.
    fn on_tick(&mut self) {
        if let Some(announcer) = self.listening.as_mut().and_then(|l| l.announcer.as_mut()) {
            announcer.tick();
        }
        while let Ok((listener, result)) = self.accepts_rx.try_recv() {
            self.on_accept(listener, result);
        }
        while let Ok((key, event)) = self.events_rx.try_recv() {
            self.on_stream_event(key, event);
        }
    }

    fn on_accept(&mut self, listener: SocketId, result: io::Result<TcpStream>) {
        if self.listening.as_ref().map(|l| l.listener) != Some(listener) {
            trace!("ignoring accept from retired listener {listener}");
            return;
        }
        let tcp = match result {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {e}");
        }
        let key = self.next_socket.bump();
        let mut stream = Stream::new(key, tcp, self.events_tx.clone());
        stream.start_reading();
        info!("accepted {:?} as pending client {key}", stream.peer_addr());
        self.pending.push(ClientRecord {
            stream,
            id: String::new(),
            decoder: FrameDecoder::new(self.config.max_frame_len, self.config.oversize_policy),
            queue: SendQueue::new(),
            held: Vec::new(),
        });
        self.bus
            .enqueue(Notification::new(Kind::StateSnapshot).for_pending_clients());
    }

    fn on_stream_event(&mut self, key: SocketId, event: StreamEvent) {
        match event {
            StreamEvent::Data(bytes) => self.on_data(key, &bytes),
            StreamEvent::Written => {
                if let Some((client, _)) = self.find_mut(key) {
                    if let Some(bytes) = client.queue.complete() {
                        client.stream.write(bytes);
                    }
                }
            }
            StreamEvent::Closed => self.remove_client(key, ServerError::ConnectionClosed),
            StreamEvent::ReadFailed(e) => self.remove_client(key, ServerError::Receive(e)),
            StreamEvent::WriteFailed(e) => self.remove_client(key, ServerError::Send(e)),
        }
    }

    /// Runs one read through the client's decoder and handles every frame it
    /// completes before looking at the next read.
    fn on_data(&mut self, key: SocketId, bytes: &[u8]) {
        let Some((client, active)) = self.find_mut(key) else {
            trace!("ignoring data for unknown client {key}");
            return;
        };
        let frames = match client.decoder.push(bytes) {
            Ok(frames) => frames,
            Err(e) => {
                self.remove_client(key, e.into());
                return;
            }
        };
        for payload in frames {
            let handled = if active {
                self.on_frame(key, &payload)
            } else {
                self.on_pending_frame(key, payload)
            };
            if let Err(reason) = handled {
                self.remove_client(key, reason);
                return;
            }
        }
    }

    /// A frame from a client still waiting for its snapshot.  Identification
    /// takes effect at once so snapshots can be targeted at it.
    fn on_pending_frame(&mut self, key: SocketId, payload: Vec<u8>) -> Result<(), ServerError> {
        let notification = decode_notification(&payload)?;
        let claimed = match (&notification.kind, notification.client_id.as_deref()) {
            (Kind::ConnectResponse, Some(id)) if !id.is_empty() => Some(id.to_string()),
            _ => None,
        };
        if let Some(claimed) = claimed {
            self.identify(key, &claimed)?;
            self.bus.enqueue(notification.into_inbound());
            return Ok(());
        }
        if let Some(client) = self.pending.iter_mut().find(|c| c.key() == key) {
            client.held.push(payload);
        }
        Ok(())
    }

    fn find_mut(&mut self, key: SocketId) -> Option<(&mut ClientRecord, bool)> {
        if let Some(client) = self.active.iter_mut().find(|c| c.key() == key) {
            return Some((client, true));
        }
        self.pending
            .iter_mut()
            .find(|c| c.key() == key)
            .map(|client| (client, false))
    }

    fn on_frame(&mut self, key: SocketId, payload: &[u8]) -> Result<(), ServerError> {
        let notification = decode_notification(payload)?;
        if notification.kind == Kind::ConnectResponse {
            if let Some(claimed) = notification.client_id.as_deref().filter(|id| !id.is_empty()) {
                self.identify(key, claimed)?;
            }
        }

        let frame = encode_frame(payload)?;
        for other in self.active.iter_mut().filter(|c| c.key() != key) {
            other.send(frame.clone());
        }
        self.bus.enqueue(notification.into_inbound());
        Ok(())
    }

    fn identify(&mut self, key: SocketId, claimed: &str) -> Result<(), ServerError> {
        let taken = self
            .active
            .iter()
            .chain(self.pending.iter())
            .any(|c| c.key() != key && c.id == claimed);
        if taken {
            return Err(ServerError::DuplicateClientId(claimed.to_string()));
        }
        if let Some((client, _)) = self.find_mut(key) {
            info!("client {key} identified as '{claimed}'");
            client.id = claimed.to_string();
        }
        Ok(())
    }

    /// Removes the client from whichever list holds it and reports why.
    /// Unknown keys are ignored.
    fn remove_client(&mut self, key: SocketId, reason: ServerError) {
        let record = if let Some(pos) = self.active.iter().position(|c| c.key() == key) {
            self.active.remove(pos)
        } else if let Some(pos) = self.pending.iter().position(|c| c.key() == key) {
            self.pending.remove(pos)
        } else {
            return;
        };
        let client_id = record.id.clone();
        drop(record);

        warn!("dropping client {key} '{client_id}': {reason}");
        let mut failure =
            Notification::error(Kind::Error, format!("client '{client_id}': {reason}"));
        let mut gone = Notification::new(Kind::Disconnected);
        if !client_id.is_empty() {
            failure = failure.with_client_id(client_id.clone());
            gone = gone.with_client_id(client_id);
        }
        self.bus.enqueue(failure);
        self.bus.enqueue(gone);
    }

    /// Routes a remote-flagged notification to the clients it is meant for.
    fn route(&mut self, notification: &Notification) {
        if self.listening.is_none() {
            debug!("server stopped, dropping outbound {:?}", notification.kind);
            return;
        }
        let wanted = notification.client_id.as_deref();

        if notification.for_pending_clients {
            let (targets, rest): (Vec<ClientRecord>, Vec<ClientRecord>) =
                std::mem::take(&mut self.pending)
                    .into_iter()
                    .partition(|c| c.matches(wanted));
            self.pending = rest;
            if targets.is_empty() {
                warn!("no pending client matches {wanted:?}");
                return;
            }

            if notification.kind == Kind::Error {
                let reason = notification
                    .error
                    .clone()
                    .unwrap_or_else(|| "rejected by server".to_string());
                for client in targets {
                    let key = client.key();
                    // Put it back so removal reports it like any other drop.
                    self.pending.push(client);
                    self.remove_client(key, ServerError::Rejected(reason.clone()));
                }
                return;
            }

            let frame = match frame_notification(notification) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode snapshot: {e}");
                    self.pending.extend(targets);
                    return;
                }
            };
            for mut client in targets {
                let key = client.key();
                client.send(frame.clone());
                let held = std::mem::take(&mut client.held);
                info!("client {key} is now active");
                self.active.push(client);
                for payload in held {
                    if let Err(reason) = self.on_frame(key, &payload) {
                        self.remove_client(key, reason);
                        break;
                    }
                }
            }
        } else {
            let frame = match frame_notification(notification) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode outbound {:?}: {e}", notification.kind);
                    return;
                }
            };
            for client in self.active.iter_mut().filter(|c| c.matches(wanted)) {
                client.send(frame.clone());
            }
        }
    }
}

fn identified(clients: &[ClientRecord]) -> Vec<String> {
    clients
        .iter()
        .filter(|c| !c.id.is_empty())
        .map(|c| c.id.clone())
        .collect()
}

async fn accept_loop(
    listener_id: SocketId,
    listener: TcpListener,
    accepts: mpsc::UnboundedSender<Accepted>,
) {
    loop {
        let result = listener.accept().await.map(|(stream, _)| stream);
        let failed = result.is_err();
        if accepts.send((listener_id, result)).is_err() {
            break;
        }
        if failed {
            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
        }
    }
}

impl Receptor for Server {
    fn receptor_id(&self) -> ReceptorId {
        self.id
    }

    fn handle_local(&mut self, notification: &Notification) -> bool {
        // A player must not be able to start or stop the server.
        if notification.origin == Origin::Remote {
            return false;
        }
        match notification.kind {
            Kind::TimerTick => self.on_tick(),
            Kind::Start => self.start(),
            Kind::Stop => self.stop(),
            _ => return false,
        }
        true
    }

    fn handle_remote(&mut self, notification: &Notification) -> bool {
        self.route(notification);
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
