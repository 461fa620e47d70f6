//! UDP auto-discovery of a server on the local network.
//!
//! The server broadcasts a short datagram on the announce port once a second
//! (see `mesa_server::infrastructure::network::announcer`).  The client binds
//! that port, waits for one datagram and derives the server address from the
//! sender:
//!
//! - a payload of 1 to 9 bytes is a port suffix: `"[<sender-ip>]:<payload>"`;
//! - anything else (empty, or a full 10-byte buffer) means "use the default
//!   port": `"[<sender-ip>]"`.
//!
//! # Timeout
//!
//! There is no OS timer.  The owning connection calls [`Discovery::tick`] on
//! every `TimerTick`; each call adds one tick to the elapsed counter and the
//! wait is abandoned once `elapsed_ticks * tick_interval_ms` exceeds the
//! budget.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Size of the receive buffer; a datagram filling it carries no port.
pub const DISCOVERY_BUFFER_LEN: usize = 10;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Result of advancing a discovery by one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPoll {
    /// Still waiting for a reply.
    Waiting,
    /// A server answered; the value is an address for `parse_address`.
    Found(String),
    /// The budget ran out with no reply.
    TimedOut,
    /// The receive itself failed.
    Failed(String),
}

type Reply = io::Result<(Vec<u8>, SocketAddr)>;

/// One in-progress discovery.  Dropping it closes the socket.
pub struct Discovery {
    elapsed_ticks: u64,
    tick_interval_ms: u64,
    timeout_ms: u64,
    reply: oneshot::Receiver<Reply>,
    task: JoinHandle<()>,
}

impl Discovery {
    /// Binds `0.0.0.0:announce_port` and starts waiting for one datagram.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::BindFailed`] if the port cannot be bound.
    pub fn open(
        announce_port: u16,
        tick_interval_ms: u64,
        timeout_ms: u64,
    ) -> Result<Self, DiscoveryError> {
        let bind_failed = |source| DiscoveryError::BindFailed {
            port: announce_port,
            source,
        };
        let std_socket =
            StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, announce_port)).map_err(bind_failed)?;
        std_socket.set_nonblocking(true).map_err(bind_failed)?;
        let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;

        let (tx, reply) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; DISCOVERY_BUFFER_LEN];
            let result = socket
                .recv_from(&mut buf)
                .await
                .map(|(n, from)| (buf[..n].to_vec(), from));
            let _ = tx.send(result);
        });

        info!("waiting for a server announcement on UDP port {announce_port}");
        Ok(Self {
            elapsed_ticks: 0,
            tick_interval_ms: tick_interval_ms.max(1),
            timeout_ms,
            reply,
            task,
        })
    }

    pub fn elapsed_ticks(&self) -> u64 {
        self.elapsed_ticks
    }

    /// Advances the tick counter, then checks for a reply and the budget.
    ///
    /// A reply that is already waiting wins over an expiring budget.
    pub fn tick(&mut self) -> DiscoveryPoll {
        self.elapsed_ticks += 1;
        match self.reply.try_recv() {
            Ok(Ok((payload, from))) => {
                debug!("announcement from {from}: {:?}", String::from_utf8_lossy(&payload));
                return DiscoveryPoll::Found(announced_address(&payload, from));
            }
            Ok(Err(e)) => return DiscoveryPoll::Failed(e.to_string()),
            Err(oneshot::error::TryRecvError::Closed) => {
                return DiscoveryPoll::Failed("discovery socket closed".to_string());
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
        if self.elapsed_ticks.saturating_mul(self.tick_interval_ms) > self.timeout_ms {
            DiscoveryPoll::TimedOut
        } else {
            DiscoveryPoll::Waiting
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Builds the connect address from an announcement.
pub fn announced_address(payload: &[u8], from: SocketAddr) -> String {
    let host = format!("[{}]", from.ip());
    if !payload.is_empty() && payload.len() < DISCOVERY_BUFFER_LEN {
        format!("{host}:{}", String::from_utf8_lossy(payload))
    } else {
        host
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
