//! UDP broadcast announcing the server's game port.
//!
//! While the server runs, every `announce_interval_ms` worth of ticks it
//! broadcasts the decimal game port (e.g. `"11223"`) to
//! `255.255.255.255:<announce_port>`.  Clients doing auto-discovery bind the
//! announce port and connect to whoever sent the datagram.
//!
//! Sends are non-blocking and best effort; a lost announcement is simply
//! repeated on the next interval.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use tracing::{debug, trace};

/// Periodic announcement sender.  Dropping it closes the socket.
pub struct Announcer {
    socket: UdpSocket,
    target: SocketAddr,
    payload: Vec<u8>,
    tick_interval_ms: u64,
    announce_interval_ms: u64,
    ticks: u64,
}

impl Announcer {
    /// Opens a broadcast-enabled UDP socket.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the socket cannot be opened or configured.
    pub fn open(
        target: SocketAddr,
        game_port: u16,
        tick_interval_ms: u64,
        announce_interval_ms: u64,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            target,
            payload: game_port.to_string().into_bytes(),
            tick_interval_ms: tick_interval_ms.max(1),
            announce_interval_ms,
            ticks: 0,
        })
    }

    /// Broadcast target for `announce_port`.
    pub fn broadcast_target(announce_port: u16) -> SocketAddr {
        (Ipv4Addr::BROADCAST, announce_port).into()
    }

    /// Counts one tick and announces when the interval has elapsed.
    /// Returns `true` if a datagram was sent.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks.saturating_mul(self.tick_interval_ms) < self.announce_interval_ms {
            return false;
        }
        self.ticks = 0;
        match self.socket.send_to(&self.payload, self.target) {
            Ok(_) => {
                trace!("announced game port to {}", self.target);
                true
            }
            Err(e) => {
                debug!("announcement to {} failed: {e}", self.target);
                false
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
