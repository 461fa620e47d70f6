//! Notification model and the in-process notification hub.
//!
//! A [`Notification`] is the unit of communication between every subsystem
//! of the tabletop: the board, the UI and the network layer all talk to
//! each other by publishing notifications into the [`hub::Hub`] and
//! reacting to the ones it dispatches to them.
//!
//! # Delivery flags (for beginners)
//!
//! Each notification carries two independent switches:
//!
//! - **`local`** – deliver it to in-process receptors (board, UI, ...).
//! - **`remote`** – deliver it to transport receptors, which serialize it
//!   and write it to the wire.
//!
//! A notification can have either, both or neither set.  Inbound
//! notifications decoded from a socket are always published with
//! `local = true, remote = false` and [`Origin::Remote`], so they reach the
//! board but are never bounced back onto the network.

pub mod hub;

use serde::{Deserialize, Serialize};

pub use hub::{Bus, Hub, Receptor, ReceptorId};

/// Kind tag of a notification.
///
/// Only the kinds the network core reacts to are named; everything the game
/// layer defines travels as [`Kind::Custom`] with an opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Request to connect: `client_id` is the local network id, `address`
    /// is `host[:port]` or empty for auto-discovery.
    Connect,
    /// Outcome of a connection attempt; carries `error` on failure.  Sent to
    /// the server on success as the client's identification.
    ConnectResponse,
    /// Request to drop the current connection.
    Disconnect,
    /// A connection (client side) or a client (server side) went away.
    Disconnected,
    /// Generic failure report.
    Error,
    /// Periodic pump; drives I/O completion processing and timeouts.
    TimerTick,
    /// Full state snapshot (or a request for one).
    StateSnapshot,
    /// Start the server.
    Start,
    /// Stop the server.
    Stop,
    /// Game-specific kind, opaque to the network core.
    Custom(u32),
}

/// Where a notification was created.  Not transmitted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    /// Created by a component of this process.
    #[default]
    Local,
    /// Decoded from bytes received from a peer.
    Remote,
}

/// An immutable tagged message travelling through the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: Kind,
    /// Deliver to local receptors.
    pub local: bool,
    /// Deliver to remote (transport) receptors.
    pub remote: bool,
    pub error: Option<String>,
    /// Network id of the peer this notification is about or addressed to.
    pub client_id: Option<String>,
    /// `host[:port]` for [`Kind::Connect`].
    pub address: Option<String>,
    /// Local TCP port to bind before connecting (only honoured above 1024).
    pub local_port: Option<u16>,
    /// Marks a [`Kind::StateSnapshot`] as destined for pending clients.
    pub for_pending_clients: bool,
    pub payload: Vec<u8>,
    #[serde(skip)]
    pub origin: Origin,
}

impl Notification {
    /// Creates a local-only notification of `kind`.
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            local: true,
            remote: false,
            error: None,
            client_id: None,
            address: None,
            local_port: None,
            for_pending_clients: false,
            payload: Vec::new(),
            origin: Origin::Local,
        }
    }

    /// Creates a remote-only notification of `kind`.
    pub fn remote(kind: Kind) -> Self {
        Self {
            local: false,
            remote: true,
            ..Self::new(kind)
        }
    }

    /// Creates a local-only notification of `kind` carrying `message` as error.
    pub fn error(kind: Kind, message: impl Into<String>) -> Self {
        Self::new(kind).with_error(message)
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn for_pending_clients(mut self) -> Self {
        self.for_pending_clients = true;
        self
    }

    /// Sets both delivery flags.
    pub fn with_delivery(mut self, local: bool, remote: bool) -> Self {
        self.local = local;
        self.remote = remote;
        self
    }

    /// Marks a decoded notification as received from a peer: delivered
    /// locally, never re-sent.
    pub fn into_inbound(mut self) -> Self {
        self.local = true;
        self.remote = false;
        self.origin = Origin::Remote;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_local_only() {
        let n = Notification::new(Kind::TimerTick);
        assert!(n.local);
        assert!(!n.remote);
        assert_eq!(n.origin, Origin::Local);
    }

    #[test]
    fn test_remote_is_remote_only() {
        let n = Notification::remote(Kind::Custom(7));
        assert!(!n.local);
        assert!(n.remote);
    }

    #[test]
    fn test_error_sets_message_and_kind() {
        let n = Notification::error(Kind::ConnectResponse, "refused");
        assert_eq!(n.kind, Kind::ConnectResponse);
        assert_eq!(n.error.as_deref(), Some("refused"));
        assert!(n.is_error());
    }

    #[test]
    fn test_into_inbound_forces_local_delivery_and_remote_origin() {
        // Arrange
        let n = Notification::remote(Kind::Custom(1)).with_delivery(false, true);

        // Act
        let inbound = n.into_inbound();

        // Assert
        assert!(inbound.local);
        assert!(!inbound.remote);
        assert_eq!(inbound.origin, Origin::Remote);
    }
}
