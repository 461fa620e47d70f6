//! mesa-client library entry point.
//!
//! Re-exports the module tree so that integration tests in `tests/` and the
//! binary entry point in `main.rs` share it.
//!
//! # What does mesa-client do? (for beginners)
//!
//! A tabletop session has one server and any number of players.  Each
//! player process runs a [`Connection`](infrastructure::network::Connection)
//! receptor on its notification hub.  When the board publishes a
//! remote-flagged notification (a moved token, a dice roll) the connection
//! writes it to the server, and everything the server relays from other
//! players comes back out of the hub as ordinary local notifications.
//!
//! The server can be found two ways:
//!
//! 1. An explicit `host[:port]` in the `Connect` notification.
//! 2. An empty address, which listens for the server's UDP announcement
//!    and connects to whoever sent it.

/// Infrastructure layer: network I/O.
pub mod infrastructure;
