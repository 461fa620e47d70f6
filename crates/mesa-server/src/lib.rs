//! mesa-server library entry point.
//!
//! Re-exports the module tree so that integration tests in `tests/` and the
//! binary entry point in `main.rs` share it.
//!
//! # What does mesa-server do? (for beginners)
//!
//! The server is the meeting point of a tabletop session.  It listens for
//! players on the game port, advertises that port over UDP broadcast so
//! players on the LAN can find it, and relays every notification one
//! player sends to all the others.
//!
//! Before a new player joins the relay it must receive a snapshot of the
//! table.  The [`Server`](infrastructure::network::server::Server) asks for
//! one by publishing a local `StateSnapshot` request; the table owner
//! answers with a remote-flagged snapshot that the server delivers to the
//! waiting player.

/// Infrastructure layer: network I/O.
pub mod infrastructure;
