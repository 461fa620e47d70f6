//! Network infrastructure for the server.
//!
//! # Sub-modules
//!
//! - **`server`** – Listens for players, keeps the pending and active client
//!   lists, onboards newcomers with a state snapshot and relays every frame
//!   an active player sends to all the other players.
//!
//! - **`announcer`** – Broadcasts the game port over UDP once per announce
//!   interval so clients can connect without manual address configuration.

pub mod announcer;
pub mod server;

pub use server::{Server, ServerConfig, ServerError};
