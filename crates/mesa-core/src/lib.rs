//! # mesa-core
//!
//! Shared library for the mesa tabletop network synchronization core.
//!
//! # Architecture overview (for beginners)
//!
//! Every subsystem of the tabletop (board, UI, network) talks to the others
//! by publishing [`Notification`]s into a [`Hub`].  The hub queues them and,
//! once per dispatch pass, hands each one to every subscribed [`Receptor`].
//! The network layer is just another pair of receptors: a client
//! `Connection` or a `Server` that turns remote-flagged notifications into
//! bytes on a TCP socket and turns received bytes back into notifications.
//!
//! This crate holds the pieces both roles share:
//!
//! - **`notification`** – the notification model and the hub.
//! - **`protocol`** – length-prefixed framing, notification payload encoding
//!   and `host[:port]` parsing.
//! - **`transport`** – socket reader/writer tasks, the per-socket send queue
//!   and the event channel that hands I/O completions back to the dispatch
//!   thread.
//! - **`config`** – the TOML configuration both binaries load.

pub mod config;
pub mod notification;
pub mod protocol;
pub mod transport;

pub use config::{load_config, save_config, ConfigError, NetConfig};
pub use notification::{Bus, Hub, Kind, Notification, Origin, Receptor, ReceptorId};
pub use protocol::codec::{decode_notification, encode_notification, FrameDecoder, ProtocolError};
