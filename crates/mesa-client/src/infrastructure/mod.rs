//! Infrastructure layer for the client.
//!
//! # Sub-modules
//!
//! - **`network`** – the TCP connection receptor and its UDP discovery
//!   helper.

pub mod network;
