//! Infrastructure layer for the server.
//!
//! # Sub-modules
//!
//! - **`network`** – the listening server receptor and the port announcer.

pub mod network;
