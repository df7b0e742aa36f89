//! Duplex channel upgrade — the interactive path between a client and a
//! session's PTY.
//!
//! Splits the axum `WebSocket` into sender/receiver and runs a
//! `tokio::select!` loop forwarding a broadcast subscription on one side and
//! parsed inbound JSON on the other.

mod handler;

pub use handler::channel_upgrade;
