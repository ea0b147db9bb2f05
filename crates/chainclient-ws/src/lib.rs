//! chainclient-ws: duplex WebSocket JSON-RPC transport.
//!
//! # Features
//! - One background task owns the socket; sends are multiplexed over it
//! - Every inbound frame (reply or push) goes to the registered message listeners
//! - Auto-reconnect with exponential backoff; reconnect listeners fire once
//!   the socket is back, so the request manager can resubscribe
//! - Sends while disconnected fail immediately with `NotConnected`

pub mod client;

pub use client::{WsTransport, WsTransportConfig};
