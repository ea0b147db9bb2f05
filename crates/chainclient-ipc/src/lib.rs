//! chainclient-ipc: duplex JSON-RPC transport over a Unix domain socket.
//!
//! Nodes write concatenated JSON documents with no length prefix, so
//! inbound bytes are buffered and split with a streaming JSON parser.

#[cfg(unix)]
pub mod client;
pub mod config;
pub mod framing;

#[cfg(unix)]
pub use client::IpcTransport;
pub use config::IpcTransportConfig;
