//! chainclient-http: unary JSON-RPC transport over HTTP(S).
//!
//! One POST per envelope; the reply body is returned directly from
//! [`chainclient_core::RpcTransport::send`]. HTTP cannot push, so
//! subscriptions are rejected by the request manager before anything is
//! sent.

pub mod client;

pub use client::{HttpTransport, HttpTransportConfig};
