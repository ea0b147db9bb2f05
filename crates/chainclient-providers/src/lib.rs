//! chainclient-providers: endpoint parsing and transport selection.
//!
//! # Quick start
//! ```rust,no_run
//! # async fn run() -> Result<(), chainclient_providers::ProviderError> {
//! use chainclient_providers::{connect, Endpoint, TransportOptions};
//!
//! let endpoint: Endpoint = "wss://node.example.com".parse()?;
//! let transport = connect(&endpoint, &TransportOptions::default()).await?;
//! # Ok(()) }
//! ```

pub mod connect;
pub mod endpoint;

pub use connect::{connect, connect_env, connect_str, TransportOptions, ENDPOINT_ENV};
pub use endpoint::{Endpoint, ProviderError};
