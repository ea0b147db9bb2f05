//! chainclient-eth: Ethereum methods and transaction confirmation tracking.
//!
//! # Quick start
//! ```rust,no_run
//! # async fn run() -> Result<(), chainclient_core::ClientError> {
//! use chainclient_eth::{Eth, TxEvent};
//! use serde_json::json;
//!
//! let eth = Eth::connect("wss://node.example.com").await?;
//! println!("head: {}", eth.block_number().await?);
//!
//! let tx = eth.send_transaction(json!({
//!     "from": "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed",
//!     "to": "0xfb6916095ca1df60bb79ce92ce3ea74c37c5d359",
//!     "value": "0xde0b6b3a7640000",
//! }));
//! tx.on("confirmation", |ev| {
//!     if let TxEvent::Confirmation { number, .. } = ev {
//!         println!("confirmation {number}");
//!     }
//! });
//! let receipt = tx.await?;
//! println!("mined in block {}", receipt["blockNumber"]);
//! # Ok(()) }
//! ```

pub mod client;
pub mod confirm;
pub mod formatters;
pub mod methods;
pub mod revert;

pub use client::{AddressValidator, ChecksumValidator, Eth, Invocation, SubscriptionKind};
pub use confirm::{TxEvent, TxHandle};
pub use formatters::BlockRef;
pub use methods::EthMethods;
pub use revert::{decode_error_string, decode_panic, decode_revert};
