//! Client configuration.
//!
//! Every client instance owns its own [`SharedConfig`]; changing a value on
//! one client never leaks into another.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// How a confirmation watch observes new blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStrategy {
    /// Subscribe to block headers when the transport can push, poll otherwise.
    #[default]
    Auto,
    /// Always poll, even on duplex transports.
    Polling,
    /// Require a block-header subscription; fails on unary transports.
    Subscription,
}

/// Tunables consumed by the request manager and the confirmation watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Blocks to wait for a receipt in the subscription strategy.
    #[serde(default = "default_block_timeout")]
    pub transaction_block_timeout: u64,
    /// Confirmations required before a transaction handle resolves.
    #[serde(default = "default_confirmation_blocks")]
    pub transaction_confirmation_blocks: u64,
    /// Receipt/block poll interval in milliseconds.
    #[serde(default = "default_polling_interval_ms")]
    pub transaction_polling_interval_ms: u64,
    /// Receipt poll deadline in milliseconds.
    #[serde(default = "default_polling_timeout_ms")]
    pub transaction_polling_timeout_ms: u64,
    /// Seconds to wait for a block header before falling back to polling.
    #[serde(default = "default_block_header_timeout_secs")]
    pub block_header_timeout_secs: u64,
    /// Re-execute the call at the receipt's block to detect reverts.
    #[serde(default)]
    pub handle_revert: bool,
    /// Listener count per kind above which transports log a leak warning.
    #[serde(default = "default_max_listeners")]
    pub max_listeners_warning_threshold: usize,
    #[serde(default)]
    pub confirmation_strategy: ConfirmationStrategy,
    /// Re-issue live subscriptions after the transport reconnects.
    #[serde(default = "bool_true")]
    pub auto_resubscribe: bool,
    /// Block tag used when a method's block argument is omitted.
    #[serde(default = "default_block")]
    pub default_block: String,
    /// Sender filled into transactions that carry no `from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_account: Option<String>,
}

fn default_block_timeout() -> u64 { 50 }
fn default_confirmation_blocks() -> u64 { 24 }
fn default_polling_interval_ms() -> u64 { 1_000 }
fn default_polling_timeout_ms() -> u64 { 750_000 }
fn default_block_header_timeout_secs() -> u64 { 10 }
fn default_max_listeners() -> usize { 100 }
fn default_block() -> String { "latest".into() }
fn bool_true() -> bool { true }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transaction_block_timeout: default_block_timeout(),
            transaction_confirmation_blocks: default_confirmation_blocks(),
            transaction_polling_interval_ms: default_polling_interval_ms(),
            transaction_polling_timeout_ms: default_polling_timeout_ms(),
            block_header_timeout_secs: default_block_header_timeout_secs(),
            handle_revert: false,
            max_listeners_warning_threshold: default_max_listeners(),
            confirmation_strategy: ConfirmationStrategy::Auto,
            auto_resubscribe: true,
            default_block: default_block(),
            default_account: None,
        }
    }
}

impl ClientConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.transaction_polling_interval_ms)
    }

    pub fn polling_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_polling_timeout_ms)
    }

    pub fn block_header_timeout(&self) -> Duration {
        Duration::from_secs(self.block_header_timeout_secs)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Per-client, runtime-mutable configuration.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ClientConfig>>,
}

impl SharedConfig {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current values.
    pub fn get(&self) -> ClientConfig {
        self.inner.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut ClientConfig)) {
        f(&mut *self.inner.write());
    }
}
