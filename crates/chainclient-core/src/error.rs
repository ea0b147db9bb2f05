//! Transport-level and client-level error types.

use serde_json::Value;
use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors raised by a concrete transport while moving bytes.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The transport is not (or no longer) connected.
    #[error("connection not open")]
    NotConnected,

    /// HTTP request failed (connection refused, non-2xx status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Unix-socket I/O error.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Payload could not be serialized or deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The operation is not available on this transport.
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

impl TransportError {
    /// Returns `true` if the error means the channel is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::NotConnected | Self::WebSocket(_) | Self::Ipc(_))
    }
}

/// Errors surfaced to callers of the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The transport is closed, missing, or was swapped out while the
    /// request was in flight.
    #[error("connection not open")]
    ConnectionNotOpen,

    /// A transport failure that is not a plain disconnect.
    #[error(transparent)]
    Transport(TransportError),

    /// Wrong number of parameters passed to a method. Never sent.
    #[error("Invalid number of parameters for \"{method}\". Got {actual} expected {expected}!")]
    InvalidArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// A formatter rejected an argument or a result. Never sent.
    #[error("invalid value for \"{method}\": {reason}")]
    InvalidValue { method: String, reason: String },

    /// The node returned a JSON-RPC error object.
    #[error("Returned error: {}", .0.message)]
    Rpc(JsonRpcError),

    /// The node answered with something that is not a JSON-RPC response.
    #[error("Invalid JSON RPC response: {0}")]
    InvalidResponse(String),

    /// Batch response length differs from the request length.
    #[error("Batch response length ({actual}) does not match request length ({expected})")]
    BatchMismatch { expected: usize, actual: usize },

    /// `execute()` was called twice on the same batch.
    #[error("Batch has already been executed")]
    BatchAlreadyExecuted,

    /// A confirmation watch exceeded its polling or block bound.
    #[error("Transaction was not mined within {bound}, please make sure your transaction was properly sent. Be aware that it might still be mined!")]
    Timeout {
        bound: String,
        transaction_hash: Option<String>,
    },

    /// The transaction reverted on chain.
    #[error("Transaction has been reverted by the EVM{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Reverted {
        reason: Option<String>,
        receipt: Box<Value>,
    },

    /// The caller stopped watching before the handle settled.
    #[error("Watching was stopped before the operation completed")]
    WatchStopped,

    /// Subscriptions requested on a transport that cannot push.
    #[error("{0} is not supported by the current provider")]
    Unsupported(String),

    /// Default-account setter received a malformed address.
    #[error("Provided address {0} is invalid")]
    InvalidAddress(String),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => Self::ConnectionNotOpen,
            TransportError::Unsupported(what) => Self::Unsupported(what.to_string()),
            other => Self::Transport(other),
        }
    }
}

impl From<JsonRpcError> for ClientError {
    fn from(e: JsonRpcError) -> Self {
        Self::Rpc(e)
    }
}

impl ClientError {
    /// Returns `true` if the error means the transport went away.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::ConnectionNotOpen => true,
            Self::Transport(e) => e.is_connectivity(),
            _ => false,
        }
    }

    /// Returns `true` for confirmation-watch timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The transaction hash attached to a watch failure, if any.
    pub fn transaction_hash(&self) -> Option<&str> {
        match self {
            Self::Timeout { transaction_hash, .. } => transaction_hash.as_deref(),
            _ => None,
        }
    }

    /// The remote error object, if the node produced one.
    pub fn rpc_error(&self) -> Option<&JsonRpcError> {
        match self {
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}
