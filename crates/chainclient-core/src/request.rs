//! JSON-RPC 2.0 wire types and the envelope codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// The fixed protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    /// The numeric id, if this is one. Ids this client emits are always numeric.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            Self::Null => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    pub params: Vec<RpcParam>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RpcId::Number(id),
            method: method.into(),
            params,
        }
    }

    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a successful response (used by fakes and tests).
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RpcId::Number(id),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response (used by fakes and tests).
    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: RpcId::Number(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Returns `true` if this is a successful response (has result, no error).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    /// Unwrap the result value or return the remote error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// Payload of an unsolicited `<namespace>_subscription` push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub subscription: String,
    #[serde(default)]
    pub result: Value,
}

/// A server-initiated subscription notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNotification {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    pub params: SubscriptionParams,
}

impl SubscriptionNotification {
    /// Build a push for the given subscription (used by fakes and tests).
    pub fn new(namespace: &str, subscription: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: format!("{namespace}_subscription"),
            params: SubscriptionParams {
                subscription: subscription.into(),
                result,
            },
        }
    }
}

/// Outgoing envelope: a single request or an ordered batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

impl Envelope {
    /// Ids carried by this envelope, in request order.
    pub fn ids(&self) -> Vec<u64> {
        match self {
            Self::Single(req) => req.id_u64().into_iter().collect(),
            Self::Batch(reqs) => reqs.iter().filter_map(|r| r.id_u64()).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A reply body returned synchronously by a unary transport.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Batch(Vec<JsonRpcResponse>),
    Single(JsonRpcResponse),
}

/// Anything a duplex transport can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(JsonRpcResponse),
    Batch(Vec<JsonRpcResponse>),
    Notification(SubscriptionNotification),
}

impl From<Reply> for Incoming {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Single(r) => Self::Response(r),
            Reply::Batch(rs) => Self::Batch(rs),
        }
    }
}

/// Parse one inbound frame. Push notifications are recognised by a
/// `method` ending in `_subscription`.
pub fn parse_incoming(value: Value) -> Result<Incoming, TransportError> {
    if value.is_array() {
        return Ok(Incoming::Batch(serde_json::from_value(value)?));
    }
    let is_push = value
        .get("method")
        .and_then(Value::as_str)
        .is_some_and(|m| m.ends_with("_subscription"));
    if is_push {
        return Ok(Incoming::Notification(serde_json::from_value(value)?));
    }
    Ok(Incoming::Response(serde_json::from_value(value)?))
}

/// Parse one inbound text frame.
pub fn parse_incoming_str(text: &str) -> Result<Incoming, TransportError> {
    parse_incoming(serde_json::from_str(text)?)
}
