//! Revert-reason extraction.
//!
//! Solidity encodes `require(cond, "message")` as `0x08c379a0` followed by
//! an ABI-encoded string, and failed `assert`/arithmetic as `0x4e487b71`
//! followed by a `uint256` panic code. Nodes surface either in the result of
//! an `eth_call` replay, in the `data` field of a JSON-RPC error, or only as
//! text in the error message.

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use serde_json::Value;

use chainclient_core::request::JsonRpcError;

/// `keccak256("Error(string)")[..4]`
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// `keccak256("Panic(uint256)")[..4]`
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

const REVERT_PREFIX: &str = "execution reverted";

/// Decode an `Error(string)` payload.
pub fn decode_error_string(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(&ERROR_STRING_SELECTOR)?;
    match DynSolType::String.abi_decode(payload) {
        Ok(DynSolValue::String(s)) => Some(s),
        _ => None,
    }
}

/// Decode a `Panic(uint256)` payload into its code and meaning.
pub fn decode_panic(data: &[u8]) -> Option<(u64, &'static str)> {
    let payload = data.strip_prefix(&PANIC_SELECTOR)?;
    match DynSolType::Uint(256).abi_decode(payload) {
        Ok(DynSolValue::Uint(v, _)) => {
            let code = v.saturating_to::<u64>();
            Some((code, panic_meaning(code)))
        }
        _ => None,
    }
}

pub fn panic_meaning(code: u64) -> &'static str {
    match code {
        0x00 => "generic compiler-inserted panic",
        0x01 => "assert() called with false condition",
        0x11 => "arithmetic overflow or underflow",
        0x12 => "division or modulo by zero",
        0x21 => "invalid enum value",
        0x22 => "corrupted storage byte array",
        0x31 => ".pop() on empty array",
        0x32 => "out-of-bounds array access",
        0x41 => "too much memory allocated",
        0x51 => "called zero-initialized internal function pointer",
        _ => "unknown panic code",
    }
}

/// Human-readable reason for raw revert bytes, if they carry one.
pub fn decode_revert(data: &[u8]) -> Option<String> {
    if let Some(reason) = decode_error_string(data) {
        return Some(reason);
    }
    decode_panic(data).map(|(code, meaning)| format!("panic 0x{code:02x}: {meaning}"))
}

/// Same as [`decode_revert`] for a `0x`-prefixed hex string.
pub fn decode_revert_hex(data: &str) -> Option<String> {
    let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data)).ok()?;
    decode_revert(&bytes)
}

/// Reason carried by a JSON-RPC error: revert data first, then the
/// `execution reverted: <reason>` message form.
pub fn reason_from_rpc_error(err: &JsonRpcError) -> Option<String> {
    let data = match &err.data {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(obj)) => obj.get("data").and_then(Value::as_str),
        _ => None,
    };
    if let Some(reason) = data.and_then(decode_revert_hex) {
        return Some(reason);
    }
    let rest = err.message.strip_prefix(REVERT_PREFIX)?;
    let reason = rest.trim_start_matches(':').trim();
    (!reason.is_empty()).then(|| reason.to_string())
}
