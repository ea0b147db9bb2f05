//! Input and output formatters for the `eth_` namespace.
//!
//! Inputs are normalised to what nodes accept: lowercase addresses, hex
//! quantities, block tags. Outputs turn hex quantities into JSON numbers
//! (or decimal strings when they do not fit in a `u64`).

use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use serde_json::{Map, Value};

use chainclient_core::config::ClientConfig;
use chainclient_core::method::{InputFormatter, OutputFormatter};

const BLOCK_TAGS: &[&str] = &["latest", "earliest", "pending", "safe", "finalized"];

const TX_QUANTITY_FIELDS: &[&str] = &[
    "gas",
    "gasPrice",
    "value",
    "nonce",
    "maxFeePerGas",
    "maxPriorityFeePerGas",
    "chainId",
    "type",
];

const RECEIPT_QUANTITY_FIELDS: &[&str] = &[
    "blockNumber",
    "transactionIndex",
    "gasUsed",
    "cumulativeGasUsed",
    "effectiveGasPrice",
];

const BLOCK_QUANTITY_FIELDS: &[&str] = &[
    "number",
    "gasLimit",
    "gasUsed",
    "timestamp",
    "size",
    "baseFeePerGas",
];

/// A block selector accepted by methods with a block argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Latest,
    Earliest,
    Pending,
    Safe,
    Finalized,
    Number(u64),
    Hash(String),
}

impl BlockRef {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Latest => "latest".into(),
            Self::Earliest => "earliest".into(),
            Self::Pending => "pending".into(),
            Self::Safe => "safe".into(),
            Self::Finalized => "finalized".into(),
            Self::Number(n) => to_quantity(*n).into(),
            Self::Hash(h) => h.clone().into(),
        }
    }
}

/// Optional block argument; `None` becomes the configured default block.
pub fn block_arg(block: Option<BlockRef>) -> Value {
    block.map(|b| b.to_value()).unwrap_or(Value::Null)
}

pub fn to_quantity(n: u64) -> String {
    format!("{n:#x}")
}

/// Parse a hex quantity (`"0x1a"`) or a JSON number.
pub fn parse_quantity(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some("") => Some(0),
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

/// Parse a 256-bit quantity: hex, decimal string or JSON number.
pub fn parse_u256(v: &Value) -> Option<U256> {
    match v {
        Value::Number(n) => n.as_u64().map(U256::from),
        Value::String(s) => match s.strip_prefix("0x") {
            Some("") => Some(U256::ZERO),
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None => U256::from_str_radix(s, 10).ok(),
        },
        _ => None,
    }
}

pub fn is_hex(s: &str) -> bool {
    s.strip_prefix("0x")
        .is_some_and(|h| h.chars().all(|c| c.is_ascii_hexdigit()))
}

/// A 32-byte hash such as a block or transaction hash.
pub fn is_hash(s: &str) -> bool {
    s.len() == 66 && is_hex(s)
}

/// Validate `address` and return it lowercased.
///
/// Mixed-case input must carry a valid EIP-55 checksum.
pub fn normalize_address(address: &str) -> Result<String, String> {
    let body = address
        .strip_prefix("0x")
        .ok_or_else(|| format!("Provided address {address} is invalid"))?;
    let mixed = body.chars().any(|c| c.is_ascii_uppercase()) && body.chars().any(|c| c.is_ascii_lowercase());
    let parsed = if mixed {
        Address::parse_checksummed(address, None).map_err(|_| {
            format!("Provided address {address} is invalid, the capitalization checksum test failed")
        })?
    } else {
        Address::from_str(address).map_err(|_| format!("Provided address {address} is invalid"))?
    };
    Ok(format!("{parsed:#x}"))
}

/// Number → hex quantity; hex strings pass through.
fn quantity_value(v: Value) -> Result<Value, String> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .map(|n| Value::String(to_quantity(n)))
            .ok_or_else(|| format!("{n} is not a valid quantity")),
        Value::String(s) if is_hex(&s) => Ok(Value::String(s)),
        Value::String(s) => U256::from_str_radix(&s, 10)
            .map(|n| Value::String(format!("{n:#x}")))
            .map_err(|_| format!("{s} is not a valid quantity")),
        other => Err(format!("{other} is not a valid quantity")),
    }
}

fn block_value(v: Value, config: &ClientConfig) -> Result<Value, String> {
    match v {
        Value::Null => Ok(Value::String(config.default_block.clone())),
        Value::String(s) if BLOCK_TAGS.contains(&s.as_str()) => Ok(Value::String(s)),
        other => quantity_value(other),
    }
}

fn address_value(v: Value) -> Result<Value, String> {
    match v {
        Value::String(s) => normalize_address(&s).map(Value::String),
        other => Err(format!("Provided address {other} is invalid")),
    }
}

fn quantity_fields(obj: &mut Map<String, Value>, fields: &[&str]) -> Result<(), String> {
    for field in fields {
        if let Some(v) = obj.remove(*field) {
            if !v.is_null() {
                obj.insert(field.to_string(), quantity_value(v)?);
            }
        }
    }
    Ok(())
}

fn call_object(v: Value, config: &ClientConfig, require_from: bool) -> Result<Value, String> {
    let Value::Object(mut obj) = v else {
        return Err("transaction must be an object".into());
    };
    if let Some(limit) = obj.remove("gasLimit") {
        obj.entry("gas").or_insert(limit);
    }
    let from = match obj.remove("from") {
        Some(Value::Null) | None => config.default_account.clone().map(Value::String),
        Some(v) => Some(v),
    };
    match from {
        Some(from) => {
            obj.insert("from".into(), address_value(from)?);
        }
        None if require_from => return Err("The send transactions \"from\" field must be defined!".into()),
        None => {}
    }
    if let Some(to) = obj.remove("to") {
        if !to.is_null() {
            obj.insert("to".into(), address_value(to)?);
        }
    }
    if let Some(data) = obj.remove("input") {
        obj.entry("data").or_insert(data);
    }
    if let Some(data) = obj.get("data") {
        if !data.as_str().is_some_and(is_hex) {
            return Err("The data field must be HEX encoded data.".into());
        }
    }
    quantity_fields(&mut obj, TX_QUANTITY_FIELDS)?;
    Ok(Value::Object(obj))
}

/// Block number or tag; null becomes the configured default block.
pub fn input_block() -> InputFormatter {
    Arc::new(block_value)
}

/// Block hash, number or tag.
pub fn input_block_or_hash() -> InputFormatter {
    Arc::new(|v: Value, config: &ClientConfig| match v {
        Value::String(s) if is_hash(&s) => Ok(Value::String(s)),
        other => block_value(other, config),
    })
}

pub fn input_address() -> InputFormatter {
    Arc::new(|v: Value, _: &ClientConfig| address_value(v))
}

pub fn input_hash() -> InputFormatter {
    Arc::new(|v: Value, _: &ClientConfig| match v {
        Value::String(s) if is_hash(&s) => Ok(Value::String(s.to_ascii_lowercase())),
        other => Err(format!("{other} is not a valid 32-byte hash")),
    })
}

pub fn input_hex_data() -> InputFormatter {
    Arc::new(|v: Value, _: &ClientConfig| match v {
        Value::String(s) if is_hex(&s) => Ok(Value::String(s)),
        other => Err(format!("{other} is not HEX encoded data")),
    })
}

pub fn input_quantity() -> InputFormatter {
    Arc::new(|v: Value, _: &ClientConfig| quantity_value(v))
}

/// Transaction object for sending; `from` falls back to the default account.
pub fn input_transaction() -> InputFormatter {
    Arc::new(|v: Value, config: &ClientConfig| call_object(v, config, true))
}

/// Call object for `eth_call` / `eth_estimateGas`; `from` is optional.
pub fn input_call() -> InputFormatter {
    Arc::new(|v: Value, config: &ClientConfig| call_object(v, config, false))
}

pub fn input_log_filter() -> InputFormatter {
    Arc::new(|v: Value, config: &ClientConfig| -> Result<Value, String> {
        let Value::Object(mut obj) = v else {
            return Err("log filter must be an object".into());
        };
        for field in ["fromBlock", "toBlock"] {
            if let Some(b) = obj.remove(field) {
                if !b.is_null() {
                    obj.insert(field.into(), block_value(b, config)?);
                }
            }
        }
        match obj.remove("address") {
            Some(Value::Array(addrs)) => {
                let addrs = addrs.into_iter().map(address_value).collect::<Result<Vec<_>, _>>()?;
                obj.insert("address".into(), Value::Array(addrs));
            }
            Some(Value::Null) | None => {}
            Some(a) => {
                obj.insert("address".into(), address_value(a)?);
            }
        }
        Ok(Value::Object(obj))
    })
}

fn number_value(v: &Value) -> Option<Value> {
    if let Some(n) = parse_quantity(v) {
        return Some(Value::from(n));
    }
    parse_u256(v).map(|n| Value::String(n.to_string()))
}

fn number_fields(obj: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(v) = obj.get_mut(*field) {
            if let Some(n) = number_value(v) {
                *v = n;
            }
        }
    }
}

/// Hex quantity → JSON number (decimal string past `u64`).
pub fn output_number() -> OutputFormatter {
    Arc::new(|v: Value| number_value(&v).ok_or_else(|| format!("{v} is not a quantity")))
}

/// Hex quantity → decimal string, for balances and prices.
pub fn output_big_number() -> OutputFormatter {
    Arc::new(|v: Value| {
        parse_u256(&v)
            .map(|n| Value::String(n.to_string()))
            .ok_or_else(|| format!("{v} is not a quantity"))
    })
}

pub fn format_log(mut log: Value) -> Value {
    if let Value::Object(obj) = &mut log {
        number_fields(obj, &["blockNumber", "transactionIndex", "logIndex"]);
    }
    log
}

pub fn format_transaction(mut tx: Value) -> Value {
    if let Value::Object(obj) = &mut tx {
        number_fields(obj, &["blockNumber", "transactionIndex", "nonce", "gas", "type", "chainId"]);
        for field in ["value", "gasPrice", "maxFeePerGas", "maxPriorityFeePerGas"] {
            if let Some(v) = obj.get_mut(field) {
                if let Some(n) = parse_u256(v) {
                    *v = Value::String(n.to_string());
                }
            }
        }
    }
    tx
}

pub fn format_block(mut block: Value) -> Value {
    if let Value::Object(obj) = &mut block {
        number_fields(obj, BLOCK_QUANTITY_FIELDS);
        if let Some(Value::Array(txs)) = obj.get_mut("transactions") {
            for tx in txs.iter_mut().filter(|t| t.is_object()) {
                *tx = format_transaction(tx.take());
            }
        }
    }
    block
}

/// Receipt with numeric fields and a boolean `status`.
pub fn format_receipt(mut receipt: Value) -> Value {
    if let Value::Object(obj) = &mut receipt {
        number_fields(obj, RECEIPT_QUANTITY_FIELDS);
        if let Some(status) = obj.get_mut("status") {
            if let Some(n) = parse_quantity(status) {
                *status = Value::Bool(n == 1);
            }
        }
        if let Some(Value::Array(logs)) = obj.get_mut("logs") {
            for log in logs.iter_mut() {
                *log = format_log(log.take());
            }
        }
    }
    receipt
}

/// `true`/`false` from a raw (`"0x1"`) or formatted (`true`) receipt status.
pub fn receipt_status(receipt: &Value) -> Option<bool> {
    match receipt.get("status")? {
        Value::Bool(b) => Some(*b),
        other => parse_quantity(other).map(|n| n == 1),
    }
}

/// Nullable outputs stay null; everything else goes through `f`.
fn nullable(f: fn(Value) -> Value) -> OutputFormatter {
    Arc::new(move |v: Value| Ok(if v.is_null() { v } else { f(v) }))
}

pub fn output_receipt() -> OutputFormatter {
    nullable(format_receipt)
}

pub fn output_block() -> OutputFormatter {
    nullable(format_block)
}

pub fn output_transaction() -> OutputFormatter {
    nullable(format_transaction)
}

pub fn output_logs() -> OutputFormatter {
    Arc::new(|v: Value| match v {
        Value::Array(logs) => Ok(Value::Array(logs.into_iter().map(format_log).collect())),
        other => Err(format!("{other} is not a log list")),
    })
}
