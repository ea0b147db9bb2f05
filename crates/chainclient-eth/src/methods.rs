//! Descriptors for the `eth_` methods the client exposes.

use serde_json::Value;

use chainclient_core::method::Method;

use crate::formatters::{
    input_address, input_block, input_block_or_hash, input_call, input_hash, input_hex_data,
    input_log_filter, input_transaction, is_hash, output_big_number, output_block, output_logs,
    output_number, output_receipt, output_transaction,
};

fn block_by_hash_or_number(args: &[Value]) -> String {
    let by_hash = args.first().and_then(Value::as_str).is_some_and(is_hash);
    let name = if by_hash { "eth_getBlockByHash" } else { "eth_getBlockByNumber" };
    name.to_string()
}

fn tx_count_by_hash_or_number(args: &[Value]) -> String {
    let by_hash = args.first().and_then(Value::as_str).is_some_and(is_hash);
    let name = if by_hash {
        "eth_getBlockTransactionCountByHash"
    } else {
        "eth_getBlockTransactionCountByNumber"
    };
    name.to_string()
}

/// The method table. Built once per client.
#[derive(Debug, Clone)]
pub struct EthMethods {
    pub block_number: Method,
    pub chain_id: Method,
    pub gas_price: Method,
    pub get_balance: Method,
    pub get_code: Method,
    pub get_block: Method,
    pub get_block_transaction_count: Method,
    pub get_transaction: Method,
    pub get_transaction_receipt: Method,
    pub get_transaction_count: Method,
    pub call: Method,
    pub estimate_gas: Method,
    pub get_logs: Method,
    pub send_transaction: Method,
    pub send_raw_transaction: Method,
}

impl Default for EthMethods {
    fn default() -> Self {
        Self::new()
    }
}

impl EthMethods {
    pub fn new() -> Self {
        Self {
            block_number: Method::new("getBlockNumber", "eth_blockNumber", 0).output(output_number()),
            chain_id: Method::new("getChainId", "eth_chainId", 0).output(output_number()),
            gas_price: Method::new("getGasPrice", "eth_gasPrice", 0).output(output_big_number()),
            get_balance: Method::new("getBalance", "eth_getBalance", 2)
                .inputs(vec![Some(input_address()), Some(input_block())])
                .output(output_big_number()),
            get_code: Method::new("getCode", "eth_getCode", 2)
                .inputs(vec![Some(input_address()), Some(input_block())]),
            get_block: Method::new("getBlock", "eth_getBlockByNumber", 2)
                .resolver(block_by_hash_or_number)
                .inputs(vec![Some(input_block_or_hash()), None])
                .output(output_block()),
            get_block_transaction_count: Method::new(
                "getBlockTransactionCount",
                "eth_getBlockTransactionCountByNumber",
                1,
            )
            .resolver(tx_count_by_hash_or_number)
            .inputs(vec![Some(input_block_or_hash())])
            .output(output_number()),
            get_transaction: Method::new("getTransaction", "eth_getTransactionByHash", 1)
                .inputs(vec![Some(input_hash())])
                .output(output_transaction()),
            get_transaction_receipt: Method::new("getTransactionReceipt", "eth_getTransactionReceipt", 1)
                .inputs(vec![Some(input_hash())])
                .output(output_receipt()),
            get_transaction_count: Method::new("getTransactionCount", "eth_getTransactionCount", 2)
                .inputs(vec![Some(input_address()), Some(input_block())])
                .output(output_number()),
            call: Method::new("call", "eth_call", 2).inputs(vec![Some(input_call()), Some(input_block())]),
            estimate_gas: Method::new("estimateGas", "eth_estimateGas", 1)
                .inputs(vec![Some(input_call())])
                .output(output_number()),
            get_logs: Method::new("getPastLogs", "eth_getLogs", 1)
                .inputs(vec![Some(input_log_filter())])
                .output(output_logs()),
            send_transaction: Method::new("sendTransaction", "eth_sendTransaction", 1)
                .inputs(vec![Some(input_transaction())])
                .watchable(),
            send_raw_transaction: Method::new("sendSignedTransaction", "eth_sendRawTransaction", 1)
                .inputs(vec![Some(input_hex_data())])
                .watchable(),
        }
    }
}
