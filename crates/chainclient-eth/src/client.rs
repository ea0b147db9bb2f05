//! `Eth`: the client facade over a request manager and the method table.

use std::sync::Arc;

use alloy_primitives::U256;
use serde_json::Value;

use chainclient_core::batch::BatchRequest;
use chainclient_core::config::{ClientConfig, SharedConfig};
use chainclient_core::error::ClientError;
use chainclient_core::manager::{RequestManager, SubscriptionHandle};
use chainclient_core::method::Method;
use chainclient_core::subscriptions::SubscriptionEvent;
use chainclient_core::transport::RpcTransport;
use chainclient_providers::{connect_env, connect_str, TransportOptions};

use crate::confirm::{rejected, watch_transaction, TxHandle};
use crate::formatters::{
    block_arg, format_block, format_log, input_log_filter, normalize_address, parse_quantity,
    parse_u256, BlockRef,
};
use crate::methods::EthMethods;

/// Outcome of [`Eth::invoke`].
pub enum Invocation {
    Result(Result<Value, ClientError>),
    Transaction(TxHandle),
}

/// Checks addresses handed to [`Eth::set_default_account`].
pub trait AddressValidator: Send + Sync {
    /// The normalised address, or why it was rejected.
    fn validate(&self, address: &str) -> Result<String, String>;
}

/// Accepts hex addresses; mixed case must pass the EIP-55 checksum.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumValidator;

impl AddressValidator for ChecksumValidator {
    fn validate(&self, address: &str) -> Result<String, String> {
        normalize_address(address)
    }
}

/// Server-side event streams available through `eth_subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionKind {
    NewHeads,
    /// Log filter object (`address`, `topics`).
    Logs(Value),
    NewPendingTransactions,
    Syncing,
}

impl SubscriptionKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NewHeads => "newHeads",
            Self::Logs(_) => "logs",
            Self::NewPendingTransactions => "newPendingTransactions",
            Self::Syncing => "syncing",
        }
    }

    fn format(&self, data: Value) -> Value {
        match self {
            Self::NewHeads => format_block(data),
            Self::Logs(_) => format_log(data),
            Self::NewPendingTransactions | Self::Syncing => data,
        }
    }
}

/// An Ethereum JSON-RPC client.
///
/// Cheap to clone; clones share the transport, configuration and
/// subscriptions.
#[derive(Clone)]
pub struct Eth {
    manager: RequestManager,
    methods: Arc<EthMethods>,
    validator: Arc<dyn AddressValidator>,
}

impl std::fmt::Debug for Eth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eth").field("manager", &self.manager).finish()
    }
}

impl Eth {
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn RpcTransport>, config: ClientConfig) -> Self {
        Self::with_manager(RequestManager::new(transport, SharedConfig::new(config)))
    }

    pub fn with_manager(manager: RequestManager) -> Self {
        Self {
            manager,
            methods: Arc::new(EthMethods::new()),
            validator: Arc::new(ChecksumValidator),
        }
    }

    /// Connect to `endpoint`, picking the transport from its scheme.
    pub async fn connect(endpoint: &str) -> Result<Self, ClientError> {
        let transport = connect_str(endpoint, &TransportOptions::default()).await?;
        Ok(Self::new(transport))
    }

    /// Connect to the endpoint named by `ETH_RPC_URL`.
    pub async fn from_env() -> Result<Self, ClientError> {
        let transport = connect_env(&TransportOptions::default()).await?;
        Ok(Self::new(transport))
    }

    pub fn with_address_validator(mut self, validator: Arc<dyn AddressValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Swap the transport. Requests pending on the old one fail.
    pub fn set_provider(&self, transport: Arc<dyn RpcTransport>) {
        self.manager.set_provider(transport);
    }

    pub fn manager(&self) -> &RequestManager {
        &self.manager
    }

    pub fn methods(&self) -> &EthMethods {
        &self.methods
    }

    pub fn config(&self) -> ClientConfig {
        self.manager.config().get()
    }

    /// Change configuration for this client. Running watches keep the
    /// values they started with.
    pub fn update_config(&self, f: impl FnOnce(&mut ClientConfig)) {
        self.manager.config().update(f);
    }

    pub fn set_default_account(&self, address: &str) -> Result<(), ClientError> {
        let address = self
            .validator
            .validate(address)
            .map_err(|_| ClientError::InvalidAddress(address.to_string()))?;
        self.update_config(|c| c.default_account = Some(address));
        Ok(())
    }

    pub fn set_default_block(&self, block: BlockRef) {
        let tag = match block.to_value() {
            Value::String(s) => s,
            other => other.to_string(),
        };
        self.update_config(|c| c.default_block = tag);
    }

    pub fn batch(&self) -> BatchRequest {
        self.manager.batch()
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    async fn call_u64(&self, method: &Method, args: Vec<Value>) -> Result<u64, ClientError> {
        let v = method.call(&self.manager, args).await?;
        parse_quantity(&v).ok_or_else(|| invalid(method, &v))
    }

    async fn call_u256(&self, method: &Method, args: Vec<Value>) -> Result<U256, ClientError> {
        let v = method.call(&self.manager, args).await?;
        parse_u256(&v).ok_or_else(|| invalid(method, &v))
    }

    pub async fn block_number(&self) -> Result<u64, ClientError> {
        self.call_u64(&self.methods.block_number, vec![]).await
    }

    pub async fn chain_id(&self) -> Result<u64, ClientError> {
        self.call_u64(&self.methods.chain_id, vec![]).await
    }

    pub async fn gas_price(&self) -> Result<U256, ClientError> {
        self.call_u256(&self.methods.gas_price, vec![]).await
    }

    pub async fn get_balance(&self, address: &str, block: Option<BlockRef>) -> Result<U256, ClientError> {
        self.call_u256(&self.methods.get_balance, vec![address.into(), block_arg(block)])
            .await
    }

    pub async fn get_transaction_count(&self, address: &str, block: Option<BlockRef>) -> Result<u64, ClientError> {
        self.call_u64(&self.methods.get_transaction_count, vec![address.into(), block_arg(block)])
            .await
    }

    pub async fn get_code(&self, address: &str, block: Option<BlockRef>) -> Result<String, ClientError> {
        let v = self
            .methods
            .get_code
            .call(&self.manager, vec![address.into(), block_arg(block)])
            .await?;
        as_string(&self.methods.get_code, v)
    }

    /// Block by number, tag or hash; `null` when unknown.
    pub async fn get_block(&self, block: BlockRef, full_transactions: bool) -> Result<Value, ClientError> {
        self.methods
            .get_block
            .call(&self.manager, vec![block.to_value(), full_transactions.into()])
            .await
    }

    pub async fn get_block_transaction_count(&self, block: BlockRef) -> Result<u64, ClientError> {
        self.call_u64(&self.methods.get_block_transaction_count, vec![block.to_value()])
            .await
    }

    pub async fn get_transaction(&self, hash: &str) -> Result<Value, ClientError> {
        self.methods.get_transaction.call(&self.manager, vec![hash.into()]).await
    }

    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Value, ClientError> {
        self.methods
            .get_transaction_receipt
            .call(&self.manager, vec![hash.into()])
            .await
    }

    /// Execute a call without creating a transaction; returns the hex result.
    pub async fn call(&self, call: Value, block: Option<BlockRef>) -> Result<String, ClientError> {
        let v = self.methods.call.call(&self.manager, vec![call, block_arg(block)]).await?;
        as_string(&self.methods.call, v)
    }

    pub async fn estimate_gas(&self, call: Value) -> Result<u64, ClientError> {
        self.call_u64(&self.methods.estimate_gas, vec![call]).await
    }

    pub async fn get_logs(&self, filter: Value) -> Result<Vec<Value>, ClientError> {
        match self.methods.get_logs.call(&self.manager, vec![filter]).await? {
            Value::Array(logs) => Ok(logs),
            other => Err(invalid(&self.methods.get_logs, &other)),
        }
    }

    /// Invoke any method descriptor. Watchable methods submit a
    /// transaction and yield a [`TxHandle`] tracking it; the rest yield
    /// their formatted result.
    pub async fn invoke(&self, method: &Method, args: Vec<Value>) -> Invocation {
        if method.is_watchable() {
            Invocation::Transaction(self.watch(method, args))
        } else {
            Invocation::Result(method.call(&self.manager, args).await)
        }
    }

    /// Submit a transaction and watch it until it is confirmed.
    pub fn send_transaction(&self, tx: Value) -> TxHandle {
        self.watch(&self.methods.send_transaction, vec![tx])
    }

    /// Submit a signed transaction and watch it until it is confirmed.
    pub fn send_raw_transaction(&self, raw: &str) -> TxHandle {
        self.watch(&self.methods.send_raw_transaction, vec![raw.into()])
    }

    /// A call object as first argument is kept for replaying at the
    /// receipt's block; signed payloads cannot be replayed.
    fn watch(&self, method: &Method, args: Vec<Value>) -> TxHandle {
        match method.prepare(&self.manager, args) {
            Ok(prepared) => {
                let replay = prepared.request.params.first().filter(|p| p.is_object()).cloned();
                watch_transaction(self.manager.clone(), self.methods.clone(), prepared, replay)
            }
            Err(e) => rejected(e),
        }
    }

    /// Subscribe to `kind`; pushed data is formatted before `listener` sees it.
    pub async fn subscribe<F>(&self, kind: SubscriptionKind, listener: F) -> Result<SubscriptionHandle, ClientError>
    where
        F: Fn(SubscriptionEvent) + Send + Sync + 'static,
    {
        let params = match &kind {
            SubscriptionKind::Logs(filter) => {
                let config = self.config();
                let filter = input_log_filter()(filter.clone(), &config).map_err(|reason| {
                    ClientError::InvalidValue {
                        method: "subscribe".into(),
                        reason,
                    }
                })?;
                vec![filter]
            }
            _ => vec![],
        };
        let event_name = kind.event_name();
        self.manager
            .subscribe(
                "eth",
                event_name,
                params,
                Arc::new(move |ev: SubscriptionEvent| match ev {
                    SubscriptionEvent::Data(data) => listener(SubscriptionEvent::Data(kind.format(data))),
                    other => listener(other),
                }),
            )
            .await
    }

    /// Cancel every live subscription.
    pub async fn clear_subscriptions(&self) -> usize {
        self.manager.clear_subscriptions().await
    }
}

fn invalid(method: &Method, v: &Value) -> ClientError {
    ClientError::InvalidValue {
        method: method.name().to_string(),
        reason: format!("unexpected result {v}"),
    }
}

fn as_string(method: &Method, v: Value) -> Result<String, ClientError> {
    match v {
        Value::String(s) => Ok(s),
        other => Err(invalid(method, &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainclient_core::id::SequentialIds;

    fn offline() -> Eth {
        Eth::with_manager(RequestManager::with_ids(
            None,
            SharedConfig::default(),
            Arc::new(SequentialIds::new()),
        ))
    }

    struct UppercaseOnly;

    impl AddressValidator for UppercaseOnly {
        fn validate(&self, address: &str) -> Result<String, String> {
            if address.starts_with("0X") {
                Ok(address.to_string())
            } else {
                Err("lowercase prefix".into())
            }
        }
    }

    #[test]
    fn default_account_is_validated_and_normalised() {
        let eth = offline();
        eth.set_default_account("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        assert_eq!(
            eth.config().default_account.as_deref(),
            Some("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed")
        );

        let err = eth.set_default_account("0x1234").unwrap_err();
        assert!(matches!(err, ClientError::InvalidAddress(a) if a == "0x1234"));
    }

    #[test]
    fn custom_validator_is_used() {
        let eth = offline().with_address_validator(Arc::new(UppercaseOnly));
        assert!(eth.set_default_account("0xabc").is_err());
        assert!(eth.set_default_account("0XABC").is_ok());
    }

    #[test]
    fn default_block_setter() {
        let eth = offline();
        eth.set_default_block(BlockRef::Number(16));
        assert_eq!(eth.config().default_block, "0x10");
        eth.set_default_block(BlockRef::Pending);
        assert_eq!(eth.config().default_block, "pending");
    }

    #[test]
    fn subscription_kinds() {
        assert_eq!(SubscriptionKind::NewHeads.event_name(), "newHeads");
        assert_eq!(SubscriptionKind::Logs(Value::Null).event_name(), "logs");
        let head = SubscriptionKind::NewHeads.format(serde_json::json!({ "number": "0x1b4" }));
        assert_eq!(head["number"], 436);
    }

    #[tokio::test]
    async fn offline_calls_fail_fast() {
        let eth = offline();
        assert!(matches!(eth.block_number().await, Err(ClientError::ConnectionNotOpen)));
        let err = eth
            .subscribe(SubscriptionKind::NewHeads, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionNotOpen));
    }

    #[tokio::test]
    async fn invalid_transaction_is_rejected_without_a_transport() {
        let eth = offline();
        let handle = eth.send_transaction(serde_json::json!({ "to": "0x1234" }));
        assert!(matches!(handle.await, Err(ClientError::InvalidValue { .. })));
    }
}
