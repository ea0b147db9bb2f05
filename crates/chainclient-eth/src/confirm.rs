//! Transaction confirmation tracking.
//!
//! After a transaction is submitted the watcher waits for its receipt, then
//! counts blocks on top of the receipt's block until
//! `transaction_confirmation_blocks` is reached. New blocks are observed
//! either through a `newHeads` subscription or by polling; the `auto`
//! strategy subscribes when the transport can push.
//!
//! Event order for one transaction is always `Sending`, `Sent`,
//! `TransactionHash`, `Receipt`, `Confirmation` 1..N, then the terminal
//! result. A failure emits `Error` right before the handle rejects.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

use chainclient_core::config::{ClientConfig, ConfirmationStrategy};
use chainclient_core::error::ClientError;
use chainclient_core::handle::{event_channel, EventEmitter, EventHandle, NamedEvent};
use chainclient_core::manager::RequestManager;
use chainclient_core::method::PreparedRequest;
use chainclient_core::subscriptions::SubscriptionEvent;

use crate::formatters::{parse_quantity, receipt_status, to_quantity};
use crate::methods::EthMethods;
use crate::revert::{decode_revert_hex, reason_from_rpc_error};

/// Progress of a submitted transaction.
#[derive(Debug, Clone)]
pub enum TxEvent {
    /// About to submit; carries the formatted parameters.
    Sending(Value),
    /// The node accepted the submission.
    Sent(Value),
    TransactionHash(String),
    Receipt(Value),
    /// One more block on top of the receipt's block.
    Confirmation { number: u64, receipt: Value },
    Error(ClientError),
}

impl NamedEvent for TxEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Sending(_) => "sending",
            Self::Sent(_) => "sent",
            Self::TransactionHash(_) => "transactionHash",
            Self::Receipt(_) => "receipt",
            Self::Confirmation { .. } => "confirmation",
            Self::Error(_) => "error",
        }
    }
}

/// Handle for a watched transaction. Resolves to the receipt.
pub type TxHandle = EventHandle<TxEvent, Value>;

/// Submit `prepared` and watch it until it is confirmed.
///
/// `replay` is the call object re-executed at the receipt's block when
/// `handle_revert` is set, to catch a revert and recover its reason. Must
/// be called inside a tokio runtime.
pub fn watch_transaction(
    manager: RequestManager,
    methods: Arc<EthMethods>,
    prepared: PreparedRequest,
    replay: Option<Value>,
) -> TxHandle {
    let (emitter, handle) = event_channel();
    let watcher = Watcher {
        config: manager.config().get(),
        stopped: Box::pin(emitter.stopped()),
        disconnects: manager.disconnects(),
        manager,
        methods,
        emitter,
        replay,
        hash: String::new(),
        mined: None,
        confirmations: 0,
    };
    tokio::spawn(watcher.run(prepared));
    handle
}

/// A handle that has already failed, for requests rejected before sending.
pub fn rejected(err: ClientError) -> TxHandle {
    let (emitter, handle) = event_channel();
    emitter.emit(TxEvent::Error(err.clone()));
    emitter.reject(err);
    handle
}

enum Exit {
    Stopped,
    Failed(ClientError),
}

impl From<ClientError> for Exit {
    fn from(e: ClientError) -> Self {
        Self::Failed(e)
    }
}

type Stopped = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Watcher {
    manager: RequestManager,
    methods: Arc<EthMethods>,
    emitter: EventEmitter<TxEvent, Value>,
    /// Snapshot taken at submission.
    config: ClientConfig,
    replay: Option<Value>,
    stopped: Stopped,
    disconnects: broadcast::Receiver<String>,
    hash: String,
    /// Receipt and its block number, once mined.
    mined: Option<(Value, u64)>,
    confirmations: u64,
}

/// Resolves when the caller stops watching or the transport closes.
async fn interrupted(stopped: &mut Stopped, disconnects: &mut broadcast::Receiver<String>) -> Exit {
    let closed = async {
        loop {
            match disconnects.recv().await {
                Ok(reason) => return reason,
                Err(RecvError::Lagged(_)) => return "transport closed".to_string(),
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    };
    tokio::select! {
        _ = stopped => Exit::Stopped,
        reason = closed => {
            tracing::debug!(reason = %reason, "transport closed while watching");
            Exit::Failed(ClientError::ConnectionNotOpen)
        }
    }
}

impl Watcher {
    async fn run(mut self, prepared: PreparedRequest) {
        match self.drive(prepared).await {
            Ok(receipt) => {
                tracing::info!(tx_hash = %self.hash, confirmations = self.confirmations, "transaction confirmed");
                self.emitter.resolve(receipt);
            }
            Err(Exit::Stopped) => {
                tracing::debug!(tx_hash = %self.hash, "stopped watching transaction");
            }
            Err(Exit::Failed(e)) => {
                tracing::warn!(tx_hash = %self.hash, error = %e, "transaction watch failed");
                self.emitter.emit(TxEvent::Error(e.clone()));
                self.emitter.reject(e);
            }
        }
    }

    /// Await `fut` unless the watch is interrupted first.
    async fn guard<T>(&mut self, fut: impl Future<Output = Result<T, ClientError>>) -> Result<T, Exit> {
        tokio::select! {
            r = fut => r.map_err(Exit::Failed),
            exit = interrupted(&mut self.stopped, &mut self.disconnects) => Err(exit),
        }
    }

    async fn drive(&mut self, prepared: PreparedRequest) -> Result<Value, Exit> {
        let payload = Value::Array(prepared.request.params.clone());
        self.emitter.emit(TxEvent::Sending(payload.clone()));

        let manager = self.manager.clone();
        let request = prepared.request.clone();
        let resp = self.guard(async move { manager.send_request(request).await }).await?;
        let hash = match prepared.finish(resp)? {
            Value::String(hash) => hash,
            other => {
                return Err(ClientError::InvalidResponse(format!(
                    "expected a transaction hash, got {other}"
                ))
                .into())
            }
        };
        tracing::info!(tx_hash = %hash, method = %prepared.method, "transaction submitted");
        self.hash = hash.clone();
        self.emitter.emit(TxEvent::Sent(payload));
        self.emitter.emit(TxEvent::TransactionHash(hash));

        let strategy = self.strategy()?;
        if strategy == ConfirmationStrategy::Subscription {
            if let Some(receipt) = self.by_subscription().await? {
                return Ok(receipt);
            }
        }
        self.by_polling().await
    }

    fn strategy(&self) -> Result<ConfirmationStrategy, ClientError> {
        let push = self.manager.supports_subscriptions();
        match self.config.confirmation_strategy {
            ConfirmationStrategy::Auto if push => Ok(ConfirmationStrategy::Subscription),
            ConfirmationStrategy::Auto => Ok(ConfirmationStrategy::Polling),
            ConfirmationStrategy::Subscription if !push => Err(ClientError::Unsupported(
                "subscription confirmation strategy".into(),
            )),
            other => Ok(other),
        }
    }

    fn timeout(&self, bound: String) -> Exit {
        Exit::Failed(ClientError::Timeout {
            bound,
            transaction_hash: Some(self.hash.clone()),
        })
    }

    /// Watch `newHeads`. `Ok(None)` means headers stalled and polling should
    /// take over.
    async fn by_subscription(&mut self) -> Result<Option<Value>, Exit> {
        let manager = self.manager.clone();
        let (subscription, mut headers) = self
            .guard(async move { manager.subscribe_channel("eth", "newHeads", vec![]).await })
            .await?;
        let result = self.follow_heads(&mut headers).await;
        if let Err(e) = subscription.unsubscribe().await {
            tracing::debug!(tx_hash = %self.hash, error = %e, "newHeads unsubscribe failed");
        }
        result
    }

    async fn follow_heads(
        &mut self,
        headers: &mut mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) -> Result<Option<Value>, Exit> {
        // Covers a transaction mined before the subscription went live.
        if let Some(receipt) = self.observe(None).await? {
            return Ok(Some(receipt));
        }

        let stall = self.config.block_header_timeout();
        let mut unmined_headers = 0u64;
        loop {
            let next = self
                .guard(async {
                    match time::timeout(stall, headers.recv()).await {
                        Ok(Some(SubscriptionEvent::Data(header))) => Ok(Some(header)),
                        Ok(Some(SubscriptionEvent::Error(e))) => Err(e),
                        Ok(None) => Err(ClientError::ConnectionNotOpen),
                        Err(_) => Ok(None),
                    }
                })
                .await?;
            let Some(header) = next else {
                tracing::warn!(tx_hash = %self.hash, secs = stall.as_secs(), "no block header in time, falling back to polling");
                return Ok(None);
            };

            let head = header.get("number").and_then(parse_quantity);
            if let Some(receipt) = self.observe(head).await? {
                return Ok(Some(receipt));
            }
            if self.mined.is_none() {
                unmined_headers += 1;
                if unmined_headers >= self.config.transaction_block_timeout {
                    return Err(self.timeout(format!("{unmined_headers} blocks")));
                }
            }
        }
    }

    async fn by_polling(&mut self) -> Result<Value, Exit> {
        let period = self.config.polling_interval().max(Duration::from_millis(1));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = Instant::now() + self.config.polling_timeout();

        loop {
            let mined = self.mined.is_some();
            let ticked = self
                .guard(async {
                    if mined {
                        ticker.tick().await;
                        return Ok::<_, ClientError>(true);
                    }
                    tokio::select! {
                        _ = ticker.tick() => Ok(true),
                        _ = time::sleep_until(deadline) => Ok(false),
                    }
                })
                .await?;
            if !ticked {
                let secs = self.config.polling_timeout().as_secs();
                return Err(self.timeout(format!("{secs} seconds")));
            }
            if let Some(receipt) = self.observe(None).await? {
                return Ok(receipt);
            }
        }
    }

    /// Advance with the chain head at `head` (fetched when unknown).
    /// Returns the receipt once enough confirmations are in.
    async fn observe(&mut self, head: Option<u64>) -> Result<Option<Value>, Exit> {
        if self.mined.is_none() {
            let Some(receipt) = self.fetch_receipt().await? else {
                return Ok(None);
            };
            let block = receipt
                .get("blockNumber")
                .and_then(parse_quantity)
                .ok_or_else(|| ClientError::InvalidResponse("receipt without a block number".into()))?;
            self.check_revert(&receipt, block).await?;
            tracing::info!(tx_hash = %self.hash, block, "transaction mined");
            self.emitter.emit(TxEvent::Receipt(receipt.clone()));
            self.mined = Some((receipt, block));
        }

        let Some((receipt, block)) = self.mined.clone() else {
            return Ok(None);
        };
        let required = self.config.transaction_confirmation_blocks;
        if self.confirmations >= required {
            return Ok(Some(receipt));
        }

        let head = match head {
            Some(h) => h,
            None => self.fetch_head().await?,
        };
        let reached = head.saturating_sub(block).min(required);
        while self.confirmations < reached {
            self.confirmations += 1;
            self.emitter.emit(TxEvent::Confirmation {
                number: self.confirmations,
                receipt: receipt.clone(),
            });
        }
        Ok((self.confirmations >= required).then_some(receipt))
    }

    async fn fetch_receipt(&mut self) -> Result<Option<Value>, Exit> {
        let (manager, methods) = (self.manager.clone(), self.methods.clone());
        let hash = Value::String(self.hash.clone());
        let receipt = self
            .guard(async move { methods.get_transaction_receipt.call(&manager, vec![hash]).await })
            .await?;
        Ok((!receipt.is_null()).then_some(receipt))
    }

    async fn fetch_head(&mut self) -> Result<u64, Exit> {
        let (manager, methods) = (self.manager.clone(), self.methods.clone());
        let head = self
            .guard(async move { methods.block_number.call(&manager, vec![]).await })
            .await?;
        parse_quantity(&head)
            .ok_or_else(|| Exit::Failed(ClientError::InvalidResponse(format!("{head} is not a block number"))))
    }

    /// Fails when the receipt says the transaction reverted. With
    /// `handle_revert` the call is also replayed at the receipt's block,
    /// whatever the status says, and a replay that reverts fails the watch.
    async fn check_revert(&mut self, receipt: &Value, block: u64) -> Result<(), Exit> {
        let status = receipt_status(receipt);
        let replay = if self.config.handle_revert {
            self.replay.clone()
        } else {
            None
        };
        let replayed = match replay {
            Some(call) => Some(self.replay_call(call, block).await?),
            None => None,
        };
        let reason = match (status, replayed) {
            (_, Some(Replay::Reverted(reason))) => reason,
            (Some(false), _) => None,
            _ => return Ok(()),
        };
        Err(ClientError::Reverted {
            reason,
            receipt: Box::new(receipt.clone()),
        }
        .into())
    }

    async fn replay_call(&mut self, call: Value, block: u64) -> Result<Replay, Exit> {
        let manager = self.manager.clone();
        let outcome = self
            .guard(async move {
                let block = Value::String(to_quantity(block));
                Ok::<_, ClientError>(manager.send("eth_call", vec![call, block]).await)
            })
            .await?;
        Ok(match outcome {
            Ok(Value::String(data)) => match decode_revert_hex(&data) {
                Some(reason) => Replay::Reverted(Some(reason)),
                None => Replay::Clean,
            },
            Err(ClientError::Rpc(e)) => {
                let reason = reason_from_rpc_error(&e);
                if reason.is_some() || e.message.to_ascii_lowercase().contains("revert") {
                    Replay::Reverted(reason)
                } else {
                    tracing::debug!(tx_hash = %self.hash, error = %e, "call replay failed");
                    Replay::Clean
                }
            }
            _ => Replay::Clean,
        })
    }
}

/// Outcome of replaying a mined transaction's call.
enum Replay {
    Clean,
    Reverted(Option<String>),
}
