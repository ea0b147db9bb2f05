//! Scripted in-memory transports shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use chainclient_core::error::TransportError;
use chainclient_core::request::{
    Envelope, Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Reply,
    SubscriptionNotification,
};
use chainclient_core::transport::{ListenerSet, RpcTransport, TransportKind};

/// Answers a request; `None` leaves it unanswered.
pub type Script = Arc<dyn Fn(&JsonRpcRequest) -> Option<Result<Value, JsonRpcError>> + Send + Sync>;

/// Extra frames a duplex fake emits right after answering a request.
pub type FollowUp = Arc<dyn Fn(&JsonRpcRequest, &JsonRpcResponse) -> Vec<Incoming> + Send + Sync>;

pub fn script<F>(f: F) -> Script
where
    F: Fn(&JsonRpcRequest) -> Option<Result<Value, JsonRpcError>> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn answer(script: &Script, req: &JsonRpcRequest) -> Option<JsonRpcResponse> {
    let id = req.id_u64()?;
    Some(match script(req)? {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => JsonRpcResponse {
            error: Some(e),
            ..JsonRpcResponse::failure(id, 0, "")
        },
    })
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Duplex fake. Replies are delivered through the message listeners from
/// inside `send`; batch replies come back in reverse order.
pub struct FakeDuplex {
    listeners: ListenerSet,
    connected: AtomicBool,
    script: Mutex<Script>,
    follow_up: Mutex<Option<FollowUp>>,
    sent: Mutex<Vec<JsonRpcRequest>>,
}

impl FakeDuplex {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            listeners: ListenerSet::default(),
            connected: AtomicBool::new(true),
            script: Mutex::new(script),
            follow_up: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_follow_up(&self, follow_up: FollowUp) {
        *self.follow_up.lock() = Some(follow_up);
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Every request put on the wire so far, batch members included.
    pub fn sent(&self) -> Vec<JsonRpcRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent.lock().iter().map(|r| r.method.clone()).collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.method == method).count()
    }

    /// Deliver a subscription push.
    pub fn push(&self, subscription: &str, result: Value) {
        let n = SubscriptionNotification::new("eth", subscription, result);
        self.listeners.emit_message(Incoming::Notification(n));
    }

    /// Deliver a raw frame, e.g. a late or duplicate response.
    pub fn inject(&self, msg: Incoming) {
        self.listeners.emit_message(msg);
    }

    /// Simulate the peer closing the connection.
    pub fn drop_connection(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.listeners.emit_close(reason);
        }
    }

    /// Simulate the connection coming back after a drop.
    pub fn restore(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.listeners.emit_reconnect();
        }
    }
}

#[async_trait]
impl RpcTransport for FakeDuplex {
    async fn send(&self, envelope: Envelope) -> Result<Option<Reply>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let script = self.script.lock().clone();
        match envelope {
            Envelope::Single(req) => {
                self.sent.lock().push(req.clone());
                if let Some(resp) = answer(&script, &req) {
                    let follow_up = self.follow_up.lock().clone();
                    let extra = follow_up.map(|f| f(&req, &resp)).unwrap_or_default();
                    self.listeners.emit_message(Incoming::Response(resp));
                    for msg in extra {
                        self.listeners.emit_message(msg);
                    }
                }
            }
            Envelope::Batch(reqs) => {
                self.sent.lock().extend(reqs.iter().cloned());
                let mut responses: Vec<_> = reqs.iter().filter_map(|r| answer(&script, r)).collect();
                responses.reverse();
                self.listeners.emit_message(Incoming::Batch(responses));
            }
        }
        Ok(None)
    }

    fn url(&self) -> &str {
        "fake://duplex"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn listeners(&self) -> Option<&ListenerSet> {
        Some(&self.listeners)
    }

    async fn disconnect(&self) {
        self.drop_connection("connection closed by client");
    }
}

/// Unary fake, like HTTP: every send returns its reply directly.
pub struct FakeUnary {
    script: Script,
    /// Never answer; every send hangs.
    stalled: bool,
    sent: Mutex<Vec<JsonRpcRequest>>,
}

impl FakeUnary {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            stalled: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            script: script(|_| None),
            stalled: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self, method: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.method == method).count()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent.lock().iter().map(|r| r.method.clone()).collect()
    }
}

#[async_trait]
impl RpcTransport for FakeUnary {
    async fn send(&self, envelope: Envelope) -> Result<Option<Reply>, TransportError> {
        if self.stalled {
            match &envelope {
                Envelope::Single(req) => self.sent.lock().push(req.clone()),
                Envelope::Batch(reqs) => self.sent.lock().extend(reqs.iter().cloned()),
            }
            return std::future::pending().await;
        }
        match envelope {
            Envelope::Single(req) => {
                self.sent.lock().push(req.clone());
                answer(&self.script, &req)
                    .map(|r| Some(Reply::Single(r)))
                    .ok_or_else(|| TransportError::Http(format!("no route for {}", req.method)))
            }
            Envelope::Batch(reqs) => {
                self.sent.lock().extend(reqs.iter().cloned());
                let responses = reqs.iter().filter_map(|r| answer(&self.script, r)).collect();
                Ok(Some(Reply::Batch(responses)))
            }
        }
    }

    fn url(&self) -> &str {
        "fake://unary"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Unary
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Poll `cond` until it holds, yielding to spawned tasks in between.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

pub fn tx_hash() -> String {
    format!("0x{}", "ab".repeat(32))
}

pub fn receipt(block: u64, status: bool) -> Value {
    serde_json::json!({
        "transactionHash": tx_hash(),
        "blockNumber": format!("{block:#x}"),
        "gasUsed": "0x5208",
        "status": if status { "0x1" } else { "0x0" },
        "logs": [],
    })
}
