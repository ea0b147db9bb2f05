//! The `RpcTransport` trait: the capability surface every transport exposes.
//!
//! Two kinds exist:
//! - **unary** transports (HTTP) return the reply body from [`RpcTransport::send`]
//!   and never push;
//! - **duplex** transports (WebSocket, IPC) return `None` from `send` and
//!   deliver every inbound frame, replies and pushes alike, to the handlers
//!   registered through [`RpcTransport::on_message`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::request::{Envelope, Incoming, Reply};

/// Default per-kind listener count above which a leak warning is logged.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Handler for inbound frames on a duplex transport.
pub type MessageHandler = Arc<dyn Fn(Incoming) + Send + Sync>;
/// Handler for connection loss; receives a human-readable reason.
pub type CloseHandler = Arc<dyn Fn(String) + Send + Sync>;
/// Handler fired after a successful reconnect.
pub type ReconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Whether the transport can receive server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Unary,
    Duplex,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::Duplex => write!(f, "duplex"),
        }
    }
}

/// Opaque registration token returned by `on_*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    message: Vec<(ListenerId, MessageHandler)>,
    close: Vec<(ListenerId, CloseHandler)>,
    reconnect: Vec<(ListenerId, ReconnectHandler)>,
}

/// Listener bookkeeping shared by the duplex transports.
///
/// Handlers are cloned out of the lock before being invoked, so a handler
/// may register or remove listeners without deadlocking.
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: Mutex<Listeners>,
    max_listeners: AtomicU64,
    leak_warnings: AtomicU64,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LISTENERS)
    }
}

impl ListenerSet {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Listeners::default()),
            max_listeners: AtomicU64::new(max_listeners as u64),
            leak_warnings: AtomicU64::new(0),
        }
    }

    fn next(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn check_leak(&self, kind: &'static str, count: usize) {
        let max = self.max_listeners.load(Ordering::Relaxed) as usize;
        if max > 0 && count > max {
            self.leak_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind,
                count,
                max,
                "possible listener leak detected: too many listeners attached"
            );
        }
    }

    pub fn add_message(&self, handler: MessageHandler) -> ListenerId {
        let id = self.next();
        let count = {
            let mut l = self.listeners.lock();
            l.message.push((id, handler));
            l.message.len()
        };
        self.check_leak("message", count);
        id
    }

    pub fn add_close(&self, handler: CloseHandler) -> ListenerId {
        let id = self.next();
        let count = {
            let mut l = self.listeners.lock();
            l.close.push((id, handler));
            l.close.len()
        };
        self.check_leak("close", count);
        id
    }

    pub fn add_reconnect(&self, handler: ReconnectHandler) -> ListenerId {
        let id = self.next();
        let count = {
            let mut l = self.listeners.lock();
            l.reconnect.push((id, handler));
            l.reconnect.len()
        };
        self.check_leak("reconnect", count);
        id
    }

    /// Remove one listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut l = self.listeners.lock();
        let before = l.message.len() + l.close.len() + l.reconnect.len();
        l.message.retain(|(i, _)| *i != id);
        l.close.retain(|(i, _)| *i != id);
        l.reconnect.retain(|(i, _)| *i != id);
        before != l.message.len() + l.close.len() + l.reconnect.len()
    }

    /// Drop every registered listener.
    pub fn clear(&self) {
        *self.listeners.lock() = Listeners::default();
    }

    /// Total number of registered listeners across all kinds.
    pub fn len(&self) -> usize {
        let l = self.listeners.lock();
        l.message.len() + l.close.len() + l.reconnect.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_max_listeners(&self, max: usize) {
        self.max_listeners.store(max as u64, Ordering::Relaxed);
    }

    pub fn max_listeners(&self) -> usize {
        self.max_listeners.load(Ordering::Relaxed) as usize
    }

    /// Number of leak warnings logged so far.
    pub fn leak_warnings(&self) -> u64 {
        self.leak_warnings.load(Ordering::Relaxed)
    }

    pub fn emit_message(&self, msg: Incoming) {
        let handlers: Vec<MessageHandler> =
            self.listeners.lock().message.iter().map(|(_, h)| h.clone()).collect();
        for h in handlers {
            h(msg.clone());
        }
    }

    pub fn emit_close(&self, reason: &str) {
        let handlers: Vec<CloseHandler> =
            self.listeners.lock().close.iter().map(|(_, h)| h.clone()).collect();
        for h in handlers {
            h(reason.to_string());
        }
    }

    pub fn emit_reconnect(&self) {
        let handlers: Vec<ReconnectHandler> =
            self.listeners.lock().reconnect.iter().map(|(_, h)| h.clone()).collect();
        for h in handlers {
            h();
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .field("max_listeners", &self.max_listeners())
            .finish()
    }
}

/// The central async trait every RPC transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Put one envelope (single or batch) on the wire.
    ///
    /// Unary transports return `Some(reply)`. Duplex transports return
    /// `None`; the reply arrives through the message listeners. A send on a
    /// disconnected duplex transport fails with [`TransportError::NotConnected`]
    /// and is never queued.
    async fn send(&self, envelope: Envelope) -> Result<Option<Reply>, TransportError>;

    /// Return the transport's identifier (URL or socket path).
    fn url(&self) -> &str;

    fn kind(&self) -> TransportKind;

    fn is_connected(&self) -> bool;

    fn supports_subscriptions(&self) -> bool {
        self.kind() == TransportKind::Duplex
    }

    /// Listener bookkeeping for duplex transports; `None` for unary ones.
    fn listeners(&self) -> Option<&ListenerSet> {
        None
    }

    fn on_message(&self, handler: MessageHandler) -> Result<ListenerId, TransportError> {
        self.listeners()
            .map(|l| l.add_message(handler))
            .ok_or(TransportError::Unsupported("push listeners"))
    }

    fn on_close(&self, handler: CloseHandler) -> Result<ListenerId, TransportError> {
        self.listeners()
            .map(|l| l.add_close(handler))
            .ok_or(TransportError::Unsupported("close listeners"))
    }

    fn on_reconnect(&self, handler: ReconnectHandler) -> Result<ListenerId, TransportError> {
        self.listeners()
            .map(|l| l.add_reconnect(handler))
            .ok_or(TransportError::Unsupported("reconnect listeners"))
    }

    /// Release every listener attached to this transport.
    fn detach(&self) {
        if let Some(l) = self.listeners() {
            l.clear();
        }
    }

    fn listener_count(&self) -> usize {
        self.listeners().map(ListenerSet::len).unwrap_or(0)
    }

    /// No-op unless the transport keeps a listener-count guard.
    fn set_max_listeners(&self, max: usize) {
        if let Some(l) = self.listeners() {
            l.set_max_listeners(max);
        }
    }

    /// Re-establish the connection where the transport allows it.
    async fn reconnect(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("reconnect"))
    }

    /// Close the connection. Close listeners fire once.
    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_in_registration_order() {
        let set = ListenerSet::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            set.add_close(Arc::new(move |_: String| order.lock().push(n)));
        }
        set.emit_close("bye");
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn remove_and_clear() {
        let set = ListenerSet::default();
        let a = set.add_reconnect(Arc::new(|| {}));
        let _b = set.add_message(Arc::new(|_: Incoming| {}));
        assert_eq!(set.len(), 2);
        assert!(set.remove(a));
        assert!(!set.remove(a));
        assert_eq!(set.len(), 1);
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn warns_past_threshold() {
        let set = ListenerSet::new(2);
        for _ in 0..3 {
            set.add_close(Arc::new(|_: String| {}));
        }
        assert_eq!(set.leak_warnings(), 1);
        set.set_max_listeners(0);
        set.add_close(Arc::new(|_: String| {}));
        assert_eq!(set.leak_warnings(), 1);
    }

    #[test]
    fn handler_may_touch_set_while_emitting() {
        let set = Arc::new(ListenerSet::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = set.clone();
        let h = hits.clone();
        set.add_reconnect(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            inner.add_close(Arc::new(|_: String| {}));
        }));
        set.emit_reconnect();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);
    }
}
