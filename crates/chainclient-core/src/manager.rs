//! `RequestManager`: request/response correlation over any transport.
//!
//! The manager owns the pending-request ledger and the subscription
//! registry. It attaches one message, one close and one reconnect listener
//! to a duplex transport; replies are matched to pending entries by id,
//! pushes are routed to the registry, and a close fails every pending entry
//! with [`ClientError::ConnectionNotOpen`]. Each entry is settled exactly
//! once: whichever path removes it from the ledger first wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::batch::BatchRequest;
use crate::config::SharedConfig;
use crate::error::ClientError;
use crate::id::{process_ids, IdGenerator};
use crate::request::{Envelope, Incoming, JsonRpcRequest, JsonRpcResponse, Reply};
use crate::subscriptions::{
    ListenerToken, Removal, SubscriptionEvent, SubscriptionId, SubscriptionKey,
    SubscriptionListener, SubscriptionRegistry,
};
use crate::transport::{RpcTransport, TransportKind};

type SingleSender = oneshot::Sender<Result<JsonRpcResponse, ClientError>>;
type BatchSender = oneshot::Sender<Result<Vec<JsonRpcResponse>, ClientError>>;

enum Pending {
    Single { method: String, tx: SingleSender },
    Batch { ids: Vec<u64>, tx: BatchSender },
}

impl Pending {
    fn fail(self, err: ClientError) {
        match self {
            Self::Single { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Self::Batch { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

#[derive(Default)]
struct Ledger {
    /// Keyed by request id; batches by the id of their first member.
    pending: HashMap<u64, Pending>,
    /// Batch member id → batch key.
    batch_index: HashMap<u64, u64>,
}

impl Ledger {
    fn take(&mut self, key: u64) -> Option<Pending> {
        let entry = self.pending.remove(&key)?;
        if let Pending::Batch { ids, .. } = &entry {
            for id in ids {
                self.batch_index.remove(id);
            }
        }
        Some(entry)
    }

    fn drain(&mut self) -> Vec<Pending> {
        self.batch_index.clear();
        self.pending.drain().map(|(_, p)| p).collect()
    }
}

/// Removes a ledger entry when the waiting future goes away, e.g. under a
/// caller-side timeout. A no-op once the entry has been settled.
struct LedgerSlot<'a> {
    inner: &'a Inner,
    key: u64,
}

impl Drop for LedgerSlot<'_> {
    fn drop(&mut self) {
        let _ = self.inner.ledger.lock().take(self.key);
    }
}

struct Inner {
    transport: RwLock<Option<Arc<dyn RpcTransport>>>,
    /// Bumped on every rebind; listeners from older bindings are ignored.
    generation: AtomicU64,
    ledger: Mutex<Ledger>,
    subscriptions: SubscriptionRegistry,
    ids: Arc<dyn IdGenerator>,
    config: SharedConfig,
    disconnects: broadcast::Sender<String>,
}

impl Inner {
    fn fail(&self, key: u64, err: ClientError) {
        let entry = self.ledger.lock().take(key);
        if let Some(entry) = entry {
            entry.fail(err);
        }
    }

    fn fail_all(&self, err: ClientError) {
        let entries = self.ledger.lock().drain();
        if !entries.is_empty() {
            tracing::warn!(count = entries.len(), error = %err, "failing pending requests");
        }
        for entry in entries {
            entry.fail(err.clone());
        }
    }

    fn resolve_single(&self, resp: JsonRpcResponse) {
        let Some(id) = resp.id.as_u64() else {
            tracing::debug!(id = %resp.id, "response without a numeric id dropped");
            return;
        };
        let entry = {
            let mut ledger = self.ledger.lock();
            let is_single = matches!(ledger.pending.get(&id), Some(Pending::Single { .. }));
            if is_single {
                ledger.take(id)
            } else {
                None
            }
        };
        match entry {
            Some(Pending::Single { method, tx }) => {
                tracing::debug!(id, method = %method, "response received");
                let _ = tx.send(Ok(resp));
            }
            Some(other) => other.fail(ClientError::InvalidResponse(
                "single response for a batch request".into(),
            )),
            None => tracing::debug!(id, "response for unknown request dropped"),
        }
    }

    fn resolve_batch(&self, responses: Vec<JsonRpcResponse>) {
        let entry = {
            let mut ledger = self.ledger.lock();
            let key = responses
                .iter()
                .filter_map(|r| r.id.as_u64())
                .find_map(|id| ledger.batch_index.get(&id).copied());
            key.and_then(|k| ledger.take(k))
        };
        match entry {
            Some(Pending::Batch { tx, .. }) => {
                let _ = tx.send(Ok(responses));
            }
            Some(other) => other.fail(ClientError::InvalidResponse(
                "batch response for a single request".into(),
            )),
            None => tracing::debug!(len = responses.len(), "batch response for unknown request dropped"),
        }
    }

    fn handle_incoming(&self, msg: Incoming) {
        match msg {
            Incoming::Response(resp) => self.resolve_single(resp),
            Incoming::Batch(responses) => self.resolve_batch(responses),
            Incoming::Notification(n) => {
                if !self.subscriptions.dispatch(&n) {
                    tracing::debug!(
                        subscription = %n.params.subscription,
                        "push for unknown subscription dropped"
                    );
                }
            }
        }
    }

    fn handle_close(&self, reason: String) {
        tracing::warn!(reason = %reason, "transport closed");
        self.fail_all(ClientError::ConnectionNotOpen);
        let keep = self.config.get().auto_resubscribe;
        self.subscriptions.on_close(ClientError::ConnectionNotOpen, keep);
        let _ = self.disconnects.send(reason);
    }
}

/// Correlates requests and responses for one client.
///
/// Cheap to clone; clones share the ledger, the registry and the transport.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestManager")
            .field("url", &self.transport().map(|t| t.url().to_string()))
            .field("pending", &self.pending_count())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl RequestManager {
    /// Manager bound to `transport`, drawing ids from the process-wide counter.
    pub fn new(transport: Arc<dyn RpcTransport>, config: SharedConfig) -> Self {
        Self::with_ids(Some(transport), config, process_ids())
    }

    /// Manager with an injected id generator; `transport` may be bound later.
    pub fn with_ids(
        transport: Option<Arc<dyn RpcTransport>>,
        config: SharedConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let (disconnects, _) = broadcast::channel(16);
        let manager = Self {
            inner: Arc::new(Inner {
                transport: RwLock::new(None),
                generation: AtomicU64::new(0),
                ledger: Mutex::new(Ledger::default()),
                subscriptions: SubscriptionRegistry::new(),
                ids,
                config,
                disconnects,
            }),
        };
        if let Some(t) = transport {
            manager.set_provider(t);
        }
        manager
    }

    /// Bind a (new) transport.
    ///
    /// Listeners on the previous transport are detached before any are
    /// attached, requests pending on it fail with a connectivity error, and
    /// its subscriptions are dropped.
    pub fn set_provider(&self, transport: Arc<dyn RpcTransport>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.inner.transport.write().replace(transport.clone());
        if let Some(old) = previous {
            old.detach();
            self.inner.fail_all(ClientError::ConnectionNotOpen);
            self.inner
                .subscriptions
                .on_close(ClientError::ConnectionNotOpen, false);
        }

        transport.set_max_listeners(self.inner.config.get().max_listeners_warning_threshold);
        if transport.kind() == TransportKind::Duplex {
            self.attach(&transport, generation);
        }
        tracing::info!(url = %transport.url(), kind = %transport.kind(), "provider set");
    }

    fn attach(&self, transport: &Arc<dyn RpcTransport>, generation: u64) {
        let live = move |weak: &Weak<Inner>| -> Option<Arc<Inner>> {
            let inner = weak.upgrade()?;
            (inner.generation.load(Ordering::SeqCst) == generation).then_some(inner)
        };

        let weak = Arc::downgrade(&self.inner);
        let on_message = transport.on_message(Arc::new(move |msg| {
            if let Some(inner) = live(&weak) {
                inner.handle_incoming(msg);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let on_close = transport.on_close(Arc::new(move |reason| {
            if let Some(inner) = live(&weak) {
                inner.handle_close(reason);
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let on_reconnect = transport.on_reconnect(Arc::new(move || {
            if let Some(inner) = live(&weak) {
                if inner.config.get().auto_resubscribe {
                    let manager = RequestManager { inner };
                    tokio::spawn(async move { manager.resubscribe().await });
                }
            }
        }));

        for result in [on_message, on_close, on_reconnect] {
            if let Err(e) = result {
                tracing::warn!(error = %e, "could not attach transport listener");
            }
        }
    }

    /// The currently bound transport.
    pub fn transport(&self) -> Option<Arc<dyn RpcTransport>> {
        self.inner.transport.read().clone()
    }

    pub fn config(&self) -> &SharedConfig {
        &self.inner.config
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.inner.subscriptions
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_connected())
    }

    pub fn supports_subscriptions(&self) -> bool {
        self.transport().is_some_and(|t| t.supports_subscriptions())
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.ledger.lock().pending.len()
    }

    /// Fires with the close reason every time the bound transport closes.
    pub fn disconnects(&self) -> broadcast::Receiver<String> {
        self.inner.disconnects.subscribe()
    }

    pub fn next_id(&self) -> u64 {
        self.inner.ids.next_id()
    }

    /// Build a request envelope with a fresh id.
    pub fn build_request(&self, method: impl Into<String>, params: Vec<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(self.next_id(), method, params)
    }

    /// Start an empty batch bound to this manager.
    pub fn batch(&self) -> BatchRequest {
        BatchRequest::new(self.clone())
    }

    fn connected_transport(&self) -> Result<Arc<dyn RpcTransport>, ClientError> {
        match self.transport() {
            Some(t) if t.is_connected() => Ok(t),
            _ => Err(ClientError::ConnectionNotOpen),
        }
    }

    /// Call `method` and return its raw `result`.
    pub async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        let resp = self.send_request(self.build_request(method, params)).await?;
        resp.into_result().map_err(ClientError::Rpc)
    }

    /// Like [`Self::send`], delivering the outcome to `callback` instead.
    pub fn send_with_callback<F>(&self, method: &str, params: Vec<Value>, callback: F)
    where
        F: FnOnce(Result<Value, ClientError>) + Send + 'static,
    {
        let manager = self.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            callback(manager.send(&method, params).await);
        });
    }

    /// Dispatch a pre-built request and wait for its matching response.
    pub async fn send_request(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, ClientError> {
        let transport = self.connected_transport()?;
        let id = req
            .id_u64()
            .ok_or_else(|| ClientError::InvalidResponse("request id must be numeric".into()))?;

        let (tx, rx) = oneshot::channel();
        self.inner.ledger.lock().pending.insert(
            id,
            Pending::Single {
                method: req.method.clone(),
                tx,
            },
        );
        let _slot = LedgerSlot { inner: &self.inner, key: id };
        tracing::debug!(id, method = %req.method, url = %transport.url(), "dispatching request");

        match transport.send(Envelope::Single(req)).await {
            Ok(None) => {}
            Ok(Some(Reply::Single(resp))) if resp.id.as_u64() == Some(id) => {
                self.inner.resolve_single(resp)
            }
            Ok(Some(Reply::Single(resp))) => self.inner.fail(
                id,
                ClientError::InvalidResponse(format!("response id {} does not match request id {id}", resp.id)),
            ),
            Ok(Some(Reply::Batch(_))) => self.inner.fail(
                id,
                ClientError::InvalidResponse("batch reply to a single request".into()),
            ),
            Err(e) => self.inner.fail(id, e.into()),
        }

        rx.await.unwrap_or(Err(ClientError::ConnectionNotOpen))
    }

    /// Dispatch several requests as one batch envelope.
    ///
    /// Responses are returned as received; matching them to requests is the
    /// caller's job (see [`BatchRequest`]).
    pub async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, ClientError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        let transport = self.connected_transport()?;
        let envelope = Envelope::Batch(reqs);
        let ids = envelope.ids();
        let Some(&key) = ids.first() else {
            return Err(ClientError::InvalidResponse("batch request ids must be numeric".into()));
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut ledger = self.inner.ledger.lock();
            for id in &ids {
                ledger.batch_index.insert(*id, key);
            }
            ledger.pending.insert(key, Pending::Batch { ids: ids.clone(), tx });
        }
        let _slot = LedgerSlot { inner: &self.inner, key };
        tracing::debug!(len = ids.len(), url = %transport.url(), "dispatching batch");

        match transport.send(envelope).await {
            Ok(None) => {}
            Ok(Some(Reply::Batch(responses))) => {
                let entry = self.inner.ledger.lock().take(key);
                if let Some(Pending::Batch { tx, .. }) = entry {
                    let _ = tx.send(Ok(responses));
                }
            }
            Ok(Some(Reply::Single(resp))) => {
                let err = match resp.error {
                    Some(e) => ClientError::Rpc(e),
                    None => ClientError::InvalidResponse("single reply to a batch request".into()),
                };
                self.inner.fail(key, err);
            }
            Err(e) => self.inner.fail(key, e.into()),
        }

        rx.await.unwrap_or(Err(ClientError::ConnectionNotOpen))
    }

    /// Issue `<namespace>_subscribe` and register `listener` on a new entry.
    ///
    /// Fails fast with [`ClientError::Unsupported`] on transports that
    /// cannot push; no request is sent in that case.
    pub async fn subscribe(
        &self,
        namespace: &str,
        event_name: &str,
        params: Vec<Value>,
        listener: SubscriptionListener,
    ) -> Result<SubscriptionHandle, ClientError> {
        let transport = self.transport().ok_or(ClientError::ConnectionNotOpen)?;
        if !transport.supports_subscriptions() {
            return Err(ClientError::Unsupported(format!("subscription \"{event_name}\"")));
        }

        let _in_flight = self.inner.subscriptions.begin_subscribe();
        let id = self.subscribe_rpc(namespace, event_name, &params).await?;
        tracing::info!(subscription = %id, event = event_name, "subscribed");
        let (key, token) =
            self.inner
                .subscriptions
                .insert(id, namespace, event_name, params, listener);
        Ok(SubscriptionHandle {
            manager: self.clone(),
            key,
            token,
        })
    }

    /// Like [`Self::subscribe`], delivering events through a channel.
    pub async fn subscribe_channel(
        &self,
        namespace: &str,
        event_name: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .subscribe(
                namespace,
                event_name,
                params,
                Arc::new(move |ev| {
                    let _ = tx.send(ev);
                }),
            )
            .await?;
        Ok((handle, rx))
    }

    async fn subscribe_rpc(
        &self,
        namespace: &str,
        event_name: &str,
        params: &[Value],
    ) -> Result<SubscriptionId, ClientError> {
        let rpc_params = std::iter::once(Value::String(event_name.to_string()))
            .chain(params.iter().cloned())
            .collect();
        let id = self.send(&format!("{namespace}_subscribe"), rpc_params).await?;
        match id {
            Value::String(s) => Ok(SubscriptionId(s)),
            other => Err(ClientError::InvalidResponse(format!(
                "subscription id must be a string, got {other}"
            ))),
        }
    }

    async fn unsubscribe_rpc(&self, namespace: &str, id: &SubscriptionId) -> Result<bool, ClientError> {
        let result = self
            .send(&format!("{namespace}_unsubscribe"), vec![Value::String(id.0.clone())])
            .await;
        match result {
            Ok(v) => Ok(v.as_bool().unwrap_or(true)),
            Err(e) if e.is_connectivity() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-issue every dormant subscription (after a reconnect).
    pub async fn resubscribe(&self) {
        for dormant in self.inner.subscriptions.dormant() {
            let _in_flight = self.inner.subscriptions.begin_subscribe();
            match self
                .subscribe_rpc(&dormant.namespace, &dormant.event_name, &dormant.params)
                .await
            {
                Ok(id) => {
                    tracing::info!(subscription = %id, event = %dormant.event_name, "resubscribed");
                    if !self.inner.subscriptions.revive(dormant.key, id.clone()) {
                        let _ = self.unsubscribe_rpc(&dormant.namespace, &id).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(event = %dormant.event_name, error = %e, "resubscribe failed");
                    self.inner.subscriptions.fail(dormant.key, e);
                }
            }
        }
    }

    /// Cancel every subscription; returns how many were live.
    pub async fn clear_subscriptions(&self) -> usize {
        let live = self.inner.subscriptions.drain();
        let count = live.len();
        for (namespace, id) in live {
            if let Err(e) = self.unsubscribe_rpc(&namespace, &id).await {
                tracing::debug!(subscription = %id, error = %e, "unsubscribe failed");
            }
        }
        count
    }

    /// Ask the transport to reconnect. Dormant subscriptions are re-issued
    /// by the reconnect listener when `auto_resubscribe` is set.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let transport = self.transport().ok_or(ClientError::ConnectionNotOpen)?;
        transport.reconnect().await.map_err(ClientError::from)
    }

    /// Close the bound transport.
    pub async fn disconnect(&self) {
        if let Some(t) = self.transport() {
            t.disconnect().await;
        }
    }
}

/// One listener on one subscription entry.
#[derive(Clone)]
pub struct SubscriptionHandle {
    manager: RequestManager,
    key: SubscriptionKey,
    token: ListenerToken,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("id", &self.id())
            .finish()
    }
}

impl SubscriptionHandle {
    /// Current server-side id; `None` once closed or while dormant.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.manager.inner.subscriptions.id_of(self.key)
    }

    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    /// Attach another listener to the same entry without a new round trip.
    pub fn share(&self, listener: SubscriptionListener) -> Option<SubscriptionHandle> {
        let token = self.manager.inner.subscriptions.add_listener(self.key, listener)?;
        Some(SubscriptionHandle {
            manager: self.manager.clone(),
            key: self.key,
            token,
        })
    }

    /// Remove this listener. When it was the last one, the server-side
    /// subscription is cancelled. Returns `Ok(false)` when there was nothing
    /// to cancel, e.g. after the transport closed.
    pub async fn unsubscribe(&self) -> Result<bool, ClientError> {
        match self.manager.inner.subscriptions.remove_listener(self.key, self.token) {
            Removal::NotFound => Ok(false),
            Removal::Remaining => Ok(true),
            Removal::Emptied { id: None, .. } => Ok(false),
            Removal::Emptied {
                namespace,
                id: Some(id),
            } => {
                tracing::info!(subscription = %id, "unsubscribing");
                self.manager.unsubscribe_rpc(&namespace, &id).await
            }
        }
    }
}
