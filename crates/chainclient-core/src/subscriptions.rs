//! Subscription bookkeeping.
//!
//! Tracks live `<ns>_subscribe` subscriptions, fans pushes out to their
//! listeners, and keeps dormant entries around across a reconnect so they
//! can be re-issued. The registry does no I/O; the request manager issues
//! the subscribe/unsubscribe calls and feeds the results in here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ClientError;
use crate::request::SubscriptionNotification;

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local key of an entry. Stable across resubscription, unlike the server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(u64);

/// Identifies one listener inside an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// What a subscription listener receives.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Data(Value),
    Error(ClientError),
}

pub type SubscriptionListener = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

struct SubscriptionEntry {
    /// `None` while dormant (transport closed, waiting for resubscribe).
    id: Option<SubscriptionId>,
    namespace: String,
    event_name: String,
    /// Parameters for re-subscribing (e.g. filter params).
    params: Vec<Value>,
    listeners: Vec<(ListenerToken, SubscriptionListener)>,
    /// Pushes waiting behind an in-progress replay of early pushes.
    backlog: Option<Vec<Value>>,
}

/// Everything needed to re-issue a dormant subscription.
#[derive(Debug, Clone)]
pub struct DormantSubscription {
    pub key: SubscriptionKey,
    pub namespace: String,
    pub event_name: String,
    pub params: Vec<Value>,
}

/// Result of removing a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Unknown key or token; nothing changed.
    NotFound,
    /// Other listeners remain on the entry.
    Remaining,
    /// The entry is gone. `id` is set when it was live and the server-side
    /// subscription must be cancelled.
    Emptied {
        namespace: String,
        id: Option<SubscriptionId>,
    },
}

#[derive(Default)]
struct RegistryInner {
    next_key: u64,
    next_token: u64,
    entries: HashMap<SubscriptionKey, SubscriptionEntry>,
    by_id: HashMap<SubscriptionId, SubscriptionKey>,
    /// Subscribe calls awaiting their reply.
    in_flight: usize,
    /// Pushes for ids not yet registered, kept while a subscribe is in flight.
    early: HashMap<SubscriptionId, Vec<Value>>,
}

impl RegistryInner {
    fn token(&mut self) -> ListenerToken {
        self.next_token += 1;
        ListenerToken(self.next_token)
    }
}

/// Most pushes buffered per unknown id while a subscribe is in flight.
const MAX_EARLY_PUSHES: usize = 256;

/// Marks a subscribe call as in flight; see [`SubscriptionRegistry::begin_subscribe`].
pub struct InFlightSubscribe {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Drop for InFlightSubscribe {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            inner.early.clear();
        }
    }
}

/// Manages active subscriptions and supports re-subscription.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a subscribe call. Until the guard drops, pushes for unknown
    /// ids are buffered and replayed once [`Self::insert`] or
    /// [`Self::revive`] binds the id, so a push that overtakes the
    /// subscribe reply is not lost.
    pub fn begin_subscribe(&self) -> InFlightSubscribe {
        self.inner.lock().in_flight += 1;
        InFlightSubscribe {
            inner: self.inner.clone(),
        }
    }

    /// Register a freshly created subscription with its first listener.
    pub fn insert(
        &self,
        id: SubscriptionId,
        namespace: impl Into<String>,
        event_name: impl Into<String>,
        params: Vec<Value>,
        listener: SubscriptionListener,
    ) -> (SubscriptionKey, ListenerToken) {
        let (key, token) = {
            let mut inner = self.inner.lock();
            inner.next_key += 1;
            let key = SubscriptionKey(inner.next_key);
            let token = inner.token();
            let backlog = inner.early.remove(&id);
            inner.by_id.insert(id.clone(), key);
            inner.entries.insert(
                key,
                SubscriptionEntry {
                    id: Some(id),
                    namespace: namespace.into(),
                    event_name: event_name.into(),
                    params,
                    listeners: vec![(token, listener)],
                    backlog,
                },
            );
            (key, token)
        };
        self.flush(key);
        (key, token)
    }

    /// Deliver buffered pushes in arrival order. Pushes dispatched while
    /// this runs queue behind them.
    fn flush(&self, key: SubscriptionKey) {
        loop {
            let (items, listeners) = {
                let mut inner = self.inner.lock();
                let Some(entry) = inner.entries.get_mut(&key) else {
                    return;
                };
                match entry.backlog.take() {
                    Some(items) if !items.is_empty() => {
                        entry.backlog = Some(Vec::new());
                        let listeners: Vec<SubscriptionListener> =
                            entry.listeners.iter().map(|(_, l)| l.clone()).collect();
                        (items, listeners)
                    }
                    _ => return,
                }
            };
            for item in items {
                for l in &listeners {
                    l(SubscriptionEvent::Data(item.clone()));
                }
            }
        }
    }

    /// Attach another listener to an existing entry.
    pub fn add_listener(
        &self,
        key: SubscriptionKey,
        listener: SubscriptionListener,
    ) -> Option<ListenerToken> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) {
            return None;
        }
        let token = inner.token();
        inner.entries.get_mut(&key)?.listeners.push((token, listener));
        Some(token)
    }

    /// Detach a listener; destroys the entry once its listener set is empty.
    pub fn remove_listener(&self, key: SubscriptionKey, token: ListenerToken) -> Removal {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return Removal::NotFound;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(t, _)| *t != token);
        if entry.listeners.len() == before {
            return Removal::NotFound;
        }
        if !entry.listeners.is_empty() {
            return Removal::Remaining;
        }
        let Some(entry) = inner.entries.remove(&key) else {
            return Removal::NotFound;
        };
        if let Some(id) = &entry.id {
            inner.by_id.remove(id);
        }
        Removal::Emptied {
            namespace: entry.namespace,
            id: entry.id,
        }
    }

    /// Forward a push to every listener of the matching entry, in
    /// registration order. Returns `false` for unknown subscription ids,
    /// unless a subscribe is in flight and the push was buffered.
    pub fn dispatch(&self, notification: &SubscriptionNotification) -> bool {
        let id = SubscriptionId(notification.params.subscription.clone());
        let result = &notification.params.result;
        let listeners: Vec<SubscriptionListener> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let entry = match inner.by_id.get(&id) {
                Some(key) => inner.entries.get_mut(key),
                None => None,
            };
            let Some(entry) = entry else {
                if inner.in_flight == 0 {
                    return false;
                }
                let early = inner.early.entry(id).or_default();
                if early.len() >= MAX_EARLY_PUSHES {
                    return false;
                }
                early.push(result.clone());
                return true;
            };
            if let Some(backlog) = entry.backlog.as_mut() {
                backlog.push(result.clone());
                return true;
            }
            entry.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for l in listeners {
            l(SubscriptionEvent::Data(notification.params.result.clone()));
        }
        true
    }

    /// Invalidate every live entry after the transport closed.
    ///
    /// Listeners receive `error`. With `keep_dormant` the entries stay around
    /// without a server id so [`Self::dormant`] can re-issue them; otherwise
    /// they are dropped.
    pub fn on_close(&self, error: ClientError, keep_dormant: bool) {
        let listeners: Vec<SubscriptionListener> = {
            let mut inner = self.inner.lock();
            inner.by_id.clear();
            let listeners = inner
                .entries
                .values()
                .filter(|e| e.id.is_some())
                .flat_map(|e| e.listeners.iter().map(|(_, l)| l.clone()))
                .collect();
            if keep_dormant {
                for entry in inner.entries.values_mut() {
                    entry.id = None;
                }
            } else {
                inner.entries.clear();
            }
            listeners
        };
        for l in listeners {
            l(SubscriptionEvent::Error(error.clone()));
        }
    }

    /// Entries waiting to be re-issued.
    pub fn dormant(&self) -> Vec<DormantSubscription> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.id.is_none())
            .map(|(key, e)| DormantSubscription {
                key: *key,
                namespace: e.namespace.clone(),
                event_name: e.event_name.clone(),
                params: e.params.clone(),
            })
            .collect()
    }

    /// Bind a dormant entry to the id returned by the re-issued subscribe.
    /// Returns `false` if the entry was removed in the meantime.
    pub fn revive(&self, key: SubscriptionKey, id: SubscriptionId) -> bool {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(entry) = inner.entries.get_mut(&key) else {
                return false;
            };
            entry.id = Some(id.clone());
            entry.backlog = inner.early.remove(&id);
            inner.by_id.insert(id, key);
        }
        self.flush(key);
        true
    }

    /// Drop an entry that could not be revived, telling its listeners why.
    pub fn fail(&self, key: SubscriptionKey, error: ClientError) {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.entries.remove(&key);
            if let Some(id) = entry.as_ref().and_then(|e| e.id.as_ref()) {
                inner.by_id.remove(id);
            }
            entry
        };
        if let Some(entry) = entry {
            for (_, l) in entry.listeners {
                l(SubscriptionEvent::Error(error.clone()));
            }
        }
    }

    /// Remove every entry; returns `(namespace, id)` of those that were live.
    pub fn drain(&self) -> Vec<(String, SubscriptionId)> {
        let mut inner = self.inner.lock();
        inner.by_id.clear();
        let live = inner
            .entries
            .drain()
            .filter_map(|(_, e)| e.id.map(|id| (e.namespace, id)))
            .collect();
        live
    }

    /// Current server id of an entry.
    pub fn id_of(&self, key: SubscriptionKey) -> Option<SubscriptionId> {
        self.inner.lock().entries.get(&key)?.id.clone()
    }

    pub fn listener_count(&self, key: SubscriptionKey) -> usize {
        self.inner
            .lock()
            .entries
            .get(&key)
            .map(|e| e.listeners.len())
            .unwrap_or(0)
    }

    /// Number of live (server-backed) subscriptions.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Returns `true` if there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
