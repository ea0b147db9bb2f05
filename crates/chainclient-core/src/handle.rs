//! Event handles: a typed terminal outcome plus a stream of named events.
//!
//! The producing task owns an [`EventEmitter`]; the caller holds the
//! matching [`EventHandle`], which is a future for the terminal result and
//! also lets it attach named listeners or take an event receiver. Listeners
//! attached late are replayed every event emitted so far, in order. After
//! the outcome settles or [`EventHandle::stop_watching`] is called, no
//! further event is delivered.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ClientError;

/// Events that can be filtered by name.
pub trait NamedEvent: Clone + Send + 'static {
    fn name(&self) -> &'static str;
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct State<E, T> {
    done: bool,
    history: Vec<E>,
    listeners: Vec<(Option<&'static str>, Listener<E>)>,
    sinks: Vec<mpsc::UnboundedSender<E>>,
    outcome: Option<oneshot::Sender<Result<T, ClientError>>>,
}

struct Shared<E, T> {
    /// Serialises delivery so replay and live events never interleave.
    delivery: ReentrantMutex<()>,
    state: Mutex<State<E, T>>,
    stop: watch::Sender<bool>,
}

impl<E, T> Shared<E, T> {
    /// Mark done, drop every listener and sink, hand back the outcome sender.
    fn close(&self) -> Option<oneshot::Sender<Result<T, ClientError>>> {
        let mut st = self.state.lock();
        if st.done {
            return None;
        }
        st.done = true;
        st.listeners.clear();
        st.sinks.clear();
        st.outcome.take()
    }
}

/// Create a connected emitter/handle pair.
pub fn event_channel<E: NamedEvent, T>() -> (EventEmitter<E, T>, EventHandle<E, T>) {
    let (tx, rx) = oneshot::channel();
    let (stop, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        delivery: ReentrantMutex::new(()),
        state: Mutex::new(State {
            done: false,
            history: Vec::new(),
            listeners: Vec::new(),
            sinks: Vec::new(),
            outcome: Some(tx),
        }),
        stop,
    });
    (
        EventEmitter {
            shared: shared.clone(),
        },
        EventHandle { shared, outcome: rx },
    )
}

/// Producer side of an event handle.
pub struct EventEmitter<E, T> {
    shared: Arc<Shared<E, T>>,
}

impl<E: NamedEvent, T> EventEmitter<E, T> {
    /// Deliver `event`. Returns `false` once the handle is settled or stopped.
    pub fn emit(&self, event: E) -> bool {
        let _delivery = self.shared.delivery.lock();
        let (listeners, sinks) = {
            let mut st = self.shared.state.lock();
            if st.done {
                return false;
            }
            st.history.push(event.clone());
            (st.listeners.clone(), st.sinks.clone())
        };
        let name = event.name();
        for (filter, listener) in listeners {
            if filter.map_or(true, |f| f == name) {
                listener(&event);
            }
        }
        for sink in sinks {
            let _ = sink.send(event.clone());
        }
        true
    }

    /// Settle the handle with `value`. Later calls are ignored.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle the handle with `err`. Later calls are ignored.
    pub fn reject(&self, err: ClientError) -> bool {
        self.settle(Err(err))
    }

    fn settle(&self, outcome: Result<T, ClientError>) -> bool {
        let _delivery = self.shared.delivery.lock();
        match self.shared.close() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// Resolves when the caller stops watching.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.stop.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

impl<E, T> Drop for EventEmitter<E, T> {
    fn drop(&mut self) {
        // Dropping the sender makes the handle resolve to `WatchStopped`.
        drop(self.shared.close());
    }
}

/// Caller side of an event handle. Awaiting it yields the terminal outcome.
pub struct EventHandle<E, T> {
    shared: Arc<Shared<E, T>>,
    outcome: oneshot::Receiver<Result<T, ClientError>>,
}

impl<E: NamedEvent, T> EventHandle<E, T> {
    /// Call `listener` for every event named `name`, including past ones.
    pub fn on<F>(&self, name: &'static str, listener: F) -> &Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(name), Arc::new(listener));
        self
    }

    /// Call `listener` for every event, including past ones.
    pub fn on_any<F>(&self, listener: F) -> &Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener));
        self
    }

    fn register(&self, filter: Option<&'static str>, listener: Listener<E>) {
        let _delivery = self.shared.delivery.lock();
        let history = {
            let mut st = self.shared.state.lock();
            if st.done {
                return;
            }
            st.listeners.push((filter, listener.clone()));
            st.history.clone()
        };
        for event in history.iter().filter(|e| filter.map_or(true, |f| f == e.name())) {
            listener(event);
        }
    }

    /// A receiver primed with every event so far. Closes when the handle
    /// settles or is stopped.
    pub fn events(&self) -> mpsc::UnboundedReceiver<E> {
        let _delivery = self.shared.delivery.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.shared.state.lock();
        for event in &st.history {
            let _ = tx.send(event.clone());
        }
        if !st.done {
            st.sinks.push(tx);
        }
        rx
    }

    /// Stop delivering events. Awaiting the handle afterwards yields
    /// [`ClientError::WatchStopped`] unless it had already settled.
    pub fn stop_watching(&self) {
        let _delivery = self.shared.delivery.lock();
        if let Some(tx) = self.shared.close() {
            let _ = tx.send(Err(ClientError::WatchStopped));
        }
        self.shared.stop.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }
}

impl<E, T> Future for EventHandle<E, T> {
    type Output = Result<T, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ClientError::WatchStopped)))
    }
}
