//! WebSocket JSON-RPC transport with auto-reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainclient_core::error::TransportError;
use chainclient_core::request::{parse_incoming, parse_incoming_str, Envelope, Reply};
use chainclient_core::transport::{ListenerSet, RpcTransport, TransportKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Ack = oneshot::Sender<Result<(), TransportError>>;

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Re-dial automatically after the socket drops.
    pub auto_reconnect: bool,
    /// Reconnect backoff starting duration.
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max: Duration,
    /// Give up after this many failed dials; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
            max_reconnect_attempts: Some(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send { text: String, ack: Ack },
    Reconnect { ack: Ack },
    Close { ack: Option<oneshot::Sender<()>> },
}

struct Shared {
    url: String,
    connected: AtomicBool,
    listeners: ListenerSet,
}

/// Duplex WebSocket transport.
///
/// A background task owns the socket. Replies and pushes are delivered to
/// the message listeners; `send` only reports whether the frame was written.
pub struct WsTransport {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.shared.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WsTransport {
    /// Connect to `url` and start the background task.
    pub async fn connect(url: impl Into<String>, config: WsTransportConfig) -> Result<Self, TransportError> {
        let url = url.into();
        tracing::info!(url = %url, "connecting via WebSocket");
        let ws = dial(&url, config.connect_timeout).await?;

        let shared = Arc::new(Shared {
            url,
            connected: AtomicBool::new(true),
            listeners: ListenerSet::default(),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(ws_task(shared.clone(), ws, cmd_rx, config));

        Ok(Self { shared, cmd_tx })
    }

    /// Connect with default configuration.
    pub async fn connect_default(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::connect(url, WsTransportConfig::default()).await
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close { ack: None });
    }
}

#[async_trait]
impl RpcTransport for WsTransport {
    async fn send(&self, envelope: Envelope) -> Result<Option<Reply>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = envelope.to_json()?;
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { text, ack })
            .map_err(|_| TransportError::NotConnected)?;
        rx.await.map_err(|_| TransportError::NotConnected)??;
        Ok(None)
    }

    fn url(&self) -> &str {
        &self.shared.url
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn listeners(&self) -> Option<&ListenerSet> {
        Some(&self.shared.listeners)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let (ack, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Reconnect { ack })
            .map_err(|_| TransportError::NotConnected)?;
        rx.await.map_err(|_| TransportError::NotConnected)?
    }

    async fn disconnect(&self) {
        let (ack, rx) = oneshot::channel();
        if self.cmd_tx.send(WsCommand::Close { ack: Some(ack) }).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn dial(url: &str, timeout: Duration) -> Result<WsStream, TransportError> {
    match time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((ws, _))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::WebSocket(e.to_string())),
        Err(_) => Err(TransportError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    }
}

enum State {
    Open(WsStream),
    /// Disconnected and not dialing; sends fail until asked to reconnect.
    Idle,
    /// Dialing; acks of callers waiting on an explicit reconnect.
    Dialing(Vec<Ack>),
}

/// Why the socket stopped pumping.
enum End {
    Lost(String),
    Reconnect(Ack),
    Closed(Option<oneshot::Sender<()>>),
}

/// Background task that owns the WebSocket connection.
async fn ws_task(
    shared: Arc<Shared>,
    ws: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    config: WsTransportConfig,
) {
    let mut state = State::Open(ws);
    loop {
        state = match state {
            State::Open(ws) => {
                let end = pump(&shared, ws, &mut cmd_rx).await;
                shared.connected.store(false, Ordering::SeqCst);
                match end {
                    End::Closed(ack) => {
                        tracing::info!(url = %shared.url, "WebSocket closed");
                        shared.listeners.emit_close("connection closed by client");
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        return;
                    }
                    End::Lost(reason) => {
                        tracing::warn!(url = %shared.url, reason = %reason, "WebSocket disconnected");
                        shared.listeners.emit_close(&reason);
                        if config.auto_reconnect {
                            State::Dialing(Vec::new())
                        } else {
                            State::Idle
                        }
                    }
                    End::Reconnect(ack) => {
                        shared.listeners.emit_close("reconnect requested");
                        State::Dialing(vec![ack])
                    }
                }
            }
            State::Idle => match cmd_rx.recv().await {
                None => return,
                Some(WsCommand::Send { ack, .. }) => {
                    let _ = ack.send(Err(TransportError::NotConnected));
                    State::Idle
                }
                Some(WsCommand::Reconnect { ack }) => State::Dialing(vec![ack]),
                Some(WsCommand::Close { ack }) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
            },
            State::Dialing(mut acks) => {
                let dialed = redial(&shared.url, &mut cmd_rx, &config, &mut acks).await;
                match dialed {
                    Ok(ws) => {
                        shared.connected.store(true, Ordering::SeqCst);
                        tracing::info!(url = %shared.url, "WebSocket reconnected");
                        for ack in acks {
                            let _ = ack.send(Ok(()));
                        }
                        shared.listeners.emit_reconnect();
                        State::Open(ws)
                    }
                    Err(Some(err)) => {
                        tracing::warn!(url = %shared.url, error = %err, "giving up reconnecting");
                        for ack in acks {
                            let _ = ack.send(Err(err.clone()));
                        }
                        State::Idle
                    }
                    Err(None) => {
                        for ack in acks {
                            let _ = ack.send(Err(TransportError::NotConnected));
                        }
                        return;
                    }
                }
            }
        };
    }
}

/// Move frames between the command channel and the socket until it ends.
async fn pump(shared: &Shared, ws: WsStream, cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>) -> End {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return End::Closed(None);
                }
                Some(WsCommand::Close { ack }) => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return End::Closed(ack);
                }
                Some(WsCommand::Reconnect { ack }) => {
                    let _ = sink.close().await;
                    return End::Reconnect(ack);
                }
                Some(WsCommand::Send { text, ack }) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        let reason = e.to_string();
                        let _ = ack.send(Err(TransportError::WebSocket(reason.clone())));
                        return End::Lost(reason);
                    }
                    let _ = ack.send(Ok(()));
                }
            },
            msg = stream.next() => match msg {
                None => return End::Lost("stream ended".into()),
                Some(Err(e)) => return End::Lost(e.to_string()),
                Some(Ok(Message::Text(text))) => match parse_incoming_str(text.as_str()) {
                    Ok(incoming) => shared.listeners.emit_message(incoming),
                    Err(e) => tracing::debug!(error = %e, "unparseable WebSocket frame dropped"),
                },
                Some(Ok(Message::Binary(bytes))) => {
                    match serde_json::from_slice(&bytes).map_err(TransportError::from).and_then(parse_incoming) {
                        Ok(incoming) => shared.listeners.emit_message(incoming),
                        Err(e) => tracing::debug!(error = %e, "unparseable WebSocket frame dropped"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by server ({}): {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by server".into());
                    return End::Lost(reason);
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Dial with exponential backoff while answering commands.
///
/// Returns the new socket, `Err(Some(e))` when out of attempts, or
/// `Err(None)` when the caller closed the transport meanwhile.
async fn redial(
    url: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    config: &WsTransportConfig,
    acks: &mut Vec<Ack>,
) -> Result<WsStream, Option<TransportError>> {
    let mut backoff = config.reconnect_initial;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        tracing::info!(url = %url, attempt, "reconnecting via WebSocket");
        let result = {
            let dialing = dial(url, config.connect_timeout);
            tokio::pin!(dialing);
            loop {
                tokio::select! {
                    res = &mut dialing => break res,
                    cmd = cmd_rx.recv() => {
                        if let Some(close) = while_down(cmd, acks) {
                            if let Some(ack) = close {
                                let _ = ack.send(());
                            }
                            return Err(None);
                        }
                    }
                }
            }
        };

        let err = match result {
            Ok(ws) => return Ok(ws),
            Err(e) => e,
        };
        if config.max_reconnect_attempts.is_some_and(|max| attempt >= max) {
            return Err(Some(err));
        }
        tracing::warn!(error = %err, "WS connect failed, retrying in {backoff:?}");

        let sleep = time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => {
                    if let Some(close) = while_down(cmd, acks) {
                        if let Some(ack) = close {
                            let _ = ack.send(());
                        }
                        return Err(None);
                    }
                }
            }
        }
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

/// Handle a command while no socket is open. Returns `Some` when the
/// transport is being closed.
fn while_down(cmd: Option<WsCommand>, acks: &mut Vec<Ack>) -> Option<Option<oneshot::Sender<()>>> {
    match cmd {
        None => Some(None),
        Some(WsCommand::Close { ack }) => Some(ack),
        Some(WsCommand::Send { ack, .. }) => {
            let _ = ack.send(Err(TransportError::NotConnected));
            None
        }
        Some(WsCommand::Reconnect { ack }) => {
            acks.push(ack);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainclient_core::request::{Incoming, JsonRpcRequest, JsonRpcResponse};
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Accepts connections and answers every request with `result: "0x1"`.
    /// The first connection is dropped after `drop_after` replies.
    async fn echo_server(drop_after: Option<usize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((tcp, _)) = listener.accept().await {
                let limit = if first { drop_after } else { None };
                first = false;
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    let mut served = 0;
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(text) = msg {
                            let req: JsonRpcRequest = serde_json::from_str(text.as_str()).unwrap();
                            let resp = JsonRpcResponse::success(req.id_u64().unwrap(), json!("0x1"));
                            let out = serde_json::to_string(&resp).unwrap();
                            ws.send(Message::Text(out.into())).await.unwrap();
                            served += 1;
                            if limit == Some(served) {
                                return;
                            }
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn quick(auto_reconnect: bool) -> WsTransportConfig {
        WsTransportConfig {
            auto_reconnect,
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
            max_reconnect_attempts: Some(3),
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn replies_arrive_through_listeners() {
        let url = echo_server(None).await;
        let t = WsTransport::connect(url, quick(false)).await.unwrap();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        t.on_message(Arc::new(move |msg| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(msg);
            }
        }))
        .unwrap();

        let sent = t
            .send(Envelope::Single(JsonRpcRequest::new(42, "eth_blockNumber", vec![])))
            .await
            .unwrap();
        assert!(sent.is_none());
        match rx.await.unwrap() {
            Incoming::Response(r) => assert_eq!(r.id.as_u64(), Some(42)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_drop_fires_close_and_fails_sends() {
        let url = echo_server(Some(1)).await;
        let t = WsTransport::connect(url, quick(false)).await.unwrap();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        t.on_close(Arc::new(move |reason| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reason);
            }
        }))
        .unwrap();

        t.send(Envelope::Single(JsonRpcRequest::new(1, "eth_blockNumber", vec![])))
            .await
            .unwrap();
        rx.await.unwrap();
        assert!(!t.is_connected());
        let err = t
            .send(Envelope::Single(JsonRpcRequest::new(2, "eth_blockNumber", vec![])))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn auto_reconnect_fires_reconnect_listeners() {
        let url = echo_server(Some(1)).await;
        let t = WsTransport::connect(url, quick(true)).await.unwrap();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        t.on_reconnect(Arc::new(move || {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        }))
        .unwrap();

        t.send(Envelope::Single(JsonRpcRequest::new(1, "eth_blockNumber", vec![])))
            .await
            .unwrap();
        time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert!(t.is_connected());
    }

    #[tokio::test]
    async fn manual_reconnect_and_disconnect() {
        let url = echo_server(None).await;
        let t = WsTransport::connect(url, quick(false)).await.unwrap();
        t.reconnect().await.unwrap();
        assert!(t.is_connected());

        let closes = Arc::new(Mutex::new(0));
        let c = closes.clone();
        t.on_close(Arc::new(move |_: String| *c.lock() += 1)).unwrap();
        t.disconnect().await;
        assert!(!t.is_connected());
        assert_eq!(*closes.lock(), 1);
    }

    #[tokio::test]
    async fn detach_clears_listeners() {
        let url = echo_server(None).await;
        let t = WsTransport::connect(url, quick(false)).await.unwrap();
        t.on_message(Arc::new(|_: Incoming| {})).unwrap();
        t.on_close(Arc::new(|_: String| {})).unwrap();
        assert_eq!(t.listener_count(), 2);
        t.detach();
        assert_eq!(t.listener_count(), 0);
    }
}
