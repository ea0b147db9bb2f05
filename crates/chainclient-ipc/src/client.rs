//! Unix-socket JSON-RPC transport.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use chainclient_core::error::TransportError;
use chainclient_core::request::{parse_incoming, Envelope, Reply};
use chainclient_core::transport::{ListenerSet, RpcTransport, TransportKind};

use crate::config::IpcTransportConfig;
use crate::framing::FrameDecoder;

struct Shared {
    path: PathBuf,
    url: String,
    config: IpcTransportConfig,
    connected: AtomicBool,
    /// Bumped per connection; a reader from an older one never reports.
    generation: AtomicU64,
    listeners: ListenerSet,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: SyncMutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Mark the connection `generation` as gone. Close listeners fire once.
    fn lost(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(url = %self.url, reason, "IPC connection lost");
            self.listeners.emit_close(reason);
        }
    }
}

/// Duplex transport over a Unix domain socket.
pub struct IpcTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for IpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcTransport")
            .field("path", &self.shared.path)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl IpcTransport {
    /// Connect to the socket at `path`.
    pub async fn connect(path: impl AsRef<Path>, config: IpcTransportConfig) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let shared = Arc::new(Shared {
            url: path.display().to_string(),
            path,
            config,
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            listeners: ListenerSet::default(),
            writer: Mutex::new(None),
            reader: SyncMutex::new(None),
        });
        open(&shared).await?;
        Ok(Self { shared })
    }

    pub async fn connect_default(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        Self::connect(path, IpcTransportConfig::default()).await
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Tear down the current connection, firing close listeners once.
    async fn shutdown(&self, reason: &str) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(reader) = self.shared.reader.lock().take() {
            reader.abort();
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.lost(generation, reason);
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.shared.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn open(shared: &Arc<Shared>) -> Result<(), TransportError> {
    tracing::info!(url = %shared.url, "connecting via IPC");
    let timeout = shared.config.connect_timeout;
    let stream = tokio::time::timeout(timeout, UnixStream::connect(&shared.path))
        .await
        .map_err(|_| TransportError::Timeout {
            ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| TransportError::Ipc(format!("connecting to {}: {e}", shared.url)))?;

    let (read_half, write_half) = stream.into_split();
    let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
    *shared.writer.lock().await = Some(write_half);
    shared.connected.store(true, Ordering::SeqCst);

    let reader = tokio::spawn(read_loop(shared.clone(), read_half, generation));
    if let Some(old) = shared.reader.lock().replace(reader) {
        old.abort();
    }
    Ok(())
}

async fn read_loop(shared: Arc<Shared>, mut read_half: OwnedReadHalf, generation: u64) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => return shared.lost(generation, "socket closed by peer"),
            Ok(n) => n,
            Err(e) => return shared.lost(generation, &e.to_string()),
        };
        let frames = decoder.decode(&chunk[..n]);
        if decoder.len() > shared.config.max_message_size {
            return shared.lost(generation, "inbound message too large");
        }
        for frame in frames {
            match parse_incoming(frame) {
                Ok(incoming) => shared.listeners.emit_message(incoming),
                Err(e) => tracing::debug!(error = %e, "unparseable IPC frame dropped"),
            }
        }
    }
}

#[async_trait]
impl RpcTransport for IpcTransport {
    async fn send(&self, envelope: Envelope) -> Result<Option<Reply>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = envelope.to_json()?;
        let generation = self.shared.generation.load(Ordering::SeqCst);

        let write_op = async {
            let mut guard = self.shared.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
            writer
                .write_all(text.as_bytes())
                .await
                .map_err(|e| TransportError::Ipc(e.to_string()))
        };

        let result = match self.shared.config.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, write_op)
                .await
                .unwrap_or(Err(TransportError::Timeout {
                    ms: timeout.as_millis() as u64,
                })),
            None => write_op.await,
        };
        if let Err(TransportError::Ipc(reason)) = &result {
            self.shared.lost(generation, reason);
        }
        result.map(|_| None)
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
        self.shutdown("reconnect requested").await;
        open(&self.shared).await?;
        tracing::info!(url = %self.shared.url, "IPC reconnected");
        self.shared.listeners.emit_reconnect();
        Ok(())
    }

    async fn disconnect(&self) {
        self.shutdown("connection closed by client").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainclient_core::request::{Incoming, JsonRpcRequest, JsonRpcResponse};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    fn socket_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("chainclient-{tag}-{}.ipc", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Answers each request twice in one write: once whole, once split
    /// across two writes, so framing has to reassemble.
    async fn echo_server(path: &Path) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut decoder = FrameDecoder::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        for frame in decoder.decode(&chunk[..n]) {
                            let req: JsonRpcRequest = serde_json::from_value(frame).unwrap();
                            let id = req.id_u64().unwrap();
                            let out = serde_json::to_vec(&JsonRpcResponse::success(id, json!("0x1"))).unwrap();
                            let (head, tail) = out.split_at(out.len() / 2);
                            stream.write_all(head).await.unwrap();
                            stream.flush().await.unwrap();
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            stream.write_all(tail).await.unwrap();
                        }
                    }
                });
            }
        });
    }

    fn collect(t: &IpcTransport) -> mpsc::UnboundedReceiver<Incoming> {
        let (tx, rx) = mpsc::unbounded_channel();
        t.on_message(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }))
        .unwrap();
        rx
    }

    #[tokio::test]
    async fn split_replies_are_reassembled() {
        let path = socket_path("split");
        echo_server(&path).await;
        let t = IpcTransport::connect_default(&path).await.unwrap();
        let mut rx = collect(&t);

        for id in [7, 8] {
            t.send(Envelope::Single(JsonRpcRequest::new(id, "eth_blockNumber", vec![])))
                .await
                .unwrap();
        }
        let mut ids = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Incoming::Response(r) => ids.push(r.id.as_u64().unwrap()),
                other => panic!("unexpected {other:?}"),
            }
        }
        ids.sort();
        assert_eq!(ids, vec![7, 8]);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn disconnect_fires_close_once_and_fails_sends() {
        let path = socket_path("close");
        echo_server(&path).await;
        let t = IpcTransport::connect_default(&path).await.unwrap();
        let closes = Arc::new(SyncMutex::new(0));
        let c = closes.clone();
        t.on_close(Arc::new(move |_: String| *c.lock() += 1)).unwrap();

        t.disconnect().await;
        t.disconnect().await;
        assert_eq!(*closes.lock(), 1);
        let err = t
            .send(Envelope::Single(JsonRpcRequest::new(1, "eth_blockNumber", vec![])))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reconnect_restores_the_connection() {
        let path = socket_path("reconnect");
        echo_server(&path).await;
        let t = IpcTransport::connect_default(&path).await.unwrap();
        let reconnects = Arc::new(SyncMutex::new(0));
        let r = reconnects.clone();
        t.on_reconnect(Arc::new(move || *r.lock() += 1)).unwrap();
        let mut rx = collect(&t);

        t.reconnect().await.unwrap();
        assert!(t.is_connected());
        assert_eq!(*reconnects.lock(), 1);
        t.send(Envelope::Single(JsonRpcRequest::new(3, "eth_chainId", vec![])))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Incoming::Response(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_socket_is_an_ipc_error() {
        let path = socket_path("missing");
        let err = IpcTransport::connect_default(&path).await.unwrap_err();
        assert!(matches!(err, TransportError::Ipc(_)));
    }
}
