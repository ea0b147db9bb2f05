//! Opening the transport an [`Endpoint`] selects.

use std::sync::Arc;

use chainclient_core::transport::RpcTransport;
use chainclient_http::{HttpTransport, HttpTransportConfig};
use chainclient_ipc::IpcTransportConfig;
use chainclient_ws::{WsTransport, WsTransportConfig};

use crate::endpoint::{Endpoint, ProviderError};

/// Environment variable consulted when no endpoint is given.
pub const ENDPOINT_ENV: &str = "ETH_RPC_URL";

/// Per-transport settings; only the one matching the endpoint is used.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub http: HttpTransportConfig,
    pub ws: WsTransportConfig,
    pub ipc: IpcTransportConfig,
}

/// Open the transport selected by `endpoint`.
pub async fn connect(
    endpoint: &Endpoint,
    options: &TransportOptions,
) -> Result<Arc<dyn RpcTransport>, ProviderError> {
    tracing::info!(endpoint = %endpoint, "opening transport");
    let transport: Arc<dyn RpcTransport> = match endpoint {
        Endpoint::Http(url) => Arc::new(HttpTransport::new(url.clone(), options.http.clone())?),
        Endpoint::Ws(url) => Arc::new(WsTransport::connect(url.clone(), options.ws.clone()).await?),
        Endpoint::Ipc(path) => connect_ipc(path, &options.ipc).await?,
    };
    Ok(transport)
}

#[cfg(unix)]
async fn connect_ipc(
    path: &std::path::Path,
    config: &IpcTransportConfig,
) -> Result<Arc<dyn RpcTransport>, ProviderError> {
    let transport = chainclient_ipc::IpcTransport::connect(path, config.clone()).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(unix))]
async fn connect_ipc(
    _path: &std::path::Path,
    _config: &IpcTransportConfig,
) -> Result<Arc<dyn RpcTransport>, ProviderError> {
    Err(chainclient_core::TransportError::Unsupported("IPC on this platform").into())
}

/// Parse `endpoint` and open its transport.
pub async fn connect_str(
    endpoint: &str,
    options: &TransportOptions,
) -> Result<Arc<dyn RpcTransport>, ProviderError> {
    connect(&endpoint.parse()?, options).await
}

/// Open the transport named by [`ENDPOINT_ENV`].
pub async fn connect_env(options: &TransportOptions) -> Result<Arc<dyn RpcTransport>, ProviderError> {
    let endpoint = endpoint_from_env()?;
    connect(&endpoint, options).await
}

fn endpoint_from_env() -> Result<Endpoint, ProviderError> {
    match std::env::var(ENDPOINT_ENV) {
        Ok(url) if !url.trim().is_empty() => url.parse(),
        _ => Err(ProviderError::MissingEndpoint(ENDPOINT_ENV)),
    }
}
