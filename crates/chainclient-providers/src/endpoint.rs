//! Endpoint strings and the transport each one selects.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chainclient_core::error::{ClientError, TransportError};

/// Errors raised while choosing or opening a transport.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Can't autodetect provider for \"{0}\"")]
    InvalidEndpoint(String),

    #[error("no endpoint given and {0} is not set")]
    MissingEndpoint(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Transport(t) => t.into(),
            other => ClientError::Unsupported(other.to_string()),
        }
    }
}

/// A node endpoint, classified by scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// `http://` or `https://`
    Http(String),
    /// `ws://` or `wss://`
    Ws(String),
    /// `ipc://<path>`, an absolute path, or a path ending in `.ipc`.
    Ipc(PathBuf),
}

impl Endpoint {
    /// Whether the selected transport can carry subscriptions.
    pub fn is_duplex(&self) -> bool {
        !matches!(self, Self::Http(_))
    }
}

impl FromStr for Endpoint {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Ok(Self::Http(s.to_string()))
        } else if lower.starts_with("ws://") || lower.starts_with("wss://") {
            Ok(Self::Ws(s.to_string()))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(ProviderError::InvalidEndpoint(s.to_string()));
            }
            Ok(Self::Ipc(PathBuf::from(path)))
        } else if s.starts_with('/') || s.ends_with(".ipc") {
            Ok(Self::Ipc(PathBuf::from(s)))
        } else {
            Err(ProviderError::InvalidEndpoint(s.to_string()))
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ProviderError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(e: Endpoint) -> Self {
        e.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) | Self::Ws(url) => write!(f, "{url}"),
            Self::Ipc(path) => write!(f, "{}", path.display()),
        }
    }
}
