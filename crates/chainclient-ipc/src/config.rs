//! IPC transport settings.

use std::time::Duration;

/// Configuration for the IPC transport.
#[derive(Debug, Clone)]
pub struct IpcTransportConfig {
    pub connect_timeout: Duration,
    /// Write timeout (None for no timeout)
    pub write_timeout: Option<Duration>,
    /// Inbound bytes buffered without a complete document before the
    /// connection is considered broken.
    pub max_message_size: usize,
}

impl Default for IpcTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Some(Duration::from_secs(30)),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}
