//! Tunnel error taxonomy.

use std::net::SocketAddr;

/// Errors surfaced by the tunnel lifecycle manager and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Required target or tunnel fields are missing or out of range.
    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfiguration(String),

    /// The credential store has no secret for the logical name.
    #[error("No credentials stored for '{name}'")]
    MissingCredentials { name: String },

    /// The credential store itself failed (locked keychain, backend error).
    #[error("Credential store error: {0}")]
    Credential(String),

    /// Transport-level failure while establishing the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A forwarded sub-channel could not be opened over the connection.
    #[error("Failed to open forwarded channel: {0}")]
    ChannelOpenFailed(String),

    #[error("Failed to bind local listener on {addr}: {source}")]
    ListenerBindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Max reconnection attempts ({attempts}) exceeded")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("Tunnel is already connected")]
    AlreadyConnected,

    #[error("Tunnel is not connected")]
    NotConnected,

    /// The manager reached its terminal state and cannot be restarted.
    #[error("Tunnel manager has been stopped")]
    Stopped,
}

impl TunnelError {
    pub(crate) fn bind_failed(addr: SocketAddr, source: std::io::Error) -> Self {
        TunnelError::ListenerBindFailed {
            addr: addr.to_string(),
            source,
        }
    }

    /// Whether the reconnect loop should keep spending attempts on this error.
    ///
    /// Missing credentials and bad configuration do not resolve by waiting,
    /// so they end the reconnect loop immediately.
    pub fn is_retriable(&self) -> bool {
        match self {
            TunnelError::ConnectionFailed(_)
            | TunnelError::ChannelOpenFailed(_)
            | TunnelError::ListenerBindFailed { .. }
            | TunnelError::Credential(_)
            | TunnelError::NotConnected => true,
            TunnelError::InvalidConfiguration(_)
            | TunnelError::MissingCredentials { .. }
            | TunnelError::MaxRetriesExceeded { .. }
            | TunnelError::AlreadyConnected
            | TunnelError::Stopped => false,
        }
    }
}
