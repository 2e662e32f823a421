//! Transport provider seam.
//!
//! A [`Transport`] opens one authenticated, multiplexed [`Connection`] to a
//! remote host. Forwarded sub-channels are opened over that connection, each
//! one a byte stream to a host:port as seen from the remote side.

use super::error::TunnelError;
use super::types::{Secret, ServerTarget};
use futures::io::{AsyncRead, AsyncWrite};
use std::future::Future;
use std::sync::Arc;

/// Establishes authenticated multiplexed connections.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Connect and authenticate. `credential` is `None` only for
    /// key-based targets without a stored passphrase.
    fn connect(
        &self,
        target: &ServerTarget,
        credential: Option<Secret>,
    ) -> impl Future<Output = Result<Self::Connection, TunnelError>> + Send;
}

/// A live multiplexed connection.
pub trait Connection: Send + Sync + 'static {
    type Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a sub-channel forwarded to `host:port` on the remote side.
    fn open_forwarded_channel(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Channel, TunnelError>> + Send;

    /// Liveness check used by the health check.
    fn is_active(&self) -> impl Future<Output = bool> + Send;

    /// Close the connection and every sub-channel multiplexed over it.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Capability to open forwarded channels to one fixed remote endpoint.
///
/// Built by the manager right after a connect succeeds and handed to the
/// listener; relay code never sees the manager or the raw connection.
pub struct ForwardingHandle<C: Connection> {
    connection: Arc<C>,
    remote_host: Arc<str>,
    remote_port: u16,
}

impl<C: Connection> ForwardingHandle<C> {
    pub fn new(connection: Arc<C>, remote_host: &str, remote_port: u16) -> Self {
        Self {
            connection,
            remote_host: Arc::from(remote_host),
            remote_port,
        }
    }

    /// Open a new sub-channel to the bound remote endpoint
    pub async fn open(&self) -> Result<C::Channel, TunnelError> {
        self.connection
            .open_forwarded_channel(&self.remote_host, self.remote_port)
            .await
    }

    /// The forwarded endpoint as `host:port`
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl<C: Connection> Clone for ForwardingHandle<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }
}
