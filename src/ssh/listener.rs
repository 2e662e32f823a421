//! Local TCP listener feeding relay sessions.

use super::error::TunnelError;
use super::relay::RelaySession;
use super::transport::{Connection, ForwardingHandle};
use smol::Task;
use smol::net::{TcpListener, TcpStream};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the executor.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay sessions opened against one connection.
///
/// Each session runs as its own task; closing the registry cancels every
/// task, which drops both sockets of each session. A closed registry
/// refuses new sessions, so nothing opened against a torn-down connection
/// can slip in afterwards.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<async_lock::Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, Task<()>>,
    closed: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `session` and track it. Returns false (without spawning) if the
    /// registry is already closed.
    pub async fn register<F>(&self, id: Uuid, session: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        inner.sessions.retain(|_, task| !task.is_finished());
        inner.sessions.insert(id, smol::spawn(session));
        true
    }

    /// Sessions still running
    pub async fn active_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.sessions.retain(|_, task| !task.is_finished());
        inner.sessions.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Cancel every session and wait until their sockets are dropped.
    pub async fn close_all(&self) -> usize {
        let tasks: Vec<Task<()>> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.sessions.drain().map(|(_, task)| task).collect()
        };

        let count = tasks.len();
        for task in tasks {
            task.cancel().await;
        }
        if count > 0 {
            tracing::debug!("Closed {} relay session(s)", count);
        }
        count
    }
}

/// A bound local socket. Each bind is a fresh listener; it is never rebound.
pub struct LocalListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl LocalListener {
    /// Bind the local socket. Failure is reported, not retried.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TunnelError::bind_failed(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::bind_failed(addr, e))?;

        tracing::info!("Local listener bound on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept clients until the task running this future is cancelled.
    ///
    /// Every accepted socket gets a freshly opened forwarded channel. If the
    /// channel cannot be opened the socket is closed right away.
    pub async fn serve<C: Connection>(self, forwarder: ForwardingHandle<C>, sessions: SessionRegistry) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(
                        "Accepted {} on {} -> {}",
                        peer,
                        self.local_addr,
                        forwarder.remote()
                    );
                    let id = Uuid::new_v4();
                    let forwarder = forwarder.clone();
                    if !sessions
                        .register(id, handle_client(id, stream, peer, forwarder))
                        .await
                    {
                        tracing::debug!("Dropped {} accepted during teardown", peer);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection on {}: {}", self.local_addr, e);
                    smol::Timer::after(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn handle_client<C: Connection>(
    id: Uuid,
    stream: TcpStream,
    peer: SocketAddr,
    forwarder: ForwardingHandle<C>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
    }

    let channel = match forwarder.open().await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!("Closing {}: {}", peer, e);
            return;
        }
    };

    let session = RelaySession::new(id, stream, channel);
    match session.run().await {
        Ok(stats) => tracing::debug!(
            "Relay {} for {} finished: {} bytes up, {} bytes down",
            id,
            peer,
            stats.local_to_remote,
            stats.remote_to_local
        ),
        Err(e) => tracing::debug!("Relay {} for {} ended with error: {}", id, peer, e),
    }
}
