//! Tunnel lifecycle manager.
//!
//! One control-loop task owns the connection, the local listener and the
//! reconnect counter. `start()` and `stop()` are messages to that task, and
//! health-check ticks and reconnect delays are timers it races against its
//! command queue. Every state transition therefore happens on one task and
//! connect, reconnect and stop never overlap.

use super::credentials::{CREDENTIAL_SERVICE, CredentialSource};
use super::error::TunnelError;
use super::listener::{LocalListener, SessionRegistry};
use super::reconnect::ExponentialBackoff;
use super::transport::{Connection, ForwardingHandle, Transport};
use super::types::{AuthMethod, Secret, ServerTarget, TunnelConfig};
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::channel::oneshot;
use smol::{Task, Timer};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunnel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Not started, or the first connect attempt failed
    Disconnected,
    /// First connect attempt in flight
    Connecting,
    /// Connection live, listener accepting
    Connected,
    /// Liveness lost; retrying under backoff
    Reconnecting,
    /// Terminal
    Stopped,
}

impl TunnelState {
    /// Returns true if the tunnel is usable for connections
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Stopped)
    }
}

/// Observable notification from the control loop
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelEvent {
    pub at: DateTime<Utc>,
    pub kind: TunnelEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEventKind {
    StateChanged {
        from: TunnelState,
        to: TunnelState,
    },
    ListenerBound {
        addr: SocketAddr,
    },
    ReconnectScheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    ReconnectFailed {
        attempt: u32,
        error: String,
    },
    MaxRetriesExceeded {
        attempts: u32,
    },
}

enum Command {
    Start(oneshot::Sender<Result<(), TunnelError>>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: TunnelState,
    local_addr: Option<SocketAddr>,
    reconnect_attempts: u32,
}

/// Read side of the control loop's state, shared with the handle.
struct Shared {
    snapshot: async_lock::RwLock<Snapshot>,
    subscribers: async_lock::Mutex<Vec<Sender<TunnelEvent>>>,
}

impl Shared {
    async fn emit(&self, kind: TunnelEventKind) {
        let event = TunnelEvent {
            at: Utc::now(),
            kind,
        };
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

/// Keeps one SSH tunnel alive and exposes it on a local TCP port.
///
/// Dropping the manager stops the tunnel: the control loop sees its command
/// queue close, tears down listener, sessions and connection, then exits.
/// Use [`TunnelManager::shutdown`] to wait for that to finish.
pub struct TunnelManager<T: Transport, C: CredentialSource> {
    target: ServerTarget,
    commands: Sender<Command>,
    shared: Arc<Shared>,
    control: Option<Task<()>>,
    _marker: std::marker::PhantomData<fn() -> (T, C)>,
}

impl<T: Transport, C: CredentialSource> TunnelManager<T, C> {
    /// Validate the configuration and spawn the control loop.
    pub fn new(
        target: ServerTarget,
        config: TunnelConfig,
        transport: T,
        credentials: C,
    ) -> Result<Self, TunnelError> {
        target.validate()?;
        config.validate()?;

        let (commands, command_rx) = async_channel::bounded(32);
        let shared = Arc::new(Shared {
            snapshot: async_lock::RwLock::new(Snapshot {
                state: TunnelState::Disconnected,
                local_addr: None,
                reconnect_attempts: 0,
            }),
            subscribers: async_lock::Mutex::new(Vec::new()),
        });

        let control = ControlLoop {
            backoff: ExponentialBackoff::new(config.reconnect.clone()),
            target: target.clone(),
            config,
            transport: Arc::new(transport),
            credentials: Arc::new(credentials),
            commands: command_rx,
            shared: shared.clone(),
            state: TunnelState::Disconnected,
            active: None,
        };

        Ok(Self {
            target,
            commands,
            shared,
            control: Some(smol::spawn(control.run())),
            _marker: std::marker::PhantomData,
        })
    }

    /// Connect, bind the local listener and arm the health check.
    ///
    /// Resolves once the first connect attempt does. A failed first attempt
    /// is not retried; the manager stays `Disconnected`.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start(reply))
            .await
            .map_err(|_| TunnelError::Stopped)?;
        response.await.map_err(|_| TunnelError::Stopped)?
    }

    /// Stop the tunnel. Idempotent; returns once everything is closed.
    pub async fn stop(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Stop(reply)).await.is_ok() {
            let _ = response.await;
        }
    }

    /// Stop and wait for the control loop to exit.
    pub async fn shutdown(mut self) {
        self.stop().await;
        if let Some(control) = self.control.take() {
            control.await;
        }
    }

    pub async fn state(&self) -> TunnelState {
        self.shared.snapshot.read().await.state
    }

    /// Address the local listener is bound to while connected
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.snapshot.read().await.local_addr
    }

    /// Consecutive failed reconnect attempts so far
    pub async fn reconnect_attempts(&self) -> u32 {
        self.shared.snapshot.read().await.reconnect_attempts
    }

    /// Receive every event emitted from now on.
    pub async fn subscribe(&self) -> Receiver<TunnelEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.shared.subscribers.lock().await.push(tx);
        rx
    }

    /// Whether the control loop is still alive (false once stopped)
    pub fn is_running(&self) -> bool {
        self.control.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn target(&self) -> &ServerTarget {
        &self.target
    }
}

impl<T: Transport, C: CredentialSource> Drop for TunnelManager<T, C> {
    fn drop(&mut self) {
        // Let the loop finish its teardown after the command queue closes
        if let Some(control) = self.control.take() {
            control.detach();
        }
    }
}

/// Everything that exists only while connected.
struct ActiveTunnel<Conn: Connection> {
    connection: Arc<Conn>,
    listener: Task<()>,
    sessions: SessionRegistry,
    local_addr: SocketAddr,
}

enum Wake<T> {
    Command(Command),
    Ready(T),
    Closed,
}

enum ConnectOutcome<Conn: Connection> {
    Connected(ActiveTunnel<Conn>),
    Failed(TunnelError),
    /// Stop (or manager drop) arrived mid-connect; the attempt was abandoned
    Cancelled(Option<oneshot::Sender<()>>),
}

struct ControlLoop<T: Transport, C: CredentialSource> {
    target: ServerTarget,
    config: TunnelConfig,
    transport: Arc<T>,
    credentials: Arc<C>,
    commands: Receiver<Command>,
    shared: Arc<Shared>,
    state: TunnelState,
    backoff: ExponentialBackoff,
    active: Option<ActiveTunnel<T::Connection>>,
}

impl<T: Transport, C: CredentialSource> ControlLoop<T, C> {
    async fn run(mut self) {
        loop {
            match self.state {
                TunnelState::Disconnected | TunnelState::Connecting => self.idle().await,
                TunnelState::Connected => self.supervise().await,
                TunnelState::Reconnecting => self.reconnect().await,
                TunnelState::Stopped => break,
            }
        }
        tracing::debug!("Control loop for {} exited", self.target.ssh_url());
    }

    /// Disconnected: wait for start or stop.
    async fn idle(&mut self) {
        match wait_for(&self.commands, futures::future::pending::<()>()).await {
            Wake::Command(Command::Start(reply)) => {
                let result = self.start_first().await;
                let _ = reply.send(result);
            }
            Wake::Command(Command::Stop(reply)) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            Wake::Closed | Wake::Ready(()) => self.shutdown().await,
        }
    }

    async fn start_first(&mut self) -> Result<(), TunnelError> {
        self.set_state(TunnelState::Connecting).await;
        match self.connect().await {
            ConnectOutcome::Connected(active) => {
                self.commit(active).await;
                tracing::info!(
                    "Tunnel established: {} -> {}:{} via {}",
                    self.active_addr(),
                    self.config.remote_host,
                    self.config.remote_port,
                    self.target.ssh_url()
                );
                Ok(())
            }
            ConnectOutcome::Failed(e) => {
                tracing::warn!("Initial connect to {} failed: {}", self.target.ssh_url(), e);
                self.set_state(TunnelState::Disconnected).await;
                Err(e)
            }
            ConnectOutcome::Cancelled(reply) => {
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                Err(TunnelError::Stopped)
            }
        }
    }

    /// Connected: run the health check until liveness is lost or stopped.
    async fn supervise(&mut self) {
        let mut ticker = Timer::interval(self.config.health_check_interval);
        loop {
            let command = match wait_for(&self.commands, ticker.next()).await {
                // Commands are still served while the check runs
                Wake::Ready(_) => match wait_for(&self.commands, self.check_liveness()).await {
                    Wake::Ready(true) => continue,
                    Wake::Ready(false) => {
                        tracing::warn!(
                            "Connection to {} is no longer active, reconnecting",
                            self.target.ssh_url()
                        );
                        self.teardown().await;
                        self.set_state(TunnelState::Reconnecting).await;
                        return;
                    }
                    Wake::Command(command) => Some(command),
                    Wake::Closed => None,
                },
                Wake::Command(command) => Some(command),
                Wake::Closed => None,
            };

            match command {
                Some(Command::Start(reply)) => {
                    let _ = reply.send(Err(TunnelError::AlreadyConnected));
                }
                Some(Command::Stop(reply)) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                None => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Reconnecting: bounded retries, one connect at a time.
    async fn reconnect(&mut self) {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempt();
                tracing::error!(
                    "Giving up on {} after {} reconnect attempts",
                    self.target.ssh_url(),
                    attempts
                );
                self.shared
                    .emit(TunnelEventKind::MaxRetriesExceeded { attempts })
                    .await;
                self.shutdown().await;
                return;
            };

            let attempt = self.backoff.attempt();
            let max_attempts = self.backoff.max_attempts();
            self.shared.snapshot.write().await.reconnect_attempts = attempt;
            self.shared
                .emit(TunnelEventKind::ReconnectScheduled {
                    attempt,
                    max_attempts,
                    delay,
                })
                .await;
            tracing::info!(
                "Reconnect attempt {}/{} to {} in {:?}",
                attempt,
                max_attempts,
                self.target.ssh_url(),
                delay
            );

            // Start requests during the delay must not restart it
            let deadline = Instant::now() + delay;
            loop {
                match wait_for(&self.commands, Timer::at(deadline)).await {
                    Wake::Ready(_) => break,
                    Wake::Command(Command::Start(reply)) => {
                        let _ = reply.send(Err(TunnelError::AlreadyConnected));
                    }
                    Wake::Command(Command::Stop(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Wake::Closed => {
                        self.shutdown().await;
                        return;
                    }
                }
            }

            match self.connect().await {
                ConnectOutcome::Connected(active) => {
                    self.commit(active).await;
                    tracing::info!(
                        "Tunnel to {} re-established after {} attempt(s)",
                        self.target.ssh_url(),
                        attempt
                    );
                    return;
                }
                ConnectOutcome::Failed(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.shared
                        .emit(TunnelEventKind::ReconnectFailed {
                            attempt,
                            error: e.to_string(),
                        })
                        .await;
                    if !e.is_retriable() {
                        tracing::error!("Not retrying {}: {}", self.target.ssh_url(), e);
                        self.shutdown().await;
                        return;
                    }
                }
                ConnectOutcome::Cancelled(reply) => {
                    self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
            }
        }
    }

    /// Run one connect cycle, still answering commands while it is in flight.
    ///
    /// A stop abandons the attempt by dropping it, so a late result can
    /// never be committed after stop has run.
    async fn connect(&self) -> ConnectOutcome<T::Connection> {
        let attempt = establish(
            self.transport.clone(),
            self.credentials.clone(),
            self.target.clone(),
            self.config.clone(),
        );
        futures::pin_mut!(attempt);

        loop {
            let step = smol::future::or(
                async {
                    match self.commands.recv().await {
                        Ok(command) => Err(Some(command)),
                        Err(_) => Err(None),
                    }
                },
                async { Ok(attempt.as_mut().await) },
            )
            .await;

            match step {
                Ok(Ok(active)) => return ConnectOutcome::Connected(active),
                Ok(Err(e)) => return ConnectOutcome::Failed(e),
                Err(Some(Command::Start(reply))) => {
                    let _ = reply.send(Err(TunnelError::AlreadyConnected));
                }
                Err(Some(Command::Stop(reply))) => {
                    tracing::debug!("Stop requested mid-connect, abandoning attempt");
                    return ConnectOutcome::Cancelled(Some(reply));
                }
                Err(None) => return ConnectOutcome::Cancelled(None),
            }
        }
    }

    async fn commit(&mut self, active: ActiveTunnel<T::Connection>) {
        let addr = active.local_addr;
        self.active = Some(active);
        self.backoff.reset();
        {
            let mut snapshot = self.shared.snapshot.write().await;
            snapshot.local_addr = Some(addr);
            snapshot.reconnect_attempts = 0;
        }
        self.shared
            .emit(TunnelEventKind::ListenerBound { addr })
            .await;
        self.set_state(TunnelState::Connected).await;
    }

    async fn check_liveness(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        let timeout = self.config.connect_timeout;
        smol::future::or(active.connection.is_active(), async {
            Timer::after(timeout).await;
            tracing::warn!("Liveness check timed out after {:?}", timeout);
            false
        })
        .await
    }

    /// Close listener, sessions and connection, in that order.
    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.listener.cancel().await;
        let sessions = active.sessions.close_all().await;
        active.connection.close().await;
        self.shared.snapshot.write().await.local_addr = None;

        tracing::info!(
            "Closed tunnel on {} ({} relay session(s) terminated)",
            active.local_addr,
            sessions
        );
    }

    async fn shutdown(&mut self) {
        self.teardown().await;
        self.set_state(TunnelState::Stopped).await;
    }

    async fn set_state(&mut self, to: TunnelState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.shared.snapshot.write().await.state = to;
        tracing::debug!("Tunnel {} state {:?} -> {:?}", self.target.name, from, to);
        self.shared
            .emit(TunnelEventKind::StateChanged { from, to })
            .await;
    }

    fn active_addr(&self) -> String {
        self.active
            .as_ref()
            .map(|active| active.local_addr.to_string())
            .unwrap_or_default()
    }
}

/// Wait for the next command, or for `fut` to finish.
async fn wait_for<F: Future>(commands: &Receiver<Command>, fut: F) -> Wake<F::Output> {
    smol::future::or(
        async {
            match commands.recv().await {
                Ok(command) => Wake::Command(command),
                Err(_) => Wake::Closed,
            }
        },
        async { Wake::Ready(fut.await) },
    )
    .await
}

/// One connect cycle: credential, transport handshake, listener bind.
async fn establish<T: Transport, C: CredentialSource>(
    transport: Arc<T>,
    credentials: Arc<C>,
    target: ServerTarget,
    config: TunnelConfig,
) -> Result<ActiveTunnel<T::Connection>, TunnelError> {
    let secret = resolve_credential(credentials, &target).await?;

    let timeout = config.connect_timeout;
    let connection = smol::future::or(transport.connect(&target, secret), async {
        Timer::after(timeout).await;
        Err(TunnelError::ConnectionFailed(format!(
            "handshake with {}:{} timed out after {:?}",
            target.ssh_host, target.ssh_port, timeout
        )))
    })
    .await?;
    let connection = Arc::new(connection);

    let listener = match LocalListener::bind(config.bind_addr()?).await {
        Ok(listener) => listener,
        Err(e) => {
            connection.close().await;
            return Err(e);
        }
    };

    let local_addr = listener.local_addr();
    let sessions = SessionRegistry::new();
    let forwarder = ForwardingHandle::new(connection.clone(), &config.remote_host, config.remote_port);
    let listener = smol::spawn(listener.serve(forwarder, sessions.clone()));

    Ok(ActiveTunnel {
        connection,
        listener,
        sessions,
        local_addr,
    })
}

async fn resolve_credential<C: CredentialSource>(
    credentials: Arc<C>,
    target: &ServerTarget,
) -> Result<Option<Secret>, TunnelError> {
    let name = target.name.clone();
    let secret = smol::unblock(move || credentials.lookup(CREDENTIAL_SERVICE, &name)).await?;

    match (secret, &target.auth_method) {
        (Some(secret), _) => Ok(Some(secret)),
        (None, AuthMethod::PublicKey { .. }) => Ok(None),
        (None, AuthMethod::Password) => Err(TunnelError::MissingCredentials {
            name: target.name.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_state_is_connected() {
        assert!(!TunnelState::Disconnected.is_connected());
        assert!(!TunnelState::Connecting.is_connected());
        assert!(TunnelState::Connected.is_connected());
        assert!(!TunnelState::Reconnecting.is_connected());
        assert!(!TunnelState::Stopped.is_connected());
        assert!(TunnelState::Stopped.is_terminal());
    }

    #[test]
    fn test_wait_for_prefers_commands() {
        smol::block_on(async {
            let (tx, rx) = async_channel::bounded(1);
            let (reply, _response) = oneshot::channel();
            tx.send(Command::Stop(reply)).await.unwrap();

            let wake = wait_for(&rx, async {}).await;
            assert!(matches!(wake, Wake::Command(Command::Stop(_))));

            let wake = wait_for(&rx, Timer::after(Duration::from_millis(10))).await;
            assert!(matches!(wake, Wake::Ready(_)));

            drop(tx);
            let wake = wait_for(&rx, futures::future::pending::<()>()).await;
            assert!(matches!(wake, Wake::Closed));
        });
    }
}
