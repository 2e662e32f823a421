//! Scripted transport for driving the manager without a real SSH server.
//!
//! Forwarded channels are plain loopback TCP connections to a
//! [`TargetServer`], so the relay path is exercised end to end.

#![allow(dead_code)]

use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tunnelkeeper::ssh::{
    Connection, CredentialSource, ReconnectConfig, Secret, ServerTarget, Transport, TunnelConfig,
    TunnelError,
};

/// Stand-in for the forwarded endpoint: echoes every byte back and reports
/// what each connection received once the peer closes.
pub struct TargetServer {
    addr: SocketAddr,
    received: async_channel::Receiver<Vec<u8>>,
    _task: smol::Task<()>,
}

impl TargetServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, received) = async_channel::unbounded();

        let task = smol::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                smol::spawn(async move {
                    let mut seen = Vec::new();
                    let mut buf = vec![0u8; 16 * 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = tx.send(seen).await;
                })
                .detach();
            }
        });

        Self {
            addr,
            received,
            _task: task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bytes received by the next connection to close
    pub async fn next_received(&self) -> Vec<u8> {
        within(Duration::from_secs(5), self.received.recv())
            .await
            .expect("target server connection never closed")
            .unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
}

struct MockState {
    remote: SocketAddr,
    script: Mutex<VecDeque<Outcome>>,
    connect_delay: Mutex<Duration>,
    connects: AtomicUsize,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
    credentials: Mutex<Vec<Option<Secret>>>,
    links: Mutex<Vec<Arc<Link>>>,
}

/// Transport whose connect results follow a script. Unscripted connects
/// succeed. Channels dial the target server regardless of the host asked for.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            state: Arc::new(MockState {
                remote,
                script: Mutex::new(VecDeque::new()),
                connect_delay: Mutex::new(Duration::ZERO),
                connects: AtomicUsize::new(0),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                credentials: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue outcomes for the next connect attempts
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.script.lock().unwrap().extend(outcomes);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }

    /// Total connect attempts seen, successful or not
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Whether two connect attempts were ever in flight at once
    pub fn overlapped(&self) -> bool {
        self.state.overlapped.load(Ordering::SeqCst)
    }

    pub fn credentials_seen(&self) -> Vec<Option<Secret>> {
        self.state.credentials.lock().unwrap().clone()
    }

    /// Simulate the server going away: the latest connection stops
    /// answering the liveness check and refuses new channels.
    pub fn kill_current(&self) {
        if let Some(link) = self.state.links.lock().unwrap().last() {
            link.alive.store(false, Ordering::SeqCst);
        }
    }

    /// The latest connection stops answering the liveness check at all.
    pub fn hang_current(&self) {
        if let Some(link) = self.state.links.lock().unwrap().last() {
            link.hung.store(true, Ordering::SeqCst);
        }
    }

    /// Connections handed out so far
    pub fn connections(&self) -> usize {
        self.state.links.lock().unwrap().len()
    }

    /// Connections the manager has closed
    pub fn closed_connections(&self) -> usize {
        self.state
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|link| link.closed.load(Ordering::SeqCst))
            .count()
    }
}

/// Clears the in-flight flag even when the connect future is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(
        &self,
        _target: &ServerTarget,
        credential: Option<Secret>,
    ) -> Result<MockConnection, TunnelError> {
        if self.state.in_flight.swap(true, Ordering::SeqCst) {
            self.state.overlapped.store(true, Ordering::SeqCst);
        }
        let _guard = InFlight(&self.state.in_flight);

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.credentials.lock().unwrap().push(credential);

        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            smol::Timer::after(delay).await;
        }

        let outcome = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Succeed);

        match outcome {
            Outcome::Succeed => {
                let link = Arc::new(Link {
                    remote: self.state.remote,
                    alive: AtomicBool::new(true),
                    hung: AtomicBool::new(false),
                    closed: AtomicBool::new(false),
                });
                self.state.links.lock().unwrap().push(link.clone());
                Ok(MockConnection { link })
            }
            Outcome::Fail => Err(TunnelError::ConnectionFailed(
                "Connection refused (scripted)".into(),
            )),
        }
    }
}

struct Link {
    remote: SocketAddr,
    alive: AtomicBool,
    hung: AtomicBool,
    closed: AtomicBool,
}

pub struct MockConnection {
    link: Arc<Link>,
}

impl Connection for MockConnection {
    type Channel = TcpStream;

    async fn open_forwarded_channel(&self, _host: &str, _port: u16) -> Result<TcpStream, TunnelError> {
        if !self.link.alive.load(Ordering::SeqCst) || self.link.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::ChannelOpenFailed("connection is down".into()));
        }
        TcpStream::connect(self.link.remote)
            .await
            .map_err(|e| TunnelError::ChannelOpenFailed(e.to_string()))
    }

    async fn is_active(&self) -> bool {
        if self.link.hung.load(Ordering::SeqCst) {
            return futures::future::pending().await;
        }
        self.link.alive.load(Ordering::SeqCst) && !self.link.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.link.closed.store(true, Ordering::SeqCst);
    }
}

/// Credential store whose secret can be removed while a tunnel is running.
#[derive(Clone, Default)]
pub struct SharedCredentials {
    secret: Arc<Mutex<Option<Secret>>>,
}

impl SharedCredentials {
    pub fn with_secret(secret: &str) -> Self {
        Self {
            secret: Arc::new(Mutex::new(Some(Secret::new(secret)))),
        }
    }

    pub fn clear(&self) {
        self.secret.lock().unwrap().take();
    }
}

impl CredentialSource for SharedCredentials {
    fn lookup(&self, _service: &str, _account: &str) -> Result<Option<Secret>, TunnelError> {
        Ok(self.secret.lock().unwrap().clone())
    }
}

pub fn target() -> ServerTarget {
    ServerTarget::new("seedbox", "seedbox.example.com", 22, "admin")
}

/// Ephemeral local port, fast health checks and retries
pub fn fast_config(remote_port: u16) -> TunnelConfig {
    TunnelConfig::new(0, "localhost", remote_port)
        .with_health_check_interval(Duration::from_millis(50))
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(20), 5))
}

/// Await `fut`, or give up after `limit`
pub async fn within<T>(limit: Duration, fut: impl std::future::Future<Output = T>) -> Option<T> {
    smol::future::or(async { Some(fut.await) }, async {
        smol::Timer::after(limit).await;
        None
    })
    .await
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        smol::Timer::after(Duration::from_millis(10)).await;
    }
}
