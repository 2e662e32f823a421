//! SSH transport using the system `ssh` binary.
//!
//! One `ssh -M -N` ControlMaster process is the authenticated, multiplexed
//! connection. Forwarded channels are `ssh -W host:port` clients that ride
//! the master's control socket, so they never re-authenticate. Using the
//! system binary picks up the user's `~/.ssh/config`, agent and ProxyJump
//! setup for free.

use super::askpass::AskpassProxy;
use super::error::TunnelError;
use super::transport::{Connection, Transport};
use super::types::{AuthMethod, Secret, ServerTarget};
use futures::StreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use smol::io::{AsyncBufReadExt, BufReader};
use smol::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How often the master is polled while the handshake is in progress
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Builds ControlMaster connections with the system ssh binary.
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: PathBuf,
    connect_timeout: Duration,
    extra_args: Vec<String>,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(30),
            extra_args: Vec::new(),
        }
    }
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific ssh binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Handshake deadline passed to ssh as ConnectTimeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Additional ssh arguments (e.g. `-o ProxyJump=bastion`)
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn master_command(
        &self,
        target: &ServerTarget,
        control_path: &Path,
        askpass: Option<&AskpassProxy>,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        // Foreground master, no remote command
        cmd.arg("-M").arg("-N");
        cmd.arg("-S").arg(control_path);
        cmd.args(["-o", "ControlPersist=no"]);
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"]);
        cmd.args(["-o", "ServerAliveInterval=15"]);
        cmd.args(["-o", "ServerAliveCountMax=3"]);
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        cmd.arg("-p").arg(target.ssh_port.to_string());

        match &target.auth_method {
            AuthMethod::Password => {
                cmd.args(["-o", "PreferredAuthentications=password,keyboard-interactive"]);
                cmd.args(["-o", "NumberOfPasswordPrompts=1"]);
            }
            AuthMethod::PublicKey { private_key_path } => {
                cmd.arg("-i").arg(private_key_path);
                cmd.args(["-o", "IdentitiesOnly=yes"]);
            }
        }

        match askpass {
            Some(proxy) => {
                cmd.env("SSH_ASKPASS", proxy.script_path());
                cmd.env("SSH_ASKPASS_REQUIRE", "force");
                // askpass needs a display even when none exists
                cmd.env("DISPLAY", ":0");
            }
            None => {
                cmd.args(["-o", "BatchMode=yes"]);
            }
        }

        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd.arg(target.ssh_url());
        cmd
    }
}

impl Transport for SshTransport {
    type Connection = SshConnection;

    async fn connect(
        &self,
        target: &ServerTarget,
        credential: Option<Secret>,
    ) -> Result<SshConnection, TunnelError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("tunnelkeeper-ssh-")
            .tempdir()
            .map_err(|e| TunnelError::ConnectionFailed(format!("temp directory: {e}")))?;
        let control_path = temp_dir.path().join("ctl.sock");

        let askpass = match &credential {
            Some(_) => Some(Arc::new(AskpassProxy::new().map_err(|e| {
                TunnelError::ConnectionFailed(format!("askpass setup: {e:#}"))
            })?)),
            None => None,
        };

        let mut cmd = self.master_command(target, &control_path, askpass.as_deref());
        tracing::info!(
            "Starting SSH master: ssh -M -N -p {} {}",
            target.ssh_port,
            target.ssh_url()
        );
        tracing::debug!("Full SSH command: {:?}", cmd);

        let mut master = cmd
            .spawn()
            .map_err(|e| TunnelError::ConnectionFailed(format!("failed to spawn ssh: {e}")))?;

        // Serve the secret for as long as the handshake runs
        let askpass_task = match (askpass, credential) {
            (Some(proxy), Some(secret)) => {
                Some(smol::spawn(async move { proxy.serve(secret).await }))
            }
            _ => None,
        };

        let last_stderr = Arc::new(async_lock::Mutex::new(None::<String>));
        if let Some(stderr) = master.stderr.take() {
            let last_stderr = last_stderr.clone();
            let destination = target.ssh_url();
            smol::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(Ok(line)) = lines.next().await {
                    if line.contains("Permission denied") || line.contains("Authentication failed")
                    {
                        tracing::error!("SSH authentication failed for {}: {}", destination, line);
                    } else {
                        tracing::debug!("SSH stderr: {}", line);
                    }
                    *last_stderr.lock().await = Some(line);
                }
            })
            .detach();
        }

        let connection = SshConnection {
            program: self.program.clone(),
            destination: target.ssh_url(),
            ssh_port: target.ssh_port,
            control_path,
            master: async_lock::Mutex::new(master),
            _temp_dir: temp_dir,
        };

        let started = Instant::now();
        let result = loop {
            if let Some(status) = connection.master_exit_status().await {
                let detail = last_stderr.lock().await.clone().unwrap_or_default();
                break Err(TunnelError::ConnectionFailed(format!(
                    "ssh exited with {status}: {detail}"
                )));
            }
            if connection.control_check().await {
                break Ok(());
            }
            if started.elapsed() >= self.connect_timeout {
                break Err(TunnelError::ConnectionFailed(format!(
                    "timed out after {:?} waiting for {}:{}",
                    self.connect_timeout, target.ssh_host, target.ssh_port
                )));
            }
            smol::Timer::after(MASTER_POLL_INTERVAL).await;
        };

        if let Some(task) = askpass_task {
            task.cancel().await;
        }

        match result {
            Ok(()) => {
                tracing::info!("SSH master established to {}", connection.destination);
                Ok(connection)
            }
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }
}

/// A running ssh ControlMaster.
pub struct SshConnection {
    program: PathBuf,
    destination: String,
    ssh_port: u16,
    control_path: PathBuf,
    master: async_lock::Mutex<Child>,
    _temp_dir: TempDir,
}

impl SshConnection {
    fn control_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        // A timed-out health check must not leave its ssh client running
        cmd.kill_on_drop(true);
        cmd.arg("-S").arg(&self.control_path);
        cmd.arg("-p").arg(self.ssh_port.to_string());
        cmd
    }

    async fn master_exit_status(&self) -> Option<std::process::ExitStatus> {
        self.master.lock().await.try_status().ok().flatten()
    }

    /// `ssh -O check`: succeeds while the master accepts mux clients
    async fn control_check(&self) -> bool {
        let mut cmd = self.control_command();
        cmd.args(["-O", "check"]).arg(&self.destination);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        matches!(cmd.status().await, Ok(status) if status.success())
    }
}

impl Connection for SshConnection {
    type Channel = SshChannel;

    async fn open_forwarded_channel(&self, host: &str, port: u16) -> Result<SshChannel, TunnelError> {
        if self.master_exit_status().await.is_some() {
            return Err(TunnelError::ChannelOpenFailed(
                "ssh master is no longer running".into(),
            ));
        }

        let mut cmd = self.control_command();
        // Never fall back to a fresh login if the control socket is gone
        cmd.args(["-o", "ControlMaster=no", "-o", "BatchMode=yes"]);
        cmd.arg("-W").arg(format!("{host}:{port}"));
        cmd.arg(&self.destination);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::ChannelOpenFailed(format!("failed to spawn ssh -W: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TunnelError::ChannelOpenFailed(
                "ssh -W has no stdio pipes".into(),
            ));
        };

        tracing::debug!("Opened forwarded channel to {}:{}", host, port);
        Ok(SshChannel {
            _child: child,
            stdin: Some(stdin),
            stdout,
        })
    }

    async fn is_active(&self) -> bool {
        self.master_exit_status().await.is_none() && self.control_check().await
    }

    async fn close(&self) {
        tracing::debug!("Shutting down SSH master for {}", self.destination);

        // Ask the master to exit; this ends every multiplexed -W client too
        let mut cmd = self.control_command();
        cmd.args(["-O", "exit"]).arg(&self.destination);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let _ = cmd.status().await;

        let mut master = self.master.lock().await;
        if matches!(master.try_status(), Ok(None)) {
            #[cfg(unix)]
            {
                unsafe {
                    libc::kill(master.id() as i32, libc::SIGTERM);
                }
                smol::Timer::after(Duration::from_millis(100)).await;
            }
            if matches!(master.try_status(), Ok(None)) {
                let _ = master.kill();
            }
        }
        let _ = master.status().await;

        tracing::info!("SSH master for {} closed", self.destination);
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        let _ = self.master.get_mut().kill();
    }
}

/// Stdio of an `ssh -W` client, used as a byte stream.
pub struct SshChannel {
    _child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl AsyncRead for SshChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    /// Closing stdin sends EOF to the remote side of the channel.
    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            futures::ready!(Pin::new(stdin).poll_close(cx))?;
        }
        self.stdin = None;
        Poll::Ready(Ok(()))
    }
}
