//! Password delivery to `ssh` through a private Unix socket.
//!
//! `ssh` asks for passwords by running the program named in `SSH_ASKPASS`.
//! We point it at a tiny script that runs our own binary in `--askpass`
//! mode, which reads the secret from a 0600 socket inside a 0700 temp
//! directory. The secret is never written to disk.
//!
//! Binaries embedding this crate must call [`handle_askpass_mode`] first
//! thing in `main()`.

use super::types::Secret;
use anyhow::{Context, Result};
use smol::io::AsyncWriteExt;
use smol::net::unix::UnixListener;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Flag that switches the binary into askpass helper mode
pub const ASKPASS_FLAG: &str = "--askpass";

/// Handle `--askpass <socket>` and exit, or return if the flag is absent.
pub fn handle_askpass_mode() {
    let args: Vec<String> = std::env::args().collect();

    if let Some(pos) = args.iter().position(|a| a == ASKPASS_FLAG) {
        let Some(socket_path) = args.get(pos + 1) else {
            eprintln!("{} requires a socket path argument", ASKPASS_FLAG);
            std::process::exit(1);
        };
        match read_secret(Path::new(socket_path)) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("askpass error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

/// Copy the secret from the socket to stdout, where ssh reads it.
#[cfg(unix)]
fn read_secret(socket_path: &Path) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket_path)?;
    let mut secret = String::new();
    stream.read_to_string(&mut secret)?;

    let mut stdout = std::io::stdout();
    stdout.write_all(secret.as_bytes())?;
    stdout.flush()
}

#[cfg(not(unix))]
fn read_secret(_socket_path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "askpass mode is only supported on Unix systems",
    ))
}

/// Serves one secret over a Unix socket for `SSH_ASKPASS`.
pub struct AskpassProxy {
    listener: UnixListener,
    script_path: PathBuf,
    socket_path: PathBuf,
    _temp_dir: TempDir,
}

impl AskpassProxy {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::with_prefix("tunnelkeeper-askpass-")?;
        let socket_path = temp_dir.path().join("askpass.sock");
        let script_path = temp_dir.path().join("askpass.sh");

        #[cfg(unix)]
        set_mode(temp_dir.path(), 0o700)?;

        let listener =
            UnixListener::bind(&socket_path).context("Failed to create askpass socket")?;

        #[cfg(unix)]
        set_mode(&socket_path, 0o600)?;

        let current_exe =
            std::env::current_exe().context("Failed to get current executable path")?;
        let escaped_exe = shell_escape(&current_exe.to_string_lossy());
        let escaped_socket = shell_escape(&socket_path.to_string_lossy());

        // Fall back to nc when the host binary does not handle --askpass
        let script = format!(
            r#"#!/bin/sh
if {exe} {flag} {socket} 2>/dev/null; then
    exit 0
elif command -v nc >/dev/null 2>&1; then
    nc -U {socket}
else
    echo "askpass: no helper available" >&2
    exit 1
fi
"#,
            exe = escaped_exe,
            flag = ASKPASS_FLAG,
            socket = escaped_socket,
        );
        std::fs::write(&script_path, &script).context("Failed to write askpass script")?;

        #[cfg(unix)]
        set_mode(&script_path, 0o700)?;

        tracing::debug!("Created askpass proxy at {}", socket_path.display());

        Ok(Self {
            listener,
            script_path,
            socket_path,
            _temp_dir: temp_dir,
        })
    }

    /// Value for `SSH_ASKPASS`
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Answer a single askpass request.
    pub async fn serve_once(&self, secret: &Secret) -> Result<()> {
        let (mut stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept askpass connection")?;

        stream
            .write_all(secret.expose().as_bytes())
            .await
            .context("Failed to write secret to askpass socket")?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        tracing::debug!("Served secret via askpass proxy");
        Ok(())
    }

    /// Answer askpass requests until the returned future is dropped.
    ///
    /// ssh may prompt more than once (e.g. after a typo'd password it
    /// retries up to NumberOfPasswordPrompts), so this keeps serving.
    pub async fn serve(&self, secret: Secret) {
        loop {
            if let Err(e) = self.serve_once(&secret).await {
                tracing::debug!("Askpass serve error: {}", e);
                return;
            }
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Single-quote a string for a POSIX shell.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
