//! Tunnel target and configuration types.

use super::error::TunnelError;
use super::reconnect::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Authentication method for the transport connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuthMethod {
    /// Password authentication; the stored credential is the password
    #[default]
    Password,
    /// Public key file; the stored credential, if any, is its passphrase
    PublicKey { private_key_path: String },
}

/// Identity of the remote SSH endpoint.
///
/// `name` is the logical name used to key the credential lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerTarget {
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
}

impl ServerTarget {
    /// Create a password-authenticated target
    pub fn new(
        name: impl Into<String>,
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            auth_method: AuthMethod::Password,
        }
    }

    /// Authenticate with a private key instead of a password
    pub fn with_private_key(mut self, private_key_path: impl Into<String>) -> Self {
        self.auth_method = AuthMethod::PublicKey {
            private_key_path: private_key_path.into(),
        };
        self
    }

    /// Check that host, port and user are all present.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.ssh_host.trim().is_empty() {
            return Err(TunnelError::InvalidConfiguration(
                "ssh host is required".into(),
            ));
        }
        if self.ssh_port == 0 {
            return Err(TunnelError::InvalidConfiguration(
                "ssh port must be non-zero".into(),
            ));
        }
        if self.ssh_user.trim().is_empty() {
            return Err(TunnelError::InvalidConfiguration(
                "ssh user is required".into(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(TunnelError::InvalidConfiguration(
                "credential name is required".into(),
            ));
        }
        if let AuthMethod::PublicKey { private_key_path } = &self.auth_method {
            if private_key_path.trim().is_empty() {
                return Err(TunnelError::InvalidConfiguration(
                    "private key path is empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_url(&self) -> String {
        format!("{}@{}", self.ssh_user, self.ssh_host)
    }
}

/// Local listener and forwarding configuration, fixed for a manager's lifetime.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local bind address (default: 127.0.0.1)
    pub local_bind_host: String,
    /// Local port to bind (0 for auto-assign)
    pub local_bind_port: u16,
    /// Host the SSH server connects to on behalf of local clients
    pub remote_host: String,
    /// Port the SSH server connects to on behalf of local clients
    pub remote_port: u16,
    /// Period of the connection liveness check
    pub health_check_interval: Duration,
    /// Upper bound on a transport handshake or liveness check
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl TunnelConfig {
    pub fn new(local_bind_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_bind_host: "127.0.0.1".to_string(),
            local_bind_port,
            remote_host: remote_host.into(),
            remote_port,
            health_check_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.local_bind_host = host.into();
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Parse the local bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, TunnelError> {
        let host = match self.local_bind_host.as_str() {
            "localhost" => "127.0.0.1",
            host => host,
        };
        format!("{}:{}", host, self.local_bind_port)
            .parse()
            .map_err(|_| {
                TunnelError::InvalidConfiguration(format!(
                    "invalid local bind address {}:{}",
                    self.local_bind_host, self.local_bind_port
                ))
            })
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        self.bind_addr()?;
        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::InvalidConfiguration(
                "remote host is required".into(),
            ));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::InvalidConfiguration(
                "remote port must be non-zero".into(),
            ));
        }
        if self.health_check_interval.is_zero() || self.connect_timeout.is_zero() {
            return Err(TunnelError::InvalidConfiguration(
                "health check interval and connect timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Authentication material handed to the transport.
///
/// Debug output is redacted so secrets never reach the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}
