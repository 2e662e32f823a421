//! Settings file for the `tunnelkeeper` binary.
//!
//! A single JSON document describes one tunnel:
//!
//! ```json
//! {
//!   "name": "seedbox",
//!   "ssh_host": "seedbox.example.com",
//!   "ssh_user": "admin",
//!   "local_bind_port": 8080,
//!   "remote_host": "localhost",
//!   "remote_port": 9000
//! }
//! ```

use crate::ssh::{ReconnectConfig, ServerTarget, SshTransport, TunnelConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk tunnel settings. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Logical name; also the keychain account holding the password
    pub name: String,
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    /// Use this identity file instead of password authentication
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// ssh binary to run (default: `ssh` from PATH)
    #[serde(default)]
    pub ssh_program: Option<PathBuf>,

    #[serde(default = "default_bind_host")]
    pub local_bind_host: String,
    pub local_bind_port: u16,
    pub remote_host: String,
    pub remote_port: u16,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Settings {
    /// Default settings location: `<config dir>/tunnelkeeper/tunnel.json`
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("tunnelkeeper").join("tunnel.json"))
    }

    /// Load and parse a settings file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = async_fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse settings JSON")
    }

    /// Write settings as pretty JSON, creating the parent directory.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .context("Failed to create settings directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        async_fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }

    pub fn to_target(&self) -> ServerTarget {
        let target = ServerTarget::new(&self.name, &self.ssh_host, self.ssh_port, &self.ssh_user);
        match &self.private_key_path {
            Some(path) => target.with_private_key(path),
            None => target,
        }
    }

    pub fn to_tunnel_config(&self) -> TunnelConfig {
        TunnelConfig::new(self.local_bind_port, &self.remote_host, self.remote_port)
            .with_bind_host(&self.local_bind_host)
            .with_health_check_interval(Duration::from_secs(self.health_check_interval_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_reconnect(ReconnectConfig::fixed(
                Duration::from_secs(self.reconnect_delay_secs),
                self.max_reconnect_attempts,
            ))
    }

    pub fn to_transport(&self) -> SshTransport {
        let transport =
            SshTransport::new().with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        match &self.ssh_program {
            Some(program) => transport.with_program(program),
            None => transport,
        }
    }
}
