//! SSH port forwarding that stays up.
//!
//! This module provides:
//! - `TunnelManager` - Lifecycle, health check and bounded reconnect for one tunnel
//! - `TunnelRegistry` - Named collection of managers
//! - `SshTransport` - Transport backed by the system ssh binary
//! - `KeychainCredentials` - Passwords from the OS keychain
//! - `AskpassProxy` - Secure password delivery via Unix socket

mod askpass;
mod credentials;
mod error;
mod listener;
mod manager;
mod reconnect;
mod registry;
mod relay;
mod system;
mod transport;
mod types;

pub use askpass::{ASKPASS_FLAG, AskpassProxy, handle_askpass_mode};
pub use credentials::{CREDENTIAL_SERVICE, CredentialSource, KeychainCredentials, MemoryCredentials};
pub use error::TunnelError;
pub use listener::{LocalListener, SessionRegistry};
pub use manager::{TunnelEvent, TunnelEventKind, TunnelManager, TunnelState};
pub use reconnect::{ExponentialBackoff, ReconnectConfig};
pub use registry::TunnelRegistry;
pub use relay::{RELAY_CHUNK_SIZE, RELAY_QUEUE_DEPTH, RelaySession, RelayStats};
pub use system::{SshChannel, SshConnection, SshTransport};
pub use transport::{Connection, ForwardingHandle, Transport};
pub use types::{AuthMethod, Secret, ServerTarget, TunnelConfig};
