//! Credential sources for transport authentication.
//!
//! Secrets are keyed by a service name and an account key. The manager uses
//! [`CREDENTIAL_SERVICE`] as the service and the target's logical name as
//! the account.

use super::error::TunnelError;
use super::types::Secret;
use keyring::Entry;
use std::collections::HashMap;

/// Keyring service name for tunnel passwords and key passphrases
pub const CREDENTIAL_SERVICE: &str = "tunnelkeeper";

/// Supplies authentication material keyed by a logical identity.
///
/// Lookups may block (platform keychains do), so the manager runs them off
/// the executor with `smol::unblock`.
pub trait CredentialSource: Send + Sync + 'static {
    /// Returns `Ok(None)` when nothing is stored for the key.
    fn lookup(&self, service: &str, account: &str) -> Result<Option<Secret>, TunnelError>;
}

/// Platform credential store (macOS Keychain, Windows Credential Manager,
/// Secret Service on Linux).
#[derive(Debug, Clone, Default)]
pub struct KeychainCredentials;

impl KeychainCredentials {
    pub fn new() -> Self {
        Self
    }

    /// Store a secret for the given logical name
    pub fn store(&self, account: &str, secret: &str) -> Result<(), TunnelError> {
        let entry = Entry::new(CREDENTIAL_SERVICE, account)
            .map_err(|e| TunnelError::Credential(format!("keyring entry for {account}: {e}")))?;
        entry
            .set_password(secret)
            .map_err(|e| TunnelError::Credential(format!("failed to store secret: {e}")))?;
        tracing::debug!("Stored credential for {}", account);
        Ok(())
    }

    /// Delete the secret for the given logical name, if any
    pub fn delete(&self, account: &str) -> Result<(), TunnelError> {
        if let Ok(entry) = Entry::new(CREDENTIAL_SERVICE, account) {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    return Err(TunnelError::Credential(format!(
                        "failed to delete secret: {e}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl CredentialSource for KeychainCredentials {
    fn lookup(&self, service: &str, account: &str) -> Result<Option<Secret>, TunnelError> {
        let entry = Entry::new(service, account)
            .map_err(|e| TunnelError::Credential(format!("keyring entry for {account}: {e}")))?;
        match entry.get_password() {
            Ok(password) => Ok(Some(Secret::new(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(TunnelError::Credential(e.to_string())),
        }
    }
}

/// In-memory credential source, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentials {
    secrets: HashMap<(String, String), Secret>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret under [`CREDENTIAL_SERVICE`]
    pub fn with_secret(mut self, account: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(
            (CREDENTIAL_SERVICE.to_string(), account.into()),
            Secret::new(secret),
        );
        self
    }
}

impl CredentialSource for MemoryCredentials {
    fn lookup(&self, service: &str, account: &str) -> Result<Option<Secret>, TunnelError> {
        Ok(self
            .secrets
            .get(&(service.to_string(), account.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_lookup() {
        let creds = MemoryCredentials::new().with_secret("seedbox", "hunter2");

        let found = creds.lookup(CREDENTIAL_SERVICE, "seedbox").unwrap();
        assert_eq!(found.unwrap().expose(), "hunter2");

        assert!(creds.lookup(CREDENTIAL_SERVICE, "other").unwrap().is_none());
        assert!(creds.lookup("another-service", "seedbox").unwrap().is_none());
    }
}
