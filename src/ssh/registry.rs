//! Process-wide collection of named tunnel managers.

use super::credentials::CredentialSource;
use super::manager::{TunnelManager, TunnelState};
use super::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;

/// Named tunnels, one manager per id.
///
/// Storing a manager under an id that is already taken stops the previous
/// one, so at most one tunnel per id is ever live.
pub struct TunnelRegistry<T: Transport, C: CredentialSource> {
    tunnels: async_lock::RwLock<HashMap<String, Arc<TunnelManager<T, C>>>>,
}

impl<T: Transport, C: CredentialSource> Default for TunnelRegistry<T, C> {
    fn default() -> Self {
        Self {
            tunnels: async_lock::RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Transport, C: CredentialSource> TunnelRegistry<T, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `manager` under `id`, stopping whatever was there before.
    pub async fn insert(
        &self,
        id: impl Into<String>,
        manager: TunnelManager<T, C>,
    ) -> Arc<TunnelManager<T, C>> {
        let id = id.into();
        let manager = Arc::new(manager);
        let previous = self
            .tunnels
            .write()
            .await
            .insert(id.clone(), manager.clone());

        if let Some(previous) = previous {
            tracing::info!("Replacing tunnel '{}'", id);
            previous.stop().await;
        }
        manager
    }

    pub async fn get(&self, id: &str) -> Option<Arc<TunnelManager<T, C>>> {
        self.tunnels.read().await.get(id).cloned()
    }

    /// Remove and stop the tunnel under `id`. Returns whether one existed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.tunnels.write().await.remove(id);
        match removed {
            Some(manager) => {
                manager.stop().await;
                tracing::info!("Removed tunnel '{}'", id);
                true
            }
            None => false,
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tunnels.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of every tunnel, sorted by id
    pub async fn states(&self) -> Vec<(String, TunnelState)> {
        let tunnels: Vec<(String, Arc<TunnelManager<T, C>>)> = self
            .tunnels
            .read()
            .await
            .iter()
            .map(|(id, manager)| (id.clone(), manager.clone()))
            .collect();

        let mut states = Vec::with_capacity(tunnels.len());
        for (id, manager) in tunnels {
            states.push((id, manager.state().await));
        }
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Stop and forget every tunnel.
    pub async fn shutdown_all(&self) {
        let tunnels: Vec<(String, Arc<TunnelManager<T, C>>)> =
            self.tunnels.write().await.drain().collect();

        if tunnels.is_empty() {
            return;
        }
        tracing::info!("Shutting down {} tunnel(s)", tunnels.len());
        futures::future::join_all(tunnels.iter().map(|(_, manager)| manager.stop())).await;
    }
}
