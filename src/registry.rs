use crate::instance::ServerInstance;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("port {0} is already registered")]
    PortTaken(u16),
}

/// Running instances keyed by bound port.
///
/// Cloning shares the same table. Every mutation takes the write lock, so
/// inserts and removals are linearizable; readers see the state as of the
/// last completed mutation.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: Arc<RwLock<HashMap<u16, Arc<ServerInstance>>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instance: Arc<ServerInstance>) -> Result<(), RegistryError> {
        let port = instance.port();
        let mut servers = self.servers.write().await;
        if servers.contains_key(&port) {
            return Err(RegistryError::PortTaken(port));
        }
        servers.insert(port, instance);
        Ok(())
    }

    /// Remove `instance` if it is registered, whatever its port field says
    /// now. Returns whether anything was removed; a second call is a no-op.
    pub async fn remove(&self, instance: &Arc<ServerInstance>) -> bool {
        let mut servers = self.servers.write().await;
        let port = instance.port();
        let key = match servers.get(&port) {
            Some(current) if Arc::ptr_eq(current, instance) => Some(port),
            _ => servers
                .iter()
                .find(|(_, current)| Arc::ptr_eq(current, instance))
                .map(|(key, _)| *key),
        };
        match key {
            Some(key) => {
                if key != port {
                    tracing::warn!(id = instance.id(), key, port, "instance registered under an older port");
                }
                servers.remove(&key);
                true
            }
            None => false,
        }
    }

    pub async fn lookup(&self, port: u16) -> Option<Arc<ServerInstance>> {
        self.servers.read().await.get(&port).cloned()
    }

    pub async fn list_all(&self) -> Vec<Arc<ServerInstance>> {
        let mut all: Vec<_> = self.servers.read().await.values().cloned().collect();
        all.sort_by_key(|i| i.port());
        all
    }

    pub async fn list_by_owner(&self, owner: &str) -> Vec<Arc<ServerInstance>> {
        let mut mine: Vec<_> = self
            .servers
            .read()
            .await
            .values()
            .filter(|i| i.owner().eq_ignore_ascii_case(owner))
            .cloned()
            .collect();
        mine.sort_by_key(|i| i.port());
        mine
    }

    pub async fn list_by_version(&self, version: &str) -> Vec<Arc<ServerInstance>> {
        let mut matching: Vec<_> = self
            .servers
            .read()
            .await
            .values()
            .filter(|i| i.version_name().eq_ignore_ascii_case(version))
            .cloned()
            .collect();
        matching.sort_by_key(|i| i.port());
        matching
    }

    pub async fn ports(&self) -> HashSet<u16> {
        self.servers.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }
}
