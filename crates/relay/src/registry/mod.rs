// Connection registry: which identities are attached right now.

pub mod handle;

use std::collections::HashMap;
use std::sync::Arc;

use huddle_common::types::UserId;
use tokio::sync::RwLock;
use uuid::Uuid;

pub use handle::{BoxedSink, ConnectionHandle};

/// Concurrent map from identity to its live connection.
///
/// An identity is present exactly while its session sits between join and
/// leave. Reads (`get`, `snapshot`, `size`) take the shared lock; `add` and
/// the removals take the exclusive lock. No method holds the lock across a
/// channel write.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<UserId, Arc<ConnectionHandle>>>>,
}

impl ConnectionRegistry {
    /// Installs `handle` under its user's identity and returns the handle it
    /// displaced, if any. The caller decides what to do with the old one.
    pub async fn add(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let id = handle.user().id.clone();
        self.connections.write().await.insert(id, handle)
    }

    /// Unconditional removal; a no-op when absent.
    pub async fn remove(&self, id: &UserId) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().await.remove(id)
    }

    /// Removes the entry for `id` only while it still belongs to
    /// `connection_id`. A superseded session gets `None` back and leaves
    /// its successor registered.
    pub async fn remove_if_current(
        &self,
        id: &UserId,
        connection_id: Uuid,
    ) -> Option<Arc<ConnectionHandle>> {
        let mut guard = self.connections.write().await;
        match guard.get(id) {
            Some(current) if current.connection_id() == connection_id => guard.remove(id),
            _ => None,
        }
    }

    pub async fn get(&self, id: &UserId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Point-in-time copy of every registered handle, for iterating without the lock.
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn size(&self) -> usize {
        self.connections.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn identities(&self) -> Vec<UserId> {
        let mut ids = self.connections.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
