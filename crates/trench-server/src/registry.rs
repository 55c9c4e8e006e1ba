//! Connection registry: live client transports keyed by id.
//!
//! A client id is present exactly while its transport is open: the
//! connection task inserts before anything is relayed to or about the
//! client, and removes on the close path. The registry is the only
//! structure mutated from multiple connection tasks, so all access
//! goes through its internal lock.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error};
use trench_core::{ClientId, Envelope, SignalError, SignalResult};

/// Registry of connected clients and their outbound envelope queues.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<ClientId, mpsc::Sender<Envelope>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new client. Ids are generated server-side per
    /// connection, so a duplicate is an invariant violation: log it
    /// and reject the registration.
    pub async fn register(
        &self,
        id: ClientId,
        handle: mpsc::Sender<Envelope>,
    ) -> SignalResult<()> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&id) {
            error!(id = %id.short(), "duplicate client id, rejecting registration");
            return Err(SignalError::DuplicateRegistration(id.to_string()));
        }
        clients.insert(id, handle);
        debug!(id = %id.short(), total = clients.len(), "client registered");
        Ok(())
    }

    /// Remove a client. Returns whether the id was present, so the
    /// caller can make the close path idempotent.
    pub async fn unregister(&self, id: ClientId) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(&id).is_some();
        if removed {
            debug!(id = %id.short(), total = clients.len(), "client unregistered");
        }
        removed
    }

    /// Outbound handle for a client, if it is still registered.
    pub async fn lookup(&self, id: ClientId) -> Option<mpsc::Sender<Envelope>> {
        self.clients.read().await.get(&id).cloned()
    }

    /// All registered ids except `excluding`. No ordering guarantee.
    pub async fn other_ids(&self, excluding: ClientId) -> Vec<ClientId> {
        self.clients
            .read()
            .await
            .keys()
            .filter(|id| **id != excluding)
            .copied()
            .collect()
    }

    /// Outbound handles for every client except `excluding`.
    pub async fn other_handles(
        &self,
        excluding: ClientId,
    ) -> Vec<(ClientId, mpsc::Sender<Envelope>)> {
        self.clients
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != excluding)
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }

    /// Number of registered clients.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> mpsc::Sender<Envelope> {
        mpsc::channel(1).0
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let id = ClientId::random();
        registry.register(id, handle()).await.unwrap();
        assert!(registry.lookup(id).await.is_some());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = ConnectionRegistry::new();
        let id = ClientId::random();
        registry.register(id, handle()).await.unwrap();
        let err = registry.register(id, handle()).await.unwrap_err();
        assert!(matches!(err, SignalError::DuplicateRegistration(_)));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = ClientId::random();
        registry.register(id, handle()).await.unwrap();
        assert!(registry.unregister(id).await);
        assert!(!registry.unregister(id).await);
        assert!(registry.lookup(id).await.is_none());
    }

    #[tokio::test]
    async fn other_ids_excludes_self() {
        let registry = ConnectionRegistry::new();
        let a = ClientId::random();
        let b = ClientId::random();
        registry.register(a, handle()).await.unwrap();
        registry.register(b, handle()).await.unwrap();

        let others = registry.other_ids(a).await;
        assert_eq!(others, vec![b]);
        assert!(registry.other_ids(ClientId::random()).await.len() == 2);
    }
}
