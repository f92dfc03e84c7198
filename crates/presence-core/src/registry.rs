//! Connection registry.
//!
//! Tracks one heartbeat row per (account, connection). Connection-layer
//! callbacks call into this on connect, periodic ping and disconnect. It never
//! decides online/offline itself; that is the resolver's job.

use crate::error::PresenceError;
use crate::model::{ConnectionHeartbeat, PresenceChange};
use crate::notify::PresenceNotifier;
use crate::store::SharedStore;
use std::sync::Arc;
use tracing::{debug, trace};

/// Registry of live device connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: SharedStore,
    notifier: Arc<dyn PresenceNotifier>,
    heartbeat_ttl_seconds: u64,
}

fn require(value: &str, what: &str) -> Result<(), PresenceError> {
    if value.is_empty() {
        return Err(PresenceError::Validation(format!("{what} cannot be empty")));
    }
    Ok(())
}

impl ConnectionRegistry {
    /// Create a registry over `store`.
    #[must_use]
    pub fn new(
        store: SharedStore,
        notifier: Arc<dyn PresenceNotifier>,
        heartbeat_ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            notifier,
            heartbeat_ttl_seconds,
        }
    }

    /// Heartbeat validity window.
    #[must_use]
    pub fn heartbeat_ttl_seconds(&self) -> u64 {
        self.heartbeat_ttl_seconds
    }

    /// Record a new connection. Idempotent; connections of the same account
    /// are independent.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier is empty or the store is unavailable.
    pub async fn mark_connected(
        &self,
        account_id: &str,
        connection_id: &str,
        now: u64,
    ) -> Result<(), PresenceError> {
        self.write_heartbeat(account_id, connection_id, now).await?;
        debug!(account = %account_id, connection = %connection_id, "Connection registered");
        Ok(())
    }

    /// Extend a connection's heartbeat, re-creating the row if it expired or
    /// was evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier is empty or the store is unavailable.
    pub async fn touch_heartbeat(
        &self,
        account_id: &str,
        connection_id: &str,
        now: u64,
    ) -> Result<(), PresenceError> {
        let existed = self.write_heartbeat(account_id, connection_id, now).await?;
        if existed {
            trace!(account = %account_id, connection = %connection_id, "Heartbeat extended");
        } else {
            debug!(account = %account_id, connection = %connection_id, "Heartbeat row re-created");
        }
        Ok(())
    }

    /// Remove a connection. If `account_id` is unknown it is resolved from
    /// the connection first.
    ///
    /// Returns `false` if the connection was already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection ID is empty or the store is
    /// unavailable.
    pub async fn mark_disconnected(
        &self,
        account_id: Option<&str>,
        connection_id: &str,
        now: u64,
    ) -> Result<bool, PresenceError> {
        require(connection_id, "connection id")?;

        let account_id = match account_id.filter(|a| !a.is_empty()) {
            Some(account_id) => account_id.to_string(),
            None => match self.store.account_for_connection(connection_id).await? {
                Some(account_id) => account_id,
                None => {
                    trace!(connection = %connection_id, "Disconnect for unknown connection");
                    return Ok(false);
                }
            },
        };

        let removed = self
            .store
            .remove_heartbeat(&account_id, connection_id, now)
            .await?;

        if removed {
            debug!(account = %account_id, connection = %connection_id, "Connection removed");
        }
        Ok(removed)
    }

    async fn write_heartbeat(
        &self,
        account_id: &str,
        connection_id: &str,
        now: u64,
    ) -> Result<bool, PresenceError> {
        require(account_id, "account id")?;
        require(connection_id, "connection id")?;

        let heartbeat =
            ConnectionHeartbeat::new(account_id, connection_id, now, self.heartbeat_ttl_seconds);
        let write = self.store.put_heartbeat(&heartbeat, now).await?;

        if write.revived {
            debug!(account = %account_id, "Account came online");
            self.notifier.notify(PresenceChange {
                account_id: account_id.to_string(),
                online: true,
                last_online_at: Some(now),
                at: now,
            });
        }

        Ok(write.existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PresenceStatus;
    use crate::notify::{BroadcastNotifier, NoopNotifier};
    use crate::resolver::PresenceResolver;
    use crate::store::{MemoryStore, PresenceStore};

    fn setup() -> (Arc<MemoryStore>, ConnectionRegistry, PresenceResolver) {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(store.clone(), Arc::new(NoopNotifier), 120);
        let resolver = PresenceResolver::new(store.clone(), 60);
        (store, registry, resolver)
    }

    #[tokio::test]
    async fn test_continuous_heartbeats_stay_online() {
        let (_, registry, resolver) = setup();
        registry.mark_connected("alice", "c1", 0).await.unwrap();

        // Pings every 50s; the one due at t=150 is lost but the row is still live.
        for t in [50, 100, 200, 250, 300] {
            assert_eq!(
                resolver.resolve("alice", t).await.unwrap().status,
                PresenceStatus::Online
            );
            registry.touch_heartbeat("alice", "c1", t).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_second_connection_keeps_online() {
        let (_, registry, resolver) = setup();
        registry.mark_connected("alice", "phone", 0).await.unwrap();
        registry.mark_connected("alice", "laptop", 5).await.unwrap();

        assert!(registry.mark_disconnected(Some("alice"), "phone", 10).await.unwrap());

        let state = resolver.resolve("alice", 100).await.unwrap();
        assert_eq!(state.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_disconnect_resolves_account() {
        let (store, registry, _) = setup();
        registry.mark_connected("alice", "c1", 0).await.unwrap();

        assert!(registry.mark_disconnected(None, "c1", 10).await.unwrap());
        assert!(!registry.mark_disconnected(None, "c1", 11).await.unwrap());

        let record = store.load_account("alice").await.unwrap().unwrap();
        assert!(record.heartbeats.is_empty());
    }

    #[tokio::test]
    async fn test_touch_recreates_missing_row() {
        let (store, registry, resolver) = setup();
        registry.touch_heartbeat("alice", "c1", 500).await.unwrap();

        assert_eq!(store.connection_count(), 1);
        assert_eq!(
            resolver.resolve("alice", 501).await.unwrap().status,
            PresenceStatus::Online
        );
    }

    #[tokio::test]
    async fn test_empty_ids_rejected() {
        let (_, registry, _) = setup();

        assert!(matches!(
            registry.mark_connected("", "c1", 0).await,
            Err(PresenceError::Validation(_))
        ));
        assert!(matches!(
            registry.mark_disconnected(None, "", 0).await,
            Err(PresenceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_online_notified_once() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::with_capacity(8));
        let mut rx = notifier.subscribe();
        let registry = ConnectionRegistry::new(store, notifier.clone(), 120);

        registry.mark_connected("alice", "c1", 0).await.unwrap();
        registry.mark_connected("alice", "c2", 1).await.unwrap();
        registry.touch_heartbeat("alice", "c1", 2).await.unwrap();

        let change = rx.try_recv().unwrap();
        assert!(change.online);
        assert_eq!(change.account_id, "alice");
        assert!(rx.try_recv().is_err());
    }
}
