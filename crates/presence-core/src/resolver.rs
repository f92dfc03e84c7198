//! Presence state resolution.
//!
//! Derives Online / PendingOffline / Offline for an account from its
//! heartbeat rows and grace-period bookkeeping. Read-only.

use crate::error::PresenceError;
use crate::model::{PresenceState, PresenceStatus};
use crate::store::{AccountRecord, SharedStore};

/// Resolves the presence state of accounts.
#[derive(Clone)]
pub struct PresenceResolver {
    store: SharedStore,
    offline_grace_seconds: u64,
}

impl PresenceResolver {
    /// Create a resolver over `store`.
    #[must_use]
    pub fn new(store: SharedStore, offline_grace_seconds: u64) -> Self {
        Self {
            store,
            offline_grace_seconds,
        }
    }

    /// Grace period applied after the last heartbeat expires.
    #[must_use]
    pub fn offline_grace_seconds(&self) -> u64 {
        self.offline_grace_seconds
    }

    /// Resolve one account at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn resolve(&self, account_id: &str, now: u64) -> Result<PresenceState, PresenceError> {
        let record = self.store.load_account(account_id).await?;
        Ok(self.evaluate(account_id, record.as_ref(), now))
    }

    /// Evaluate an already-loaded record.
    #[must_use]
    pub fn evaluate(
        &self,
        account_id: &str,
        record: Option<&AccountRecord>,
        now: u64,
    ) -> PresenceState {
        let Some(record) = record else {
            return PresenceState {
                account_id: account_id.to_string(),
                status: PresenceStatus::Offline,
                last_online_at: None,
            };
        };

        let status = if record.has_live_heartbeat(now) {
            PresenceStatus::Online
        } else if record.offline_at.is_some() {
            PresenceStatus::Offline
        } else {
            match record.latest_expiry() {
                Some(expiry) if now.saturating_sub(expiry) < self.offline_grace_seconds => {
                    PresenceStatus::PendingOffline
                }
                _ => PresenceStatus::Offline,
            }
        };

        PresenceState {
            account_id: account_id.to_string(),
            status,
            last_online_at: record.last_seen_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionHeartbeat;
    use crate::store::{MemoryStore, PresenceStore};
    use std::sync::Arc;

    fn resolver() -> (Arc<MemoryStore>, PresenceResolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = PresenceResolver::new(store.clone(), 60);
        (store, resolver)
    }

    #[tokio::test]
    async fn test_unknown_account_offline() {
        let (_, resolver) = resolver();
        let state = resolver.resolve("ghost", 10).await.unwrap();

        assert_eq!(state.status, PresenceStatus::Offline);
        assert_eq!(state.last_online_at, None);
    }

    #[tokio::test]
    async fn test_grace_period_transitions() {
        let (store, resolver) = resolver();
        store
            .put_heartbeat(&ConnectionHeartbeat::new("alice", "c1", 0, 120), 0)
            .await
            .unwrap();

        assert_eq!(
            resolver.resolve("alice", 119).await.unwrap().status,
            PresenceStatus::Online
        );

        let pending = resolver.resolve("alice", 150).await.unwrap();
        assert_eq!(pending.status, PresenceStatus::PendingOffline);
        assert!(pending.is_online());

        let overdue = resolver.resolve("alice", 180).await.unwrap();
        assert_eq!(overdue.status, PresenceStatus::Offline);
        assert_eq!(overdue.last_online_at, Some(0));
    }

    #[tokio::test]
    async fn test_disconnect_starts_grace_immediately() {
        let (store, resolver) = resolver();
        store
            .put_heartbeat(&ConnectionHeartbeat::new("alice", "c1", 0, 120), 0)
            .await
            .unwrap();
        store.remove_heartbeat("alice", "c1", 10).await.unwrap();

        assert_eq!(
            resolver.resolve("alice", 69).await.unwrap().status,
            PresenceStatus::PendingOffline
        );
        assert_eq!(
            resolver.resolve("alice", 70).await.unwrap().status,
            PresenceStatus::Offline
        );
    }

    #[test]
    fn test_finalized_record_stays_offline() {
        let (_, resolver) = resolver();
        let record = AccountRecord {
            heartbeats: Vec::new(),
            last_seen_at: Some(40),
            last_expiry_at: Some(160),
            offline_at: Some(181),
        };

        let state = resolver.evaluate("alice", Some(&record), 182);
        assert_eq!(state.status, PresenceStatus::Offline);
        assert_eq!(state.last_online_at, Some(40));
    }
}
