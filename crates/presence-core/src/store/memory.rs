//! In-process presence store.
//!
//! Backed by sharded `DashMap`s; every per-account operation runs under that
//! account's shard entry lock, which gives the same atomicity the shared
//! backend gets from server-side scripts. Only correct for a single process.

use super::{AccountRecord, FinalizeOutcome, HeartbeatWrite, PresenceStore, WindowCount};
use crate::error::PresenceError;
use crate::model::{AccountId, ConnectionHeartbeat, ConnectionId};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Default)]
struct AccountEntry {
    /// Connection ID -> heartbeat expiry.
    connections: HashMap<ConnectionId, u64>,
    last_seen_at: Option<u64>,
    last_expiry_at: Option<u64>,
    offline_at: Option<u64>,
    /// Score in the offline-due index; `None` when not scheduled.
    offline_due: Option<u64>,
}

impl AccountEntry {
    fn latest_expiry(&self) -> Option<u64> {
        self.connections
            .values()
            .copied()
            .chain(self.last_expiry_at)
            .max()
    }

    fn has_live_heartbeat(&self, now: u64) -> bool {
        self.connections.values().any(|expires_at| *expires_at > now)
    }
}

#[derive(Debug)]
struct LockEntry {
    holder: String,
    expires_at: u64,
}

/// In-memory [`PresenceStore`].
///
/// Lock order is accounts before connections; no method takes them the
/// other way round.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, AccountEntry>,
    connections: DashMap<ConnectionId, AccountId>,
    locks: DashMap<String, LockEntry>,
    windows: DashMap<String, WindowCount>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn put_heartbeat(
        &self,
        heartbeat: &ConnectionHeartbeat,
        seen_at: u64,
    ) -> Result<HeartbeatWrite, PresenceError> {
        let mut entry = self
            .accounts
            .entry(heartbeat.account_id.clone())
            .or_default();

        let existed = entry
            .connections
            .get(&heartbeat.connection_id)
            .is_some_and(|expires_at| *expires_at > seen_at);
        let revived = entry.offline_at.is_some() || entry.last_seen_at.is_none();

        let stale: Vec<(ConnectionId, u64)> = entry
            .connections
            .iter()
            .filter(|(id, expires_at)| {
                **expires_at <= seen_at && **id != heartbeat.connection_id
            })
            .map(|(id, expires_at)| (id.clone(), *expires_at))
            .collect();
        for (id, expires_at) in &stale {
            entry.connections.remove(id);
            entry.last_expiry_at = Some(
                entry
                    .last_expiry_at
                    .map_or(*expires_at, |prev| prev.max(*expires_at)),
            );
            self.connections
                .remove_if(id, |_, owner| owner == &heartbeat.account_id);
        }

        entry
            .connections
            .insert(heartbeat.connection_id.clone(), heartbeat.expires_at);
        entry.last_seen_at = Some(entry.last_seen_at.map_or(seen_at, |prev| prev.max(seen_at)));
        entry.offline_at = None;
        entry.offline_due = entry.latest_expiry();

        self.connections
            .insert(heartbeat.connection_id.clone(), heartbeat.account_id.clone());

        trace!(
            account = %heartbeat.account_id,
            connection = %heartbeat.connection_id,
            expires_at = heartbeat.expires_at,
            "Heartbeat stored"
        );

        Ok(HeartbeatWrite { existed, revived })
    }

    async fn remove_heartbeat(
        &self,
        account_id: &str,
        connection_id: &str,
        ended_at: u64,
    ) -> Result<bool, PresenceError> {
        let Some(mut entry) = self.accounts.get_mut(account_id) else {
            return Ok(false);
        };
        let Some(expires_at) = entry.connections.remove(connection_id) else {
            return Ok(false);
        };

        let ended = expires_at.min(ended_at);
        entry.last_expiry_at = Some(entry.last_expiry_at.map_or(ended, |prev| prev.max(ended)));
        if entry.offline_at.is_none() {
            entry.offline_due = entry.latest_expiry();
        }

        self.connections
            .remove_if(connection_id, |_, owner| owner == account_id);

        Ok(true)
    }

    async fn account_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<AccountId>, PresenceError> {
        Ok(self.connections.get(connection_id).map(|a| a.value().clone()))
    }

    async fn load_account(&self, account_id: &str) -> Result<Option<AccountRecord>, PresenceError> {
        Ok(self.accounts.get(account_id).map(|entry| AccountRecord {
            heartbeats: entry
                .connections
                .iter()
                .map(|(id, expires_at)| (id.clone(), *expires_at))
                .collect(),
            last_seen_at: entry.last_seen_at,
            last_expiry_at: entry.last_expiry_at,
            offline_at: entry.offline_at,
        }))
    }

    async fn due_for_offline(
        &self,
        cutoff: u64,
        limit: usize,
    ) -> Result<Vec<AccountId>, PresenceError> {
        let mut due: Vec<(u64, AccountId)> = self
            .accounts
            .iter()
            .filter_map(|e| match (e.offline_at, e.offline_due) {
                (None, Some(score)) if score <= cutoff => Some((score, e.key().clone())),
                _ => None,
            })
            .collect();

        due.sort_unstable();
        due.truncate(limit);
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn reschedule_offline(&self, account_id: &str) -> Result<(), PresenceError> {
        if let Some(mut entry) = self.accounts.get_mut(account_id) {
            entry.offline_due = if entry.offline_at.is_none() {
                entry.latest_expiry()
            } else {
                None
            };
        }
        Ok(())
    }

    async fn finalize_offline(
        &self,
        account_id: &str,
        now: u64,
        cutoff: u64,
    ) -> Result<FinalizeOutcome, PresenceError> {
        let Some(mut entry) = self.accounts.get_mut(account_id) else {
            return Ok(FinalizeOutcome::AlreadyOffline);
        };

        if entry.offline_at.is_some() {
            entry.offline_due = None;
            return Ok(FinalizeOutcome::AlreadyOffline);
        }

        let latest = entry.latest_expiry();
        if entry.has_live_heartbeat(now) || latest.map_or(true, |e| e > cutoff) {
            entry.offline_due = latest;
            return Ok(FinalizeOutcome::NotDue);
        }

        let expired: Vec<ConnectionId> = entry.connections.drain().map(|(id, _)| id).collect();
        entry.last_expiry_at = latest;
        entry.offline_at = Some(now);
        entry.offline_due = None;

        for id in &expired {
            self.connections.remove_if(id, |_, owner| owner == account_id);
        }

        Ok(FinalizeOutcome::Finalized {
            last_online_at: entry.last_seen_at,
        })
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        now: u64,
        ttl_seconds: u64,
    ) -> Result<bool, PresenceError> {
        let lock = LockEntry {
            holder: holder.to_string(),
            expires_at: now.saturating_add(ttl_seconds),
        };

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(lock);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lock);
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, PresenceError> {
        Ok(self
            .locks
            .remove_if(key, |_, lock| lock.holder == holder)
            .is_some())
    }

    async fn increment_window(
        &self,
        key: &str,
        now: u64,
        window_seconds: u64,
    ) -> Result<WindowCount, PresenceError> {
        let mut window = self.windows.entry(key.to_string()).or_insert(WindowCount {
            count: 0,
            window_start: now,
        });

        if now >= window.window_start.saturating_add(window_seconds) {
            *window = WindowCount {
                count: 0,
                window_start: now,
            };
        }

        window.count += 1;
        Ok(*window)
    }
}
