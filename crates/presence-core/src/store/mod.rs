//! Shared presence store.
//!
//! All presence state lives behind [`PresenceStore`] so that several service
//! instances observe and mutate the same heartbeats, locks and counters. Each
//! method is one atomic operation on the keys of a single account, lock or
//! viewer; nothing here takes a global lock.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use crate::error::PresenceError;
use crate::model::{AccountId, ConnectionHeartbeat, ConnectionId};
use async_trait::async_trait;
use std::sync::Arc;

/// Shared handle to a presence store.
pub type SharedStore = Arc<dyn PresenceStore>;

/// Result of writing a heartbeat row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatWrite {
    /// A live row for the same connection already existed.
    pub existed: bool,
    /// The account was finalized offline (or never seen) before this write.
    pub revived: bool,
}

/// Everything the store knows about one account, read in one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountRecord {
    /// Heartbeat rows, live or not yet cleaned up.
    pub heartbeats: Vec<(ConnectionId, u64)>,
    /// Time of the most recent heartbeat ever written.
    pub last_seen_at: Option<u64>,
    /// Latest effective expiry among connections that have been removed.
    pub last_expiry_at: Option<u64>,
    /// Set when a sweep finalized the account offline.
    pub offline_at: Option<u64>,
}

impl AccountRecord {
    /// Whether any heartbeat row is live at `now`.
    #[must_use]
    pub fn has_live_heartbeat(&self, now: u64) -> bool {
        self.heartbeats.iter().any(|(_, expires_at)| *expires_at > now)
    }

    /// Latest expiry over remaining rows and removed connections.
    #[must_use]
    pub fn latest_expiry(&self) -> Option<u64> {
        self.heartbeats
            .iter()
            .map(|(_, expires_at)| *expires_at)
            .chain(self.last_expiry_at)
            .max()
    }
}

/// Outcome of a conditional offline finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The account is now offline; `last_online_at` is frozen.
    Finalized { last_online_at: Option<u64> },
    /// A live heartbeat exists or the grace period has not elapsed.
    NotDue,
    /// Already finalized by an earlier sweep.
    AlreadyOffline,
}

/// Fixed-window counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub window_start: u64,
}

/// Atomic operations over shared presence state.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Create or refresh a heartbeat row.
    ///
    /// Also raises the account's `last_seen_at` to `seen_at`, clears any
    /// finalized-offline marker, indexes the connection, and reschedules the
    /// account in the offline-due index at its latest expiry. Other rows of
    /// the account that expired at or before `seen_at` are removed and their
    /// expiry folded into `last_expiry_at`.
    async fn put_heartbeat(
        &self,
        heartbeat: &ConnectionHeartbeat,
        seen_at: u64,
    ) -> Result<HeartbeatWrite, PresenceError>;

    /// Remove a heartbeat row. The connection's effective expiry becomes
    /// `min(expires_at, ended_at)`.
    ///
    /// Returns `false` if the row did not exist.
    async fn remove_heartbeat(
        &self,
        account_id: &str,
        connection_id: &str,
        ended_at: u64,
    ) -> Result<bool, PresenceError>;

    /// Look up which account owns a connection.
    async fn account_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<AccountId>, PresenceError>;

    /// Read an account's rows and bookkeeping.
    async fn load_account(&self, account_id: &str) -> Result<Option<AccountRecord>, PresenceError>;

    /// Accounts whose latest expiry is at or before `cutoff`, oldest first.
    async fn due_for_offline(
        &self,
        cutoff: u64,
        limit: usize,
    ) -> Result<Vec<AccountId>, PresenceError>;

    /// Recompute an account's position in the offline-due index.
    async fn reschedule_offline(&self, account_id: &str) -> Result<(), PresenceError>;

    /// Finalize an account offline if, and only if, no row is live at `now`
    /// and its latest expiry is at or before `cutoff`.
    async fn finalize_offline(
        &self,
        account_id: &str,
        now: u64,
        cutoff: u64,
    ) -> Result<FinalizeOutcome, PresenceError>;

    /// Create `key` owned by `holder` unless a live lock already exists.
    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        now: u64,
        ttl_seconds: u64,
    ) -> Result<bool, PresenceError>;

    /// Delete `key` if it is still owned by `holder`.
    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, PresenceError>;

    /// Increment a fixed-window counter, starting a new window at `now` once
    /// the current one has elapsed.
    async fn increment_window(
        &self,
        key: &str,
        now: u64,
        window_seconds: u64,
    ) -> Result<WindowCount, PresenceError>;
}
