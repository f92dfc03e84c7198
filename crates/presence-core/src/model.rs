//! Presence data model.
//!
//! Timestamps are whole seconds since the Unix epoch. Every operation takes
//! `now` explicitly so that callers (and tests) control the clock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// An account identifier.
pub type AccountId = String;

/// A device connection identifier.
pub type ConnectionId = String;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Generate a process-unique identifier with the given prefix.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{:x}_{:x}", prefix, timestamp, counter)
}

/// One live heartbeat record for an (account, connection) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHeartbeat {
    pub account_id: AccountId,
    pub connection_id: ConnectionId,
    /// The heartbeat is live while `expires_at > now`.
    pub expires_at: u64,
}

impl ConnectionHeartbeat {
    /// Create a heartbeat valid for `ttl_seconds` from `now`.
    #[must_use]
    pub fn new(
        account_id: impl Into<AccountId>,
        connection_id: impl Into<ConnectionId>,
        now: u64,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            connection_id: connection_id.into(),
            expires_at: now.saturating_add(ttl_seconds),
        }
    }

    /// Check if the heartbeat is still live at `now`.
    #[must_use]
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// Derived presence status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// At least one connection has a live heartbeat.
    Online,
    /// No live heartbeat, but still inside the grace period.
    PendingOffline,
    /// Grace period elapsed, or never seen.
    Offline,
}

/// Presence of one account at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub account_id: AccountId,
    pub status: PresenceStatus,
    /// Time of the last real heartbeat, if the account was ever seen.
    pub last_online_at: Option<u64>,
}

impl PresenceState {
    /// Whether the account is reported online.
    ///
    /// `PendingOffline` counts as online so that brief disconnects are masked.
    #[must_use]
    pub fn is_online(&self) -> bool {
        !matches!(self.status, PresenceStatus::Offline)
    }
}

/// A presence transition published to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChange {
    pub account_id: AccountId,
    pub online: bool,
    pub last_online_at: Option<u64>,
    /// When the transition was observed.
    pub at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_liveness() {
        let heartbeat = ConnectionHeartbeat::new("alice", "conn-1", 100, 120);

        assert_eq!(heartbeat.expires_at, 220);
        assert!(heartbeat.is_live(219));
        assert!(!heartbeat.is_live(220));
    }

    #[test]
    fn test_pending_offline_reported_online() {
        let state = PresenceState {
            account_id: "alice".into(),
            status: PresenceStatus::PendingOffline,
            last_online_at: Some(5),
        };
        assert!(state.is_online());
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = generate_id("conn");
        let b = generate_id("conn");
        assert_ne!(a, b);
        assert!(a.starts_with("conn_"));
    }
}
