//! Presence tuning knobs.
//!
//! [`PresenceOptions`] is what operators write (every key optional, signed so
//! that bad input can be detected); [`PresenceConfig`] is the normalized form
//! the components consume. Any non-positive option falls back to its default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HEARTBEAT_TTL_SECONDS: u64 = 120;
pub const DEFAULT_OFFLINE_GRACE_SECONDS: u64 = 60;
pub const DEFAULT_OFFLINE_LOCK_SECONDS: u64 = 10;
pub const DEFAULT_WORKER_INTERVAL_SECONDS: u64 = 3;
pub const DEFAULT_WORKER_BATCH_SIZE: usize = 100;
pub const DEFAULT_SNAPSHOT_MAX_ACCOUNT_IDS: usize = 200;
pub const DEFAULT_SNAPSHOT_RATE_LIMIT_WINDOW_SECONDS: u64 = 30;
pub const DEFAULT_SNAPSHOT_RATE_LIMIT_MAX_REQUESTS: u64 = 60;

/// Raw presence options as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceOptions {
    /// Heartbeat validity window.
    pub heartbeat_ttl_seconds: i64,
    /// Delay before a pending-offline account is finalized offline.
    pub offline_grace_seconds: i64,
    /// TTL of the per-account finalization lock.
    pub offline_lock_seconds: i64,
    /// Sweep tick cadence.
    pub worker_interval_seconds: i64,
    /// Maximum accounts finalized per tick.
    pub worker_batch_size: i64,
    /// Maximum targets per snapshot query.
    pub snapshot_max_account_ids: i64,
    /// Rate-limit window length.
    pub snapshot_rate_limit_window_seconds: i64,
    /// Maximum snapshot queries per viewer per window.
    pub snapshot_rate_limit_max_requests: i64,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            heartbeat_ttl_seconds: DEFAULT_HEARTBEAT_TTL_SECONDS as i64,
            offline_grace_seconds: DEFAULT_OFFLINE_GRACE_SECONDS as i64,
            offline_lock_seconds: DEFAULT_OFFLINE_LOCK_SECONDS as i64,
            worker_interval_seconds: DEFAULT_WORKER_INTERVAL_SECONDS as i64,
            worker_batch_size: DEFAULT_WORKER_BATCH_SIZE as i64,
            snapshot_max_account_ids: DEFAULT_SNAPSHOT_MAX_ACCOUNT_IDS as i64,
            snapshot_rate_limit_window_seconds: DEFAULT_SNAPSHOT_RATE_LIMIT_WINDOW_SECONDS as i64,
            snapshot_rate_limit_max_requests: DEFAULT_SNAPSHOT_RATE_LIMIT_MAX_REQUESTS as i64,
        }
    }
}

fn positive_or(value: i64, default: u64) -> u64 {
    if value > 0 {
        value as u64
    } else {
        default
    }
}

impl PresenceOptions {
    /// Normalize into a config where every value is positive.
    #[must_use]
    pub fn normalize(&self) -> PresenceConfig {
        PresenceConfig {
            heartbeat_ttl_seconds: positive_or(
                self.heartbeat_ttl_seconds,
                DEFAULT_HEARTBEAT_TTL_SECONDS,
            ),
            offline_grace_seconds: positive_or(
                self.offline_grace_seconds,
                DEFAULT_OFFLINE_GRACE_SECONDS,
            ),
            offline_lock_seconds: positive_or(
                self.offline_lock_seconds,
                DEFAULT_OFFLINE_LOCK_SECONDS,
            ),
            worker_interval_seconds: positive_or(
                self.worker_interval_seconds,
                DEFAULT_WORKER_INTERVAL_SECONDS,
            ),
            worker_batch_size: positive_or(
                self.worker_batch_size,
                DEFAULT_WORKER_BATCH_SIZE as u64,
            ) as usize,
            snapshot_max_account_ids: positive_or(
                self.snapshot_max_account_ids,
                DEFAULT_SNAPSHOT_MAX_ACCOUNT_IDS as u64,
            ) as usize,
            snapshot_rate_limit_window_seconds: positive_or(
                self.snapshot_rate_limit_window_seconds,
                DEFAULT_SNAPSHOT_RATE_LIMIT_WINDOW_SECONDS,
            ),
            snapshot_rate_limit_max_requests: positive_or(
                self.snapshot_rate_limit_max_requests,
                DEFAULT_SNAPSHOT_RATE_LIMIT_MAX_REQUESTS,
            ),
        }
    }
}

/// Normalized presence configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub heartbeat_ttl_seconds: u64,
    pub offline_grace_seconds: u64,
    pub offline_lock_seconds: u64,
    pub worker_interval_seconds: u64,
    pub worker_batch_size: usize,
    pub snapshot_max_account_ids: usize,
    pub snapshot_rate_limit_window_seconds: u64,
    pub snapshot_rate_limit_max_requests: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceOptions::default().normalize()
    }
}

impl PresenceConfig {
    /// Sweep tick cadence as a duration.
    #[must_use]
    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_seconds)
    }

    /// Finalization lock TTL as a duration.
    #[must_use]
    pub fn offline_lock(&self) -> Duration {
        Duration::from_secs(self.offline_lock_seconds)
    }
}
