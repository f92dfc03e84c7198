//! Per-viewer snapshot throttling.
//!
//! Fixed-window counter kept in the shared store so that every instance
//! counts against the same budget.

use crate::error::PresenceError;
use crate::store::SharedStore;
use tracing::debug;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the current window resets; zero when allowed.
    pub retry_after_seconds: u64,
    /// Requests left in the current window.
    pub remaining: u64,
}

/// Throttles snapshot queries per viewer.
#[derive(Clone)]
pub struct SnapshotRateLimiter {
    store: SharedStore,
    window_seconds: u64,
    max_requests: u64,
}

impl SnapshotRateLimiter {
    /// Create a limiter allowing `max_requests` per `window_seconds`.
    #[must_use]
    pub fn new(store: SharedStore, window_seconds: u64, max_requests: u64) -> Self {
        Self {
            store,
            window_seconds: window_seconds.max(1),
            max_requests: max_requests.max(1),
        }
    }

    /// Count one request for `viewer_id` and decide whether it may proceed.
    ///
    /// Rejected requests still count against the window.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn try_consume(
        &self,
        viewer_id: &str,
        now: u64,
    ) -> Result<RateLimitDecision, PresenceError> {
        let key = format!("snapshot:{viewer_id}");
        let window = self
            .store
            .increment_window(&key, now, self.window_seconds)
            .await?;

        if window.count > self.max_requests {
            let resets_at = window.window_start.saturating_add(self.window_seconds);
            let retry_after_seconds = resets_at.saturating_sub(now).max(1);
            debug!(
                viewer = %viewer_id,
                count = window.count,
                retry_after = retry_after_seconds,
                "Snapshot rate limited"
            );
            return Ok(RateLimitDecision {
                allowed: false,
                retry_after_seconds,
                remaining: 0,
            });
        }

        Ok(RateLimitDecision {
            allowed: true,
            retry_after_seconds: 0,
            remaining: self.max_requests - window.count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rejects_after_max_requests() {
        let limiter = SnapshotRateLimiter::new(Arc::new(MemoryStore::new()), 30, 3);

        for t in 0..3 {
            assert!(limiter.try_consume("viewer", t).await.unwrap().allowed);
        }

        let rejected = limiter.try_consume("viewer", 3).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after_seconds, 27);
    }

    #[tokio::test]
    async fn test_window_elapse_restarts_counter() {
        let limiter = SnapshotRateLimiter::new(Arc::new(MemoryStore::new()), 30, 2);

        limiter.try_consume("viewer", 0).await.unwrap();
        limiter.try_consume("viewer", 1).await.unwrap();
        assert!(!limiter.try_consume("viewer", 29).await.unwrap().allowed);

        let next = limiter.try_consume("viewer", 30).await.unwrap();
        assert!(next.allowed);
        assert_eq!(next.remaining, 1);
    }

    #[tokio::test]
    async fn test_viewers_are_independent() {
        let limiter = SnapshotRateLimiter::new(Arc::new(MemoryStore::new()), 30, 1);

        assert!(limiter.try_consume("alice", 0).await.unwrap().allowed);
        assert!(limiter.try_consume("bob", 0).await.unwrap().allowed);
        assert!(!limiter.try_consume("alice", 0).await.unwrap().allowed);
    }
}
