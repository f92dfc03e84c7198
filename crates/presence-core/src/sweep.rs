//! Offline sweep worker.
//!
//! Periodically finalizes accounts whose grace period has elapsed. Several
//! instances may sweep the same store concurrently: each candidate is guarded
//! by a short-lived lock in the shared store, and the final write is
//! conditional so that a heartbeat arriving at any point before it wins.

use crate::config::PresenceConfig;
use crate::error::{with_deadline, PresenceError};
use crate::model::{generate_id, unix_now, PresenceChange, PresenceStatus};
use crate::notify::PresenceNotifier;
use crate::resolver::PresenceResolver;
use crate::store::{FinalizeOutcome, SharedStore};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What happened to one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Finalized,
    /// Another instance holds the lock.
    Contended,
    /// A heartbeat arrived, or the account was already finalized.
    Skipped,
}

/// Counters for one sweep tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Candidates selected this tick.
    pub candidates: usize,
    /// Accounts finalized offline.
    pub finalized: Vec<String>,
    /// Candidates skipped because another instance held the lock.
    pub contended: usize,
    /// Candidates no longer eligible once locked.
    pub skipped: usize,
    /// Candidates that failed; they are retried next tick.
    pub failed: usize,
}

/// Finalizes overdue pending-offline accounts.
pub struct OfflineSweeper {
    store: SharedStore,
    resolver: PresenceResolver,
    notifier: Arc<dyn PresenceNotifier>,
    config: PresenceConfig,
    holder_id: String,
}

fn lock_key(account_id: &str) -> String {
    format!("offline:{account_id}")
}

impl OfflineSweeper {
    /// Create a sweeper with a fresh holder identity.
    #[must_use]
    pub fn new(
        store: SharedStore,
        notifier: Arc<dyn PresenceNotifier>,
        config: PresenceConfig,
    ) -> Self {
        let resolver = PresenceResolver::new(store.clone(), config.offline_grace_seconds);
        Self {
            store,
            resolver,
            notifier,
            config,
            holder_id: generate_id("sweeper"),
        }
    }

    /// Override the lock holder identity.
    #[must_use]
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    /// The value this sweeper writes into the locks it holds.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Run one sweep tick at `now`.
    ///
    /// Each candidate is processed independently; a failure on one does not
    /// abort the batch.
    ///
    /// # Errors
    ///
    /// Returns an error only if candidates cannot be selected at all.
    pub async fn process_offline_candidates(&self, now: u64) -> Result<SweepReport, PresenceError> {
        let mut report = SweepReport::default();
        let Some(cutoff) = now.checked_sub(self.config.offline_grace_seconds) else {
            return Ok(report);
        };

        let candidates = self
            .store
            .due_for_offline(cutoff, self.config.worker_batch_size)
            .await?;
        report.candidates = candidates.len();

        for account_id in candidates {
            // A holder never works past its own lock.
            let outcome = with_deadline(
                self.config.offline_lock(),
                self.finalize_candidate(&account_id, now, cutoff),
            )
            .await;

            match outcome {
                Ok(CandidateOutcome::Finalized) => report.finalized.push(account_id),
                Ok(CandidateOutcome::Contended) => report.contended += 1,
                Ok(CandidateOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(account = %account_id, error = %e, "Offline finalization failed");
                    report.failed += 1;
                }
            }
        }

        if report.candidates > 0 {
            debug!(
                candidates = report.candidates,
                finalized = report.finalized.len(),
                contended = report.contended,
                skipped = report.skipped,
                failed = report.failed,
                "Sweep tick complete"
            );
        }

        Ok(report)
    }

    async fn finalize_candidate(
        &self,
        account_id: &str,
        now: u64,
        cutoff: u64,
    ) -> Result<CandidateOutcome, PresenceError> {
        let key = lock_key(account_id);
        if !self
            .store
            .try_acquire_lock(&key, &self.holder_id, now, self.config.offline_lock_seconds)
            .await?
        {
            trace!(account = %account_id, "Offline lock held elsewhere");
            return Ok(CandidateOutcome::Contended);
        }

        let result = self.finalize_locked(account_id, now, cutoff).await;

        if let Err(e) = self.store.release_lock(&key, &self.holder_id).await {
            // The lock expires on its own.
            warn!(account = %account_id, error = %e, "Failed to release offline lock");
        }

        result
    }

    async fn finalize_locked(
        &self,
        account_id: &str,
        now: u64,
        cutoff: u64,
    ) -> Result<CandidateOutcome, PresenceError> {
        let state = self.resolver.resolve(account_id, now).await?;
        if state.status != PresenceStatus::Offline {
            trace!(account = %account_id, status = ?state.status, "Candidate no longer eligible");
            self.store.reschedule_offline(account_id).await?;
            return Ok(CandidateOutcome::Skipped);
        }

        match self.store.finalize_offline(account_id, now, cutoff).await? {
            FinalizeOutcome::Finalized { last_online_at } => {
                info!(account = %account_id, last_online_at = ?last_online_at, "Account offline");
                self.notifier.notify(PresenceChange {
                    account_id: account_id.to_string(),
                    online: false,
                    last_online_at,
                    at: now,
                });
                Ok(CandidateOutcome::Finalized)
            }
            FinalizeOutcome::NotDue | FinalizeOutcome::AlreadyOffline => {
                Ok(CandidateOutcome::Skipped)
            }
        }
    }

    /// Sweep every `worker_interval` until `shutdown` is cancelled.
    ///
    /// A tick in progress always completes; the loop exits at the next tick
    /// boundary. `on_tick` observes each successful tick.
    pub async fn run<F>(&self, shutdown: CancellationToken, mut on_tick: F)
    where
        F: FnMut(&SweepReport),
    {
        let mut ticker = tokio::time::interval(self.config.worker_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            holder = %self.holder_id,
            interval_secs = self.config.worker_interval_seconds,
            batch = self.config.worker_batch_size,
            "Offline sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.process_offline_candidates(unix_now()).await {
                Ok(report) => on_tick(&report),
                Err(e) => warn!(error = %e, "Sweep tick failed, retrying next interval"),
            }
        }

        info!(holder = %self.holder_id, "Offline sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceOptions;
    use crate::directory::InMemoryDirectory;
    use crate::model::{AccountId, ConnectionHeartbeat};
    use crate::notify::{BroadcastNotifier, NoopNotifier};
    use crate::rate_limit::SnapshotRateLimiter;
    use crate::registry::ConnectionRegistry;
    use crate::snapshot::{SnapshotResponse, SnapshotService};
    use crate::store::{AccountRecord, HeartbeatWrite, MemoryStore, PresenceStore, WindowCount};
    use async_trait::async_trait;
    use std::time::Duration;

    fn config(batch: i64) -> PresenceConfig {
        PresenceOptions {
            heartbeat_ttl_seconds: 120,
            offline_grace_seconds: 60,
            worker_batch_size: batch,
            ..PresenceOptions::default()
        }
        .normalize()
    }

    fn registry(store: Arc<MemoryStore>) -> ConnectionRegistry {
        ConnectionRegistry::new(store, Arc::new(NoopNotifier), 120)
    }

    #[tokio::test]
    async fn test_worked_example() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let sweeper = OfflineSweeper::new(store.clone(), Arc::new(NoopNotifier), config(100));
        let directory = Arc::new(InMemoryDirectory::new());
        let snapshots = SnapshotService::new(
            PresenceResolver::new(store.clone(), 60),
            SnapshotRateLimiter::new(store.clone(), 30, 60),
            directory.clone(),
            directory,
            200,
        );
        let resolver = PresenceResolver::new(store.clone(), 60);

        registry.mark_connected("alice", "c1", 0).await.unwrap();

        let pending = resolver.resolve("alice", 150).await.unwrap();
        assert_eq!(pending.status, PresenceStatus::PendingOffline);
        assert!(pending.is_online());
        assert!(sweeper.process_offline_candidates(150).await.unwrap().finalized.is_empty());

        let report = sweeper.process_offline_candidates(181).await.unwrap();
        assert_eq!(report.finalized, vec!["alice"]);

        let response = snapshots
            .get_snapshot("viewer", &["alice".to_string()], 190)
            .await
            .unwrap();
        let SnapshotResponse::Statuses(entries) = response else {
            panic!("Expected statuses");
        };
        assert_eq!(entries[0].is_online, Some(false));
        assert_eq!(entries[0].last_online_at, Some(0));
    }

    #[tokio::test]
    async fn test_offline_notified_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::with_capacity(16));
        let mut rx = notifier.subscribe();
        let sweeper = OfflineSweeper::new(store.clone(), notifier.clone(), config(100));

        registry(store.clone()).mark_connected("alice", "c1", 40).await.unwrap();

        for now in [181, 200, 250, 400] {
            sweeper.process_offline_candidates(now).await.unwrap();
        }

        let change = rx.try_recv().unwrap();
        assert!(!change.online);
        assert_eq!(change.last_online_at, Some(40));
        assert_eq!(change.at, 250);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_cap_drains_over_ticks() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let sweeper = OfflineSweeper::new(store.clone(), Arc::new(NoopNotifier), config(100));

        for i in 0..250 {
            registry
                .mark_connected(&format!("user-{i}"), &format!("conn-{i}"), 0)
                .await
                .unwrap();
        }

        let mut sizes = Vec::new();
        for tick in 0..4 {
            let report = sweeper.process_offline_candidates(200 + tick).await.unwrap();
            sizes.push(report.finalized.len());
        }
        assert_eq!(sizes, vec![100, 100, 50, 0]);

        let resolver = PresenceResolver::new(store.clone(), 60);
        for i in 0..250 {
            let state = resolver.resolve(&format!("user-{i}"), 300).await.unwrap();
            assert_eq!(state.status, PresenceStatus::Offline);
        }
    }

    #[tokio::test]
    async fn test_reconnect_during_grace_cancels_offline() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store.clone());
        let sweeper = OfflineSweeper::new(store.clone(), Arc::new(NoopNotifier), config(100));

        registry.mark_connected("alice", "c1", 0).await.unwrap();
        registry.mark_disconnected(Some("alice"), "c1", 10).await.unwrap();
        registry.mark_connected("alice", "c2", 50).await.unwrap();

        let report = sweeper.process_offline_candidates(75).await.unwrap();
        assert!(report.finalized.is_empty());
        assert_eq!(
            PresenceResolver::new(store, 60).resolve("alice", 75).await.unwrap().status,
            PresenceStatus::Online
        );
    }

    #[tokio::test]
    async fn test_lock_contention_skips_then_recovers() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = OfflineSweeper::new(store.clone(), Arc::new(NoopNotifier), config(100))
            .with_holder_id("worker-a");

        registry(store.clone()).mark_connected("alice", "c1", 0).await.unwrap();
        assert!(store
            .try_acquire_lock("offline:alice", "worker-b", 180, 10)
            .await
            .unwrap());

        let report = sweeper.process_offline_candidates(181).await.unwrap();
        assert_eq!(report.contended, 1);
        assert!(report.finalized.is_empty());

        // worker-b crashed without releasing; its lock lapses.
        let report = sweeper.process_offline_candidates(190).await.unwrap();
        assert_eq!(report.finalized, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_lock_released_after_finalize() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = OfflineSweeper::new(store.clone(), Arc::new(NoopNotifier), config(100))
            .with_holder_id("worker-a");

        registry(store.clone()).mark_connected("alice", "c1", 0).await.unwrap();
        sweeper.process_offline_candidates(181).await.unwrap();

        assert!(store
            .try_acquire_lock("offline:alice", "worker-b", 182, 10)
            .await
            .unwrap());
    }

    /// Delegates to a memory store, but lands a heartbeat for the candidate
    /// right after the sweeper acquires its lock.
    struct RacingStore {
        inner: MemoryStore,
        heartbeat_at: u64,
    }

    #[async_trait]
    impl PresenceStore for RacingStore {
        async fn put_heartbeat(
            &self,
            heartbeat: &ConnectionHeartbeat,
            seen_at: u64,
        ) -> Result<HeartbeatWrite, PresenceError> {
            self.inner.put_heartbeat(heartbeat, seen_at).await
        }

        async fn remove_heartbeat(
            &self,
            account_id: &str,
            connection_id: &str,
            ended_at: u64,
        ) -> Result<bool, PresenceError> {
            self.inner
                .remove_heartbeat(account_id, connection_id, ended_at)
                .await
        }

        async fn account_for_connection(
            &self,
            connection_id: &str,
        ) -> Result<Option<AccountId>, PresenceError> {
            self.inner.account_for_connection(connection_id).await
        }

        async fn load_account(
            &self,
            account_id: &str,
        ) -> Result<Option<AccountRecord>, PresenceError> {
            self.inner.load_account(account_id).await
        }

        async fn due_for_offline(
            &self,
            cutoff: u64,
            limit: usize,
        ) -> Result<Vec<AccountId>, PresenceError> {
            self.inner.due_for_offline(cutoff, limit).await
        }

        async fn reschedule_offline(&self, account_id: &str) -> Result<(), PresenceError> {
            self.inner.reschedule_offline(account_id).await
        }

        async fn finalize_offline(
            &self,
            account_id: &str,
            now: u64,
            cutoff: u64,
        ) -> Result<FinalizeOutcome, PresenceError> {
            self.inner.finalize_offline(account_id, now, cutoff).await
        }

        async fn try_acquire_lock(
            &self,
            key: &str,
            holder: &str,
            now: u64,
            ttl_seconds: u64,
        ) -> Result<bool, PresenceError> {
            let acquired = self
                .inner
                .try_acquire_lock(key, holder, now, ttl_seconds)
                .await?;
            if let Some(account_id) = key.strip_prefix("offline:") {
                let heartbeat =
                    ConnectionHeartbeat::new(account_id, "late-conn", self.heartbeat_at, 120);
                self.inner.put_heartbeat(&heartbeat, self.heartbeat_at).await?;
            }
            Ok(acquired)
        }

        async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, PresenceError> {
            self.inner.release_lock(key, holder).await
        }

        async fn increment_window(
            &self,
            key: &str,
            now: u64,
            window_seconds: u64,
        ) -> Result<WindowCount, PresenceError> {
            self.inner.increment_window(key, now, window_seconds).await
        }
    }

    #[tokio::test]
    async fn test_heartbeat_after_selection_wins() {
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(),
            heartbeat_at: 181,
        });
        store
            .put_heartbeat(&ConnectionHeartbeat::new("alice", "c1", 0, 120), 0)
            .await
            .unwrap();

        let sweeper = OfflineSweeper::new(store.clone(), Arc::new(NoopNotifier), config(100));
        let report = sweeper.process_offline_candidates(181).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert!(report.finalized.is_empty());
        assert_eq!(report.skipped, 1);

        let record = store.load_account("alice").await.unwrap().unwrap();
        assert_eq!(record.offline_at, None);
        assert!(record.has_live_heartbeat(181));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = Arc::new(OfflineSweeper::new(
            store,
            Arc::new(NoopNotifier),
            config(100),
        ));
        let shutdown = CancellationToken::new();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = {
            let sweeper = sweeper.clone();
            let shutdown = shutdown.clone();
            let ticks = ticks.clone();
            tokio::spawn(async move {
                sweeper
                    .run(shutdown, |_| {
                        ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(4), handle)
            .await
            .expect("sweeper did not stop within one tick")
            .unwrap();
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }
}
