//! Bulk, privacy-filtered online status queries.
//!
//! A snapshot answers "is X online" for a bounded set of targets on behalf of
//! a viewer. The viewer is rate limited first; each target's own visibility
//! preference then decides whether its status is disclosed at all.

use crate::directory::{ContactStore, Visibility, VisibilityStore};
use crate::error::PresenceError;
use crate::model::AccountId;
use crate::rate_limit::{RateLimitDecision, SnapshotRateLimiter};
use crate::resolver::PresenceResolver;
use futures_util::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Status of one target as seen by the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub account_id: AccountId,
    pub can_show_status: bool,
    /// Present only when `can_show_status` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    /// Present only when `can_show_status` is true and the account was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_online_at: Option<u64>,
}

impl SnapshotEntry {
    fn hidden(account_id: AccountId) -> Self {
        Self {
            account_id,
            can_show_status: false,
            is_online: None,
            last_online_at: None,
        }
    }
}

/// Result of a snapshot query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotResponse {
    /// One entry per distinct target, in request order.
    Statuses(Vec<SnapshotEntry>),
    /// The viewer exceeded its budget; presence state was not read.
    RateLimited { retry_after_seconds: u64 },
}

/// Answers snapshot queries.
#[derive(Clone)]
pub struct SnapshotService {
    resolver: PresenceResolver,
    limiter: SnapshotRateLimiter,
    visibility: Arc<dyn VisibilityStore>,
    contacts: Arc<dyn ContactStore>,
    max_account_ids: usize,
}

impl SnapshotService {
    #[must_use]
    pub fn new(
        resolver: PresenceResolver,
        limiter: SnapshotRateLimiter,
        visibility: Arc<dyn VisibilityStore>,
        contacts: Arc<dyn ContactStore>,
        max_account_ids: usize,
    ) -> Self {
        Self {
            resolver,
            limiter,
            visibility,
            contacts,
            max_account_ids,
        }
    }

    /// Maximum number of targets per query.
    #[must_use]
    pub fn max_account_ids(&self) -> usize {
        self.max_account_ids
    }

    /// Rate-limit check only, without running a query.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn try_consume_rate_limit(
        &self,
        viewer_id: &str,
        now: u64,
    ) -> Result<RateLimitDecision, PresenceError> {
        self.limiter.try_consume(viewer_id, now).await
    }

    /// Snapshot the online status of `target_ids` for `viewer_id`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty or oversized target list, or a
    /// storage error if presence state cannot be read.
    pub async fn get_snapshot(
        &self,
        viewer_id: &str,
        target_ids: &[AccountId],
        now: u64,
    ) -> Result<SnapshotResponse, PresenceError> {
        if viewer_id.is_empty() {
            return Err(PresenceError::Validation("viewer id cannot be empty".into()));
        }
        if target_ids.len() > self.max_account_ids {
            return Err(PresenceError::Validation(format!(
                "at most {} account ids per snapshot, got {}",
                self.max_account_ids,
                target_ids.len()
            )));
        }
        let targets = distinct(target_ids);
        if targets.is_empty() {
            return Err(PresenceError::Validation(
                "at least one account id is required".into(),
            ));
        }

        let decision = self.limiter.try_consume(viewer_id, now).await?;
        if !decision.allowed {
            return Ok(SnapshotResponse::RateLimited {
                retry_after_seconds: decision.retry_after_seconds,
            });
        }

        let allowed = self.visible_targets(viewer_id, &targets).await;

        let states = try_join_all(
            targets
                .iter()
                .filter(|id| allowed.contains(id.as_str()))
                .map(|id| self.resolver.resolve(id, now)),
        )
        .await?;
        let mut states: HashMap<AccountId, _> = states
            .into_iter()
            .map(|state| (state.account_id.clone(), state))
            .collect();

        let entries: Vec<SnapshotEntry> = targets
            .into_iter()
            .map(|id| match states.remove(&id) {
                Some(state) => SnapshotEntry {
                    is_online: Some(state.is_online()),
                    last_online_at: state.last_online_at,
                    account_id: id,
                    can_show_status: true,
                },
                None => SnapshotEntry::hidden(id),
            })
            .collect();

        debug!(
            viewer = %viewer_id,
            targets = entries.len(),
            visible = allowed.len(),
            "Snapshot served"
        );

        Ok(SnapshotResponse::Statuses(entries))
    }

    /// Targets whose status `viewer_id` may see. Lookup failures hide the
    /// affected targets.
    async fn visible_targets(&self, viewer_id: &str, targets: &[AccountId]) -> HashSet<AccountId> {
        let mut allowed = HashSet::new();
        let others: Vec<&AccountId> = targets
            .iter()
            .filter(|id| {
                if id.as_str() == viewer_id {
                    allowed.insert((*id).clone());
                    false
                } else {
                    true
                }
            })
            .collect();

        let lookups = join_all(others.iter().map(|id| async move {
            (*id, self.visibility.online_status_visibility(id).await)
        }))
        .await;

        let mut contacts_only = Vec::new();
        for (id, result) in lookups {
            match result {
                Ok(Visibility::Everyone) => {
                    allowed.insert(id.clone());
                }
                Ok(Visibility::ContactsOnly) => contacts_only.push(id.clone()),
                Ok(Visibility::Nobody) => {}
                Err(e) => {
                    warn!(account = %id, error = %e, "Visibility lookup failed, hiding status");
                }
            }
        }

        if !contacts_only.is_empty() {
            match self
                .contacts
                .contact_target_ids(viewer_id, &contacts_only)
                .await
            {
                Ok(ids) => allowed.extend(ids.into_iter().filter(|id| contacts_only.contains(id))),
                Err(e) => {
                    warn!(viewer = %viewer_id, error = %e, "Contact lookup failed, hiding statuses");
                }
            }
        }

        allowed
    }
}

/// Drop duplicate and empty ids, keeping first-occurrence order.
fn distinct(ids: &[AccountId]) -> Vec<AccountId> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
        .cloned()
        .collect()
}
