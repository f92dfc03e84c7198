//! External collaborators consulted by snapshot queries.
//!
//! The account settings store (visibility preference) and the contact store
//! (audience membership) live outside this crate. They are reached through
//! two narrow capability traits.

use crate::error::PresenceError;
use crate::model::AccountId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Who may see an account's online status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Everyone,
    ContactsOnly,
    Nobody,
}

/// Source of each account's visibility preference.
#[async_trait]
pub trait VisibilityStore: Send + Sync {
    async fn online_status_visibility(&self, account_id: &str) -> Result<Visibility, PresenceError>;
}

/// Source of truth for contacts-only audiences.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// The subset of `candidate_ids` whose audience includes `viewer_id`.
    async fn contact_target_ids(
        &self,
        viewer_id: &str,
        candidate_ids: &[AccountId],
    ) -> Result<HashSet<AccountId>, PresenceError>;
}

/// In-memory visibility and contact directory.
///
/// Accounts without an explicit preference are visible to everyone.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    visibility: DashMap<AccountId, Visibility>,
    /// Target account -> accounts allowed to see it under `ContactsOnly`.
    audiences: DashMap<AccountId, HashSet<AccountId>>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visibility(&self, account_id: impl Into<AccountId>, visibility: Visibility) {
        self.visibility.insert(account_id.into(), visibility);
    }

    /// Let `viewer_id` see `target_id` under `ContactsOnly`.
    pub fn add_contact(&self, target_id: impl Into<AccountId>, viewer_id: impl Into<AccountId>) {
        self.audiences
            .entry(target_id.into())
            .or_default()
            .insert(viewer_id.into());
    }
}

#[async_trait]
impl VisibilityStore for InMemoryDirectory {
    async fn online_status_visibility(&self, account_id: &str) -> Result<Visibility, PresenceError> {
        Ok(self
            .visibility
            .get(account_id)
            .map(|v| *v.value())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ContactStore for InMemoryDirectory {
    async fn contact_target_ids(
        &self,
        viewer_id: &str,
        candidate_ids: &[AccountId],
    ) -> Result<HashSet<AccountId>, PresenceError> {
        Ok(candidate_ids
            .iter()
            .filter(|target| {
                self.audiences
                    .get(target.as_str())
                    .is_some_and(|audience| audience.contains(viewer_id))
            })
            .cloned()
            .collect())
    }
}
