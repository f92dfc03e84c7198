//! Presence change notifications.
//!
//! Notification is fire-and-forget: a sink that drops or fails to deliver a
//! change never affects presence state.

use crate::model::PresenceChange;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast capacity.
const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Receives presence transitions for client push.
pub trait PresenceNotifier: Send + Sync {
    /// Publish a change. Must not block.
    fn notify(&self, change: PresenceChange);
}

/// Discards every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl PresenceNotifier for NoopNotifier {
    fn notify(&self, _change: PresenceChange) {}
}

/// Fans changes out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Arc<PresenceChange>>,
}

impl BroadcastNotifier {
    /// Create a notifier with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFY_CAPACITY)
    }

    /// Create a notifier with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PresenceChange>> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceNotifier for BroadcastNotifier {
    fn notify(&self, change: PresenceChange) {
        trace!(account = %change.account_id, online = change.online, "Publishing presence change");
        // No receivers is not an error.
        let _ = self.sender.send(Arc::new(change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(online: bool) -> PresenceChange {
        PresenceChange {
            account_id: "alice".into(),
            online,
            last_online_at: Some(1),
            at: 2,
        }
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = BroadcastNotifier::new();
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.notify(change(true));
    }

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let notifier = BroadcastNotifier::with_capacity(8);
        let mut rx = notifier.subscribe();

        notifier.notify(change(false));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.account_id, "alice");
        assert!(!received.online);
    }
}
