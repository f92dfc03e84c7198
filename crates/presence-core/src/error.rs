//! Error types for presence operations.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Presence errors.
///
/// Rate limiting and lock contention are expected outcomes and are reported
/// as values, not through this type.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The request was malformed and will not succeed on retry.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The shared presence store could not be reached or rejected the call.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The operation did not finish before its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An external visibility or contact lookup failed.
    #[error("Lookup failed: {0}")]
    Lookup(String),
}

impl PresenceError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, PresenceError::Validation(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for PresenceError {
    fn from(err: redis::RedisError) -> Self {
        PresenceError::StorageUnavailable(err.to_string())
    }
}

/// Run `fut` with a deadline, mapping expiry to [`PresenceError::Timeout`].
///
/// # Errors
///
/// Returns the future's own error, or `Timeout` if the deadline passes first.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, PresenceError>
where
    F: Future<Output = Result<T, PresenceError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(PresenceError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(!PresenceError::Validation("empty".into()).is_transient());
        assert!(PresenceError::StorageUnavailable("down".into()).is_transient());
        assert!(PresenceError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: Result<(), _> = with_deadline(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(PresenceError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok::<_, PresenceError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
