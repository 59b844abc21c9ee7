//! Error types for refresh coordination

use std::time::Duration;

/// Outcome of a failed `acquire`.
///
/// `Clone` because one refresh failure is delivered to every waiter of the
/// cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// No refresh source configured, or no refresh token stored. Returned
    /// immediately without starting a cycle.
    #[error("refresh unavailable: {0}")]
    Unavailable(String),

    #[error("token refresh failed: {0}")]
    Failed(String),

    #[error("token refresh timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("token refresh cancelled")]
    Cancelled,

    #[error("credential store error: {0}")]
    Store(String),
}

impl RefreshError {
    /// Whether this error means no refresh was attempted.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RefreshError::Unavailable(_))
    }
}

/// Result alias for refresh operations.
pub type Result<T> = std::result::Result<T, RefreshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_seconds() {
        let err = RefreshError::TimedOut(Duration::from_secs(30));
        assert_eq!(err.to_string(), "token refresh timed out after 30s");
    }

    #[test]
    fn only_unavailable_is_unavailable() {
        assert!(RefreshError::Unavailable("no refresh token stored".into()).is_unavailable());
        assert!(!RefreshError::Failed("401".into()).is_unavailable());
        assert!(!RefreshError::Cancelled.is_unavailable());
    }
}
