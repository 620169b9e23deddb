//! Dispatch error taxonomy

use std::time::Duration;

use thiserror::Error;

use crate::domain::FailureKind;

/// Errors that can occur while dispatching a prompt to a provider
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Context overflow: {needed} tokens needed, window is {window}")]
    ContextOverflow { needed: u64, window: u64 },

    #[error("Provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    #[error("Provider rate limited{}", .retry_after.map(|d| format!(", retry after {:?}", d)).unwrap_or_default())]
    ProviderRateLimited { retry_after: Option<Duration> },

    #[error("Transient provider error {status}: {message}")]
    ProviderTransient { status: u16, message: String },

    #[error("Permanent provider error {status}: {message}")]
    ProviderPermanent { status: u16, message: String },

    #[error("Response invalid: {0}")]
    ResponseInvalid(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Transient errors are retried per the stage's policy; everything else
    /// aborts straight to escalation
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::ProviderTimeout(_)
                | DispatchError::ProviderRateLimited { .. }
                | DispatchError::ProviderTransient { .. }
                | DispatchError::Network(_)
        )
    }

    /// The machine-readable kind recorded on the failing stage
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::ContextOverflow { .. } => FailureKind::ContextOverflow,
            DispatchError::ProviderTimeout(_) => FailureKind::ProviderTimeout,
            DispatchError::ProviderRateLimited { .. } => FailureKind::ProviderRateLimited,
            DispatchError::ProviderTransient { .. } | DispatchError::Network(_) => FailureKind::ProviderTransient,
            DispatchError::ProviderPermanent { .. } => FailureKind::ProviderPermanent,
            DispatchError::ResponseInvalid(_) => FailureKind::ResponseInvalid,
            DispatchError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Suggested wait before the next attempt, for rate-limit responses
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::ProviderRateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Classify an HTTP status into transient/permanent/rate-limited
pub fn classify_status(status: u16, message: String, retry_after: Option<Duration>) -> DispatchError {
    match status {
        429 => DispatchError::ProviderRateLimited { retry_after },
        408 | 500 | 502 | 503 | 504 => DispatchError::ProviderTransient { status, message },
        _ => DispatchError::ProviderPermanent { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transience() {
        assert!(DispatchError::ProviderTimeout(Duration::from_secs(30)).is_transient());
        assert!(DispatchError::ProviderRateLimited { retry_after: None }.is_transient());
        assert!(
            DispatchError::ProviderTransient {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!DispatchError::ContextOverflow { needed: 1, window: 1 }.is_transient());
        assert!(
            !DispatchError::ProviderPermanent {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!DispatchError::ResponseInvalid("bad".to_string()).is_transient());
        assert!(!DispatchError::Cancelled.is_transient());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(429, String::new(), None),
            DispatchError::ProviderRateLimited { .. }
        ));
        assert!(matches!(
            classify_status(503, String::new(), None),
            DispatchError::ProviderTransient { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(400, String::new(), None),
            DispatchError::ProviderPermanent { status: 400, .. }
        ));
        assert!(matches!(
            classify_status(401, String::new(), None),
            DispatchError::ProviderPermanent { status: 401, .. }
        ));
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            DispatchError::ContextOverflow { needed: 10, window: 5 }.failure_kind(),
            FailureKind::ContextOverflow
        );
        assert_eq!(
            DispatchError::ResponseInvalid("x".to_string()).failure_kind(),
            FailureKind::ResponseInvalid
        );
        assert_eq!(DispatchError::Cancelled.failure_kind(), FailureKind::Cancelled);
    }
}
