use std::time::Duration;

use crate::errors::{NetworkErrorKind, ProviderError};

/// Exponential backoff: `base * 2^attempt`, attempt counted from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        error.is_transient() && attempt + 1 < self.max_attempts
    }
}

/// Map an upstream HTTP status plus response text into the error taxonomy.
/// 401 classification is the adapter's business (it depends on whether a
/// refresh was already attempted), so it maps to `TokenExpired` here.
pub fn classify_status(status: u16, message: impl Into<String>) -> ProviderError {
    let message = message.into();
    match status {
        401 => ProviderError::TokenExpired(message),
        403 => ProviderError::AuthFatal(message),
        429 => ProviderError::Throttled(message),
        500..=599 => ProviderError::UpstreamServer { status, message },
        _ => ProviderError::Other(format!("upstream {status}: {message}")),
    }
}

/// Map a transport error description onto the fixed set of retryable kinds.
pub fn classify_transport(message: &str) -> Option<NetworkErrorKind> {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("timed out") || lowered.contains("timeout") {
        Some(NetworkErrorKind::Timeout)
    } else if lowered.contains("reset") {
        Some(NetworkErrorKind::ConnectionReset)
    } else if lowered.contains("closed") || lowered.contains("broken pipe") {
        Some(NetworkErrorKind::ConnectionClosed)
    } else if lowered.contains("dns") || lowered.contains("resolve") {
        Some(NetworkErrorKind::Dns)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn only_transient_errors_retry_within_budget() {
        let policy = RetryPolicy::default();
        let throttled = ProviderError::Throttled("slow down".to_string());
        assert!(policy.should_retry(&throttled, 0));
        assert!(policy.should_retry(&throttled, 1));
        assert!(!policy.should_retry(&throttled, 2));

        let fatal = ProviderError::AuthFatal("forbidden".to_string());
        assert!(!policy.should_retry(&fatal, 0));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(429, "x"),
            ProviderError::Throttled(_)
        ));
        assert!(matches!(
            classify_status(503, "x"),
            ProviderError::UpstreamServer { status: 503, .. }
        ));
        assert!(matches!(
            classify_status(403, "x"),
            ProviderError::AuthFatal(_)
        ));
        assert!(matches!(
            classify_status(401, "x"),
            ProviderError::TokenExpired(_)
        ));
    }

    #[test]
    fn transport_classification_covers_known_kinds() {
        assert_eq!(
            classify_transport("connection reset by peer"),
            Some(NetworkErrorKind::ConnectionReset)
        );
        assert_eq!(
            classify_transport("operation timed out"),
            Some(NetworkErrorKind::Timeout)
        );
        assert_eq!(
            classify_transport("failed to resolve host"),
            Some(NetworkErrorKind::Dns)
        );
        assert_eq!(classify_transport("certificate invalid"), None);
    }
}
