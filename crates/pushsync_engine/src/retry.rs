//! Retry decisions for failed attempts.

use crate::config::RetryConfig;
use crate::error::{ErrorClass, SyncError};
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the same request again after `delay`.
    Retry {
        /// Backoff before the retry.
        delay: Duration,
    },
    /// Stop and surface the error.
    Fail,
}

/// Decides whether a failed attempt is retried.
///
/// | class     | decision                                  |
/// |-----------|-------------------------------------------|
/// | transient | retry with backoff while under the limit  |
/// | auth      | fail, dirty marks kept                    |
/// | malformed | fail                                      |
/// | cancelled | fail                                      |
/// | local     | fail                                      |
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy with the given backoff.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides after `retries_done` retries have already been spent out of
    /// `retry_limit`.
    pub fn decide(&self, error: &SyncError, retries_done: u32, retry_limit: u32) -> RetryDecision {
        match error.class() {
            ErrorClass::Transient if retries_done < retry_limit => RetryDecision::Retry {
                delay: self.config.delay_for_retry(retries_done + 1),
            },
            _ => RetryDecision::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::immediate())
    }

    #[test]
    fn transient_retries_until_limit() {
        let err = SyncError::TransientNetwork("reset".into());
        assert!(matches!(
            policy().decide(&err, 0, 3),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy().decide(&err, 2, 3),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(policy().decide(&err, 3, 3), RetryDecision::Fail);
    }

    #[test]
    fn zero_limit_never_retries() {
        assert_eq!(
            policy().decide(&SyncError::Timeout, 0, 0),
            RetryDecision::Fail
        );
    }

    #[test]
    fn terminal_classes_fail_immediately() {
        let errors = [
            SyncError::AuthOrRegistrationInvalid("401".into()),
            SyncError::MalformedResponse("bad".into()),
            SyncError::missing_identity("reg"),
            SyncError::Cancelled,
        ];
        for err in &errors {
            assert_eq!(policy().decide(err, 0, 3), RetryDecision::Fail);
        }
    }

    #[test]
    fn delay_grows() {
        let policy = RetryPolicy::new(
            RetryConfig::new(Duration::from_millis(10)).with_jitter(false),
        );
        let RetryDecision::Retry { delay: first } = policy.decide(&SyncError::Timeout, 0, 3) else {
            panic!("expected retry");
        };
        let RetryDecision::Retry { delay: third } = policy.decide(&SyncError::Timeout, 2, 3) else {
            panic!("expected retry");
        };
        assert_eq!(first, Duration::from_millis(10));
        assert_eq!(third, Duration::from_millis(40));
    }
}
