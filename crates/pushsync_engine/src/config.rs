//! Client and retry configuration.

use rand::Rng;
use std::time::Duration;

/// Configuration for a sync context.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Application code sent with every request.
    pub application_code: String,
    /// Base URL of the Mobile API.
    pub base_url: String,
    /// Per-request timeout applied by the HTTP adapter.
    pub request_timeout: Duration,
    /// Size of the worker pool.
    pub max_concurrent_operations: usize,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// Retry backoff configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new configuration.
    pub fn new(application_code: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            application_code: application_code.into(),
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(30),
            max_concurrent_operations: 4,
            event_capacity: 256,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the worker pool size (at least one).
    pub fn with_max_concurrent_operations(mut self, workers: usize) -> Self {
        self.max_concurrent_operations = workers.max(1);
        self
    }

    /// Sets the event channel capacity (at least one).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "https://mobile.example.com")
    }
}

/// Backoff configuration for retried requests.
///
/// How many retries a request gets is decided by the request itself; this
/// only shapes the delay between attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries immediately, for tests.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier. Values below 1.0 (and NaN) become 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before retry number `retry` (1-based; 0 means no delay).
    ///
    /// A multiplier that yields no valid delay falls back to `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let secs = if self.add_jitter && delay_secs > 0.0 {
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = SyncConfig::new("app-code", "https://mobile.example.com")
            .with_timeout(Duration::from_secs(5))
            .with_max_concurrent_operations(0)
            .with_event_capacity(16);

        assert_eq!(config.application_code, "app-code");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_operations, 1);
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_operations, 4);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn backoff_grows_per_retry() {
        let config = RetryConfig::new(Duration::from_millis(100)).with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_retry(0), Duration::ZERO);

        let delay1 = config.delay_for_retry(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay3 = config.delay_for_retry(3);
        assert!(delay3 >= Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_retry(5), Duration::from_secs(5));
    }

    #[test]
    fn bad_multipliers_never_panic() {
        let clamped = RetryConfig::new(Duration::from_millis(100))
            .with_backoff_multiplier(-2.0)
            .with_jitter(false);
        assert_eq!(clamped.backoff_multiplier, 1.0);
        assert_eq!(clamped.delay_for_retry(2), Duration::from_millis(100));

        let mut raw = RetryConfig::new(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter(true);
        for multiplier in [-2.0, f64::NAN, f64::INFINITY] {
            raw.backoff_multiplier = multiplier;
            for retry in 1..5 {
                assert!(raw.delay_for_retry(retry) <= Duration::from_millis(3750));
            }
        }
        raw.backoff_multiplier = -2.0;
        raw.add_jitter = false;
        assert_eq!(raw.delay_for_retry(2), Duration::from_secs(3));
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(RetryConfig::immediate().delay_for_retry(3), Duration::ZERO);
    }
}
