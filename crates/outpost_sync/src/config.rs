//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Portal base URL.
    pub portal_url: String,
    /// Maximum units drained per sync cycle.
    pub batch_size: usize,
    /// Timeout for one transfer to the Portal.
    pub transfer_timeout: Duration,
    /// Timeout for a reachability probe.
    pub probe_timeout: Duration,
    /// How long a cached probe result stays valid.
    pub probe_cache_ttl: Duration,
    /// How long a unit may sit in-flight before the recovery sweep
    /// reverts it to pending.
    pub in_flight_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(portal_url: impl Into<String>) -> Self {
        Self {
            portal_url: portal_url.into(),
            batch_size: 100,
            transfer_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            probe_cache_ttl: Duration::from_secs(5),
            in_flight_timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the transfer timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Sets the probe cache TTL.
    pub fn with_probe_cache_ttl(mut self, ttl: Duration) -> Self {
        self.probe_cache_ttl = ttl;
        self
    }

    /// Sets the in-flight recovery timeout.
    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout = timeout;
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
        Self::new("")
    }
}

/// Configuration for per-unit retry backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration with the given base delay.
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// A configuration with no backoff (units immediately eligible).
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Computes the delay before the next attempt, given how many
    /// attempts have already been made (1-indexed: after the first
    /// attempt pass 1).
    pub fn delay_after_attempts(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let delay = self.base_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
