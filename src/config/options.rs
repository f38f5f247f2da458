use crate::core::{FeedError, Result};
use std::time::Duration;

pub const DEFAULT_LEASE_PREFIX: &str = "cfp-app";

/// Tuning knobs of a change-feed processor
///
/// Defaults follow the usual managed change-feed processor settings:
/// a 60 s lease TTL renewed every 17 s, a 13 s acquisition round and a
/// 100 ms poll delay when a partition has nothing new.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Delay between polls of a partition that returned no changes
    pub feed_poll_delay: Duration,

    /// A lease not renewed for this long may be taken over by another host
    pub lease_ttl: Duration,

    /// How often owned leases are renewed
    pub lease_renew_interval: Duration,

    /// How often partitions are discovered and ownership rebalanced
    pub lease_acquire_interval: Duration,

    /// Upper bound on records per delivered batch
    pub max_items_per_batch: usize,

    /// New leases start at the beginning of the partition instead of its end
    pub start_from_beginning: bool,

    /// Namespace for lease records shared in one lease container
    pub lease_prefix: String,

    /// First delay after a transient read failure
    pub retry_initial_backoff: Duration,

    /// Cap for the exponential read backoff
    pub retry_max_backoff: Duration,
}

impl ProcessorOptions {
    pub fn new() -> Self {
        Self {
            feed_poll_delay: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            max_items_per_batch: 100,
            start_from_beginning: true,
            lease_prefix: DEFAULT_LEASE_PREFIX.to_string(),
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(5),
        }
    }

    /// Set the delay between empty polls
    pub fn feed_poll_delay(mut self, delay: Duration) -> Self {
        self.feed_poll_delay = delay;
        self
    }

    /// Set the lease TTL
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the lease renewal interval
    pub fn lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    /// Set the lease acquisition / rebalancing interval
    pub fn lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.lease_acquire_interval = interval;
        self
    }

    /// Set the maximum batch size
    pub fn max_items_per_batch(mut self, max: usize) -> Self {
        self.max_items_per_batch = max;
        self
    }

    /// Choose where brand new leases start reading
    pub fn start_from_beginning(mut self, from_beginning: bool) -> Self {
        self.start_from_beginning = from_beginning;
        self
    }

    /// Set the lease prefix
    pub fn lease_prefix(mut self, prefix: &str) -> Self {
        self.lease_prefix = prefix.to_string();
        self
    }

    /// Set the read retry backoff bounds
    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self.retry_max_backoff = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.feed_poll_delay.is_zero() {
            return Err(FeedError::Config("feed_poll_delay must be > 0".to_string()));
        }

        if self.lease_ttl.is_zero() {
            return Err(FeedError::Config("lease_ttl must be > 0".to_string()));
        }

        if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_ttl {
            return Err(FeedError::Config(
                "lease_renew_interval must be > 0 and shorter than lease_ttl".to_string(),
            ));
        }

        if self.lease_acquire_interval.is_zero() {
            return Err(FeedError::Config(
                "lease_acquire_interval must be > 0".to_string(),
            ));
        }

        if self.max_items_per_batch == 0 {
            return Err(FeedError::Config(
                "max_items_per_batch must be > 0".to_string(),
            ));
        }

        if self.lease_prefix.trim().is_empty() {
            return Err(FeedError::Config("lease_prefix cannot be empty".to_string()));
        }

        if self.retry_initial_backoff.is_zero()
            || self.retry_initial_backoff > self.retry_max_backoff
        {
            return Err(FeedError::Config(
                "retry_initial_backoff must be > 0 and not exceed retry_max_backoff".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ProcessorOptions::default();
        assert_eq!(options.feed_poll_delay, Duration::from_millis(100));
        assert_eq!(options.lease_prefix, DEFAULT_LEASE_PREFIX);
        assert!(options.start_from_beginning);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let options = ProcessorOptions::new()
            .feed_poll_delay(Duration::from_millis(250))
            .lease_ttl(Duration::from_secs(10))
            .lease_renew_interval(Duration::from_secs(3))
            .max_items_per_batch(5)
            .start_from_beginning(false)
            .lease_prefix("orders");

        assert_eq!(options.feed_poll_delay, Duration::from_millis(250));
        assert_eq!(options.lease_ttl, Duration::from_secs(10));
        assert_eq!(options.max_items_per_batch, 5);
        assert!(!options.start_from_beginning);
        assert_eq!(options.lease_prefix, "orders");
    }

    #[test]
    fn test_validate() {
        let renew_too_slow = ProcessorOptions::new()
            .lease_ttl(Duration::from_secs(5))
            .lease_renew_interval(Duration::from_secs(5));
        assert!(renew_too_slow.validate().is_err());

        let empty_batch = ProcessorOptions::new().max_items_per_batch(0);
        assert!(empty_batch.validate().is_err());

        let blank_prefix = ProcessorOptions::new().lease_prefix("  ");
        assert!(blank_prefix.validate().is_err());

        let inverted_backoff = ProcessorOptions::new()
            .retry_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(inverted_backoff.validate().is_err());
    }
}
