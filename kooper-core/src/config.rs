//! Validated configuration of a reconciliation controller

use std::time::Duration;

use thiserror::Error;

/// Default interval between full resyncs of the informer cache.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(3 * 60);
/// Default number of retries for an item before it is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default number of workers processing items concurrently.
pub const DEFAULT_CONCURRENT_WORKERS: usize = 3;
/// Default delay before an item dequeued by a non-leader is handed back to the queue.
pub const DEFAULT_NOT_LEADER_REQUEUE: Duration = Duration::from_secs(1);

/// Invalid controller configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid controller config: {0}")]
pub struct ConfigError(String);

/// Fully validated configuration for a controller.
///
/// Construct an instance via [`ConfigBuilder::finish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config(ConfigBuilder);

impl Config {
    /// Start building a configuration for the controller called `name`
    #[must_use]
    pub fn builder(name: &str) -> ConfigBuilder {
        ConfigBuilder {
            name: name.into(),
            ..ConfigBuilder::default()
        }
    }

    /// Name of the controller, used in logs, spans and metrics
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Interval between full resyncs of the known objects
    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        self.0.resync_interval
    }

    /// Retries allowed for an item after its first failed attempt
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.0.max_retries
    }

    /// Number of concurrent workers, at least one
    #[must_use]
    pub fn concurrent_workers(&self) -> usize {
        self.0.concurrent_workers
    }

    /// Delay before an item dequeued while not leading is queued again
    #[must_use]
    pub fn not_leader_requeue(&self) -> Duration {
        self.0.not_leader_requeue
    }
}

/// Configuration of a controller before validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigBuilder {
    /// Name of the controller.
    pub name: String,
    /// Interval at which all known objects are queued again, healing missed watch events.
    ///
    /// Defaults to 3 minutes.
    pub resync_interval: Duration,
    /// Number of times a failing item is retried before it is dropped.
    ///
    /// An item is handled at most `max_retries + 1` times in a row without success. Defaults to 3.
    pub max_retries: u32,
    /// Number of workers handling items concurrently.
    ///
    /// Defaults to 3.
    pub concurrent_workers: usize,
    /// How long an item dequeued by a replica that is not the leader waits before it is queued
    /// again.
    ///
    /// Defaults to 1 second.
    pub not_leader_requeue: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            concurrent_workers: DEFAULT_CONCURRENT_WORKERS,
            not_leader_requeue: DEFAULT_NOT_LEADER_REQUEUE,
        }
    }
}

impl ConfigBuilder {
    /// Set the resync interval
    #[must_use]
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the retry budget per item
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the number of workers
    #[must_use]
    pub fn concurrent_workers(mut self, workers: usize) -> Self {
        self.concurrent_workers = workers;
        self
    }

    /// Set the requeue delay used while not leading
    #[must_use]
    pub fn not_leader_requeue(mut self, delay: Duration) -> Self {
        self.not_leader_requeue = delay;
        self
    }

    /// Finish building the controller config by validating this builder.
    ///
    /// # Errors
    /// Will return [`ConfigError`] if this member's fields are invalid according to the
    /// following constraints:
    /// - `name` must not be empty;
    /// - `concurrent_workers` must be at least 1;
    /// - `resync_interval` must not be zero;
    /// - `not_leader_requeue` must not be zero.
    pub fn finish(self) -> Result<Config, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError("name may not be empty".into()));
        }
        if self.concurrent_workers < 1 {
            return Err(ConfigError("concurrent_workers must be at least 1".into()));
        }
        if self.resync_interval.is_zero() {
            return Err(ConfigError("resync_interval must be greater than zero".into()));
        }
        if self.not_leader_requeue.is_zero() {
            return Err(ConfigError("not_leader_requeue must be greater than zero".into()));
        }
        Ok(Config(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::builder("ctrl").finish().unwrap();
        assert_eq!(config.name(), "ctrl");
        assert_eq!(config.resync_interval(), DEFAULT_RESYNC_INTERVAL);
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.concurrent_workers(), 3);
    }

    #[test]
    fn zero_retries_are_allowed() {
        let config = Config::builder("ctrl").max_retries(0).finish().unwrap();
        assert_eq!(config.max_retries(), 0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(ConfigBuilder::default().finish().is_err());
        assert!(Config::builder("ctrl").concurrent_workers(0).finish().is_err());
        assert!(Config::builder("ctrl").resync_interval(Duration::ZERO).finish().is_err());
        assert!(Config::builder("ctrl")
            .not_leader_requeue(Duration::ZERO)
            .finish()
            .is_err());
    }
}
