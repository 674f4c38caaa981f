//! Queue configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::store::{DequeuePolicy, StoreOptions};
use crate::workers::{ResetterConfig, WorkerConfig};

pub const POLL_INTERVAL_MS: &str = "DBWORKER_POLL_INTERVAL_MS";
pub const STALL_THRESHOLD_SECS: &str = "DBWORKER_STALL_THRESHOLD_SECS";
pub const RESET_INTERVAL_SECS: &str = "DBWORKER_RESET_INTERVAL_SECS";
pub const MAX_NUM_RESETS: &str = "DBWORKER_MAX_NUM_RESETS";
pub const DEQUEUE_ATTEMPTS: &str = "DBWORKER_DEQUEUE_ATTEMPTS";
pub const NAME: &str = "DBWORKER_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: String, value: String },
}

/// Settings shared by the worker, resetter and store of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub poll_interval: Duration,
    pub stall_threshold: Duration,
    pub reset_interval: Duration,
    pub max_num_resets: u32,
    pub dequeue_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "dbworker".to_string(),
            poll_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(5),
            reset_interval: Duration::from_secs(30),
            max_num_resets: 3,
            dequeue_attempts: 5,
        }
    }
}

impl QueueConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_reset_interval(mut self, interval: Duration) -> Self {
        self.reset_interval = interval;
        self
    }

    pub fn with_max_num_resets(mut self, max: u32) -> Self {
        self.max_num_resets = max;
        self
    }

    pub fn with_dequeue_attempts(mut self, attempts: u32) -> Self {
        self.dequeue_attempts = attempts;
        self
    }

    /// Defaults overridden by `DBWORKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup(NAME).filter(|n| !n.trim().is_empty()) {
            config.name = name;
        }
        if let Some(ms) = parse::<u64>(&lookup, POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, STALL_THRESHOLD_SECS)? {
            config.stall_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, RESET_INTERVAL_SECS)? {
            config.reset_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse::<u32>(&lookup, MAX_NUM_RESETS)? {
            config.max_num_resets = max;
        }
        if let Some(attempts) = parse::<u32>(&lookup, DEQUEUE_ATTEMPTS)? {
            if attempts == 0 {
                return Err(invalid(DEQUEUE_ATTEMPTS, "0"));
            }
            config.dequeue_attempts = attempts;
        }
        if config.poll_interval.is_zero() {
            return Err(invalid(POLL_INTERVAL_MS, "0"));
        }
        if config.reset_interval.is_zero() {
            return Err(invalid(RESET_INTERVAL_SECS, "0"));
        }

        debug!(?config, "loaded queue configuration");
        Ok(config)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::default()
            .with_max_num_resets(self.max_num_resets)
            .with_dequeue_policy(DequeuePolicy::default().with_max_attempts(self.dequeue_attempts))
    }

    /// Resetter settings for `queue`.
    pub fn resetter_config(&self, queue: &str) -> ResetterConfig {
        ResetterConfig::default()
            .with_name(format!("{}.{}.resetter", self.name, queue))
            .with_interval(self.reset_interval)
            .with_stall_threshold(self.stall_threshold)
    }

    /// Worker settings for `queue`.
    pub fn worker_config(&self, queue: &str) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(format!("{}.{}.worker", self.name, queue))
            .with_poll_interval(self.poll_interval)
    }
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(var, &raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[
            (NAME, "precise-code-intel"),
            (POLL_INTERVAL_MS, "250"),
            (STALL_THRESHOLD_SECS, " 10 "),
            (RESET_INTERVAL_SECS, "60"),
            (MAX_NUM_RESETS, "0"),
            (DEQUEUE_ATTEMPTS, "2"),
        ]))
        .unwrap();

        assert_eq!(config.name, "precise-code-intel");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.stall_threshold, Duration::from_secs(10));
        assert_eq!(config.reset_interval, Duration::from_secs(60));
        assert_eq!(config.max_num_resets, 0);
        assert_eq!(config.store_options().dequeue.max_attempts(), 2);
        assert_eq!(
            config.resetter_config("uploads").name,
            "precise-code-intel.uploads.resetter"
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = QueueConfig::from_lookup(lookup(&[(POLL_INTERVAL_MS, "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: POLL_INTERVAL_MS.to_string(),
                value: "soon".to_string(),
            }
        );

        assert!(QueueConfig::from_lookup(lookup(&[(DEQUEUE_ATTEMPTS, "0")])).is_err());
        assert!(QueueConfig::from_lookup(lookup(&[(RESET_INTERVAL_SECS, "0")])).is_err());
        assert!(QueueConfig::from_lookup(lookup(&[(MAX_NUM_RESETS, "-1")])).is_err());
    }

    #[test]
    fn derived_settings_follow_config() {
        let config = QueueConfig::default()
            .with_name("executor")
            .with_poll_interval(Duration::from_millis(50))
            .with_max_num_resets(7);

        assert_eq!(config.store_options().max_num_resets, 7);
        let worker = config.worker_config("indexes");
        assert_eq!(worker.name, "executor.indexes.worker");
        assert_eq!(worker.poll_interval, Duration::from_millis(50));
    }
}
