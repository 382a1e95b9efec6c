//! Aggregate configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::DefaultRetry;

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable was set to something that does not parse.
    #[error("{key} must be a valid {expected}: {value:?}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Expected type, for the message.
        expected: &'static str,
        /// Raw value found.
        value: String,
    },

    /// The snapshot threshold must be at least one.
    #[error("snapshot threshold must be at least 1")]
    ZeroSnapshotThreshold,
}

/// Tunables of the aggregate command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Events after the latest snapshot before a new snapshot is written.
    pub snapshot_threshold: u64,
    /// Retries granted on concurrency conflicts.
    pub retry_limit: u32,
    /// Base back-off between retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// Upper bound of random jitter added to each back-off, in milliseconds.
    pub retry_jitter_ms: u64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 16,
            retry_limit: 8,
            retry_delay_ms: 10,
            retry_jitter_ms: 5,
        }
    }
}

impl AggregateConfig {
    /// Reads `STRATA_SNAPSHOT_THRESHOLD`, `STRATA_RETRY_LIMIT`,
    /// `STRATA_RETRY_DELAY_MS` and `STRATA_RETRY_JITTER_MS`, falling back to
    /// [`Default`] for unset variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a set variable does not parse or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            snapshot_threshold: parse(
                &lookup,
                "STRATA_SNAPSHOT_THRESHOLD",
                defaults.snapshot_threshold,
            )?,
            retry_limit: parse(&lookup, "STRATA_RETRY_LIMIT", defaults.retry_limit)?,
            retry_delay_ms: parse(&lookup, "STRATA_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            retry_jitter_ms: parse(&lookup, "STRATA_RETRY_JITTER_MS", defaults.retry_jitter_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::ZeroSnapshotThreshold` for a zero threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_threshold == 0 {
            return Err(ConfigError::ZeroSnapshotThreshold);
        }
        Ok(())
    }

    /// Builds the retry policy described by this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> DefaultRetry {
        DefaultRetry::new(
            self.retry_limit,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_jitter_ms),
        )
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            expected: std::any::type_name::<T>(),
            value,
        }),
    }
}
