// ABOUTME: Environment-first engine configuration with validation
// ABOUTME: Covers retry budgets, rate-limit defaults, refresh margin, and fan-out bounds
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Lattice Sync Contributors

use std::env;
use std::time::Duration;

use crate::errors::{EngineError, EngineResult};

/// Default deferred-retry delay when a provider gives no usable header.
pub const DEFAULT_RATE_LIMIT_DELAY_SECS: u64 = 60;

/// Default margin before token expiry at which the refresh runs.
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 1800;

/// Engine configuration.
///
/// Values come from the environment in deployments (`LATTICE_*` variables)
/// with code defaults suitable for most providers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connector source id, used as the event namespace (e.g. "gitlab")
    pub source: String,
    /// Cron expression for the periodic all-tenants sync trigger
    pub sync_cron: String,
    /// Ordinary retry budget per function invocation
    pub step_retries: u32,
    /// Deferred-retry delay when no usable rate-limit header is present
    pub default_rate_limit_delay: Duration,
    /// Cap on rate-limit deferrals per run, to avoid unbounded loops
    pub max_rate_limit_deferrals: u32,
    /// How long before token expiry the refresh wakes up
    pub refresh_margin: Duration,
    /// Concurrent account deactivations per tenant during delete fan-out
    pub delete_concurrency: usize,
}

impl EngineConfig {
    /// Create a configuration with defaults for the given connector source.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sync_cron: "0 0 * * *".into(),
            step_retries: 3,
            default_rate_limit_delay: Duration::from_secs(DEFAULT_RATE_LIMIT_DELAY_SECS),
            max_rate_limit_deferrals: 10,
            refresh_margin: Duration::from_secs(DEFAULT_REFRESH_MARGIN_SECS),
            delete_concurrency: 5,
        }
    }

    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `LATTICE_SYNC_CRON`, `LATTICE_STEP_RETRIES`,
    /// `LATTICE_RATE_LIMIT_DELAY_SECS`, `LATTICE_MAX_RATE_LIMIT_DEFERRALS`,
    /// `LATTICE_REFRESH_MARGIN_SECS`, `LATTICE_DELETE_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparseable, or if the
    /// resulting configuration fails validation.
    pub fn from_env(source: impl Into<String>) -> EngineResult<Self> {
        let mut config = Self::new(source);
        if let Ok(cron) = env::var("LATTICE_SYNC_CRON") {
            config.sync_cron = cron;
        }
        if let Some(v) = parse_env_u64("LATTICE_STEP_RETRIES")? {
            config.step_retries = u32::try_from(v)
                .map_err(|_| EngineError::config("LATTICE_STEP_RETRIES out of range"))?;
        }
        if let Some(v) = parse_env_u64("LATTICE_RATE_LIMIT_DELAY_SECS")? {
            config.default_rate_limit_delay = Duration::from_secs(v);
        }
        if let Some(v) = parse_env_u64("LATTICE_MAX_RATE_LIMIT_DEFERRALS")? {
            config.max_rate_limit_deferrals = u32::try_from(v)
                .map_err(|_| EngineError::config("LATTICE_MAX_RATE_LIMIT_DEFERRALS out of range"))?;
        }
        if let Some(v) = parse_env_u64("LATTICE_REFRESH_MARGIN_SECS")? {
            config.refresh_margin = Duration::from_secs(v);
        }
        if let Some(v) = parse_env_u64("LATTICE_DELETE_CONCURRENCY")? {
            config.delete_concurrency = usize::try_from(v)
                .map_err(|_| EngineError::config("LATTICE_DELETE_CONCURRENCY out of range"))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Configuration with short delays for tests.
    #[must_use]
    pub fn for_testing(source: impl Into<String>) -> Self {
        Self {
            step_retries: 2,
            default_rate_limit_delay: Duration::from_millis(50),
            max_rate_limit_deferrals: 3,
            refresh_margin: Duration::from_secs(1800),
            delete_concurrency: 2,
            ..Self::new(source)
        }
    }

    /// Validate invariants on the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a value is outside its allowed range.
    pub fn validate(&self) -> EngineResult<()> {
        if self.source.is_empty() {
            return Err(EngineError::config("source must not be empty"));
        }
        if self.default_rate_limit_delay.is_zero() {
            return Err(EngineError::config(
                "default_rate_limit_delay must be > 0",
            ));
        }
        if self.delete_concurrency == 0 || self.delete_concurrency > 10 {
            return Err(EngineError::config(
                "delete_concurrency must be in 1..=10",
            ));
        }
        if self.max_rate_limit_deferrals == 0 {
            return Err(EngineError::config(
                "max_rate_limit_deferrals must be > 0",
            ));
        }
        Ok(())
    }
}

fn parse_env_u64(name: &str) -> EngineResult<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| EngineError::config(format!("{name} is not a valid integer: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::new("gitlab");
        config.validate().unwrap();
        assert_eq!(config.default_rate_limit_delay, Duration::from_secs(60));
        assert_eq!(config.refresh_margin, Duration::from_secs(1800));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut config = EngineConfig::new("gitlab");
        config.delete_concurrency = 0;
        assert!(config.validate().is_err());

        config.delete_concurrency = 11;
        assert!(config.validate().is_err());

        config.delete_concurrency = 5;
        config.source = String::new();
        assert!(config.validate().is_err());
    }
}
