use serde::Deserialize;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_FETCH_LIMIT: &str = "RECONCILER_FETCH_LIMIT";
pub const ENV_MIN_POLL_AGE_SECS: &str = "RECONCILER_MIN_POLL_AGE_SECS";
pub const ENV_CYCLE_INTERVAL_MS: &str = "RECONCILER_CYCLE_INTERVAL_MS";
pub const ENV_MAX_CONCURRENCY: &str = "RECONCILER_MAX_CONCURRENCY";

/// Poller tuning. Every field has a default, so a partial JSON document is
/// accepted by [`PollerConfig::from_json`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Maximum messages selected per batch
    pub fetch_limit: usize,
    /// Minimum time since the last poll before a message is selected again
    #[serde(rename = "min_poll_age_secs", with = "duration_secs")]
    pub min_poll_age: Duration,
    /// Pause after a cycle that found nothing left to poll
    #[serde(rename = "cycle_interval_ms", with = "duration_millis")]
    pub cycle_interval: Duration,
    /// Reconciliations running at once inside one batch
    pub max_concurrent_reconciliations: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 100,
            min_poll_age: Duration::from_secs(30),
            cycle_interval: Duration::from_secs(5),
            max_concurrent_reconciliations: 16,
        }
    }
}

impl PollerConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_limit == 0 {
            return Err(ConfigError::Validation("fetch_limit must be > 0".into()));
        }
        if self.max_concurrent_reconciliations == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_reconciliations must be > 0".into(),
            ));
        }
        if self.cycle_interval.is_zero() {
            return Err(ConfigError::Validation("cycle_interval must be > 0".into()));
        }
        Ok(())
    }

    /// Override fields from `RECONCILER_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parse_override::<usize>(&lookup, ENV_FETCH_LIMIT) {
            self.fetch_limit = value;
        }
        if let Some(secs) = parse_override::<u64>(&lookup, ENV_MIN_POLL_AGE_SECS) {
            self.min_poll_age = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_override::<u64>(&lookup, ENV_CYCLE_INTERVAL_MS) {
            self.cycle_interval = Duration::from_millis(ms);
        }
        if let Some(value) = parse_override::<usize>(&lookup, ENV_MAX_CONCURRENCY) {
            self.max_concurrent_reconciliations = value;
        }
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
