//! Runtime tunables stored in the queue database.
//!
//! Values live in the `config` table so that every worker process sees an
//! operator's change on its next decision. Nothing here is cached: each typed
//! getter performs a fresh read.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::Database;

/// Shortest poll interval workers may be configured with.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A recognised configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    PollIntervalSec,
    TimeoutSeconds,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 4] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::PollIntervalSec,
        ConfigKey::TimeoutSeconds,
    ];

    /// Name accepted and printed by the CLI.
    pub fn cli_name(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max-retries",
            ConfigKey::BackoffBase => "backoff-base",
            ConfigKey::PollIntervalSec => "poll-interval-sec",
            ConfigKey::TimeoutSeconds => "timeout-seconds",
        }
    }

    /// Name of the row in the `config` table.
    pub fn storage_name(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::PollIntervalSec => "poll_interval_sec",
            ConfigKey::TimeoutSeconds => "timeout_seconds",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "3",
            ConfigKey::BackoffBase => "2",
            ConfigKey::PollIntervalSec => "1",
            ConfigKey::TimeoutSeconds => "10",
        }
    }

    /// Validates a raw value and returns its normalised text form.
    pub fn validate(&self, value: &str) -> Result<String, ConfigError> {
        let trimmed = value.trim();
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: self.cli_name().to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match self {
            ConfigKey::MaxRetries | ConfigKey::BackoffBase => {
                let n: u32 = trimmed
                    .parse()
                    .map_err(|_| invalid("expected a positive integer"))?;
                if n == 0 {
                    return Err(invalid("must be at least 1"));
                }
                Ok(n.to_string())
            }
            ConfigKey::TimeoutSeconds => {
                let n: u64 = trimmed
                    .parse()
                    .map_err(|_| invalid("expected a positive integer"))?;
                if n == 0 {
                    return Err(invalid("must be at least 1"));
                }
                Ok(n.to_string())
            }
            ConfigKey::PollIntervalSec => {
                let secs: f64 = trimmed
                    .parse()
                    .map_err(|_| invalid("expected a number of seconds"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(invalid("must be greater than 0"));
                }
                let interval =
                    Duration::try_from_secs_f64(secs).map_err(|_| invalid("out of range"))?;
                if interval < MIN_POLL_INTERVAL {
                    return Err(invalid("must be at least 0.001 seconds"));
                }
                Ok(secs.to_string())
            }
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.cli_name())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    /// Accepts both the dashed CLI name and the stored underscore name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.cli_name() == s || key.storage_name() == s)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

/// Handle on the durable config table.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    db: Database,
}

impl ConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Writes every default that has no stored value yet.
    pub async fn seed_defaults(&self) -> Result<(), ConfigError> {
        for key in ConfigKey::ALL {
            self.db
                .seed_config_value(key.storage_name(), key.default_value())
                .await?;
        }
        Ok(())
    }

    /// Returns the stored value, or the key's default when unset.
    pub async fn get(&self, key: ConfigKey) -> Result<String, ConfigError> {
        Ok(self
            .db
            .config_value(key.storage_name())
            .await?
            .unwrap_or_else(|| key.default_value().to_string()))
    }

    /// Returns every known key with its effective value.
    pub async fn get_all(&self) -> Result<Vec<(ConfigKey, String)>, ConfigError> {
        let stored = self.db.config_values().await?;

        Ok(ConfigKey::ALL
            .into_iter()
            .map(|key| {
                let value = stored
                    .iter()
                    .find(|(name, _)| name == key.storage_name())
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| key.default_value().to_string());
                (key, value)
            })
            .collect())
    }

    /// Validates and stores a value. Nothing is written if validation fails.
    pub async fn set(&self, key: ConfigKey, value: &str) -> Result<String, ConfigError> {
        let normalised = key.validate(value)?;
        self.db
            .set_config_value(key.storage_name(), &normalised)
            .await?;
        tracing::info!(key = %key, value = %normalised, "Config updated");
        Ok(normalised)
    }

    pub async fn max_retries(&self) -> Result<u32, ConfigError> {
        self.typed(ConfigKey::MaxRetries).await
    }

    pub async fn backoff_base(&self) -> Result<u32, ConfigError> {
        self.typed(ConfigKey::BackoffBase).await
    }

    pub async fn poll_interval(&self) -> Result<Duration, ConfigError> {
        let secs: f64 = self.typed(ConfigKey::PollIntervalSec).await?;
        Ok(Duration::from_secs_f64(secs))
    }

    pub async fn execution_timeout(&self) -> Result<Duration, ConfigError> {
        let secs: u64 = self.typed(ConfigKey::TimeoutSeconds).await?;
        Ok(Duration::from_secs(secs))
    }

    /// Reads a value, falling back to the default if the stored text is
    /// no longer valid (e.g. the table was edited by hand).
    async fn typed<T: FromStr>(&self, key: ConfigKey) -> Result<T, ConfigError> {
        let raw = self.get(key).await?;
        let parsed = key.validate(&raw).ok().and_then(|v| v.parse::<T>().ok());

        match parsed {
            Some(value) => Ok(value),
            None => {
                tracing::warn!(key = %key, value = %raw, "Stored config value is invalid, using default");
                key.default_value().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                    key: key.cli_name().to_string(),
                    value: key.default_value().to_string(),
                    reason: "default is not parseable".to_string(),
                })
            }
        }
    }
}
