//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::database::time::DAY_MS;
use crate::statistics::BackoffPolicy;
use crate::{Error, Result};

pub const ENV_CONFIG_PATH: &str = "PUSHWAKE_CONFIG";
pub const ENV_DATABASE_URL: &str = "PUSHWAKE_DATABASE_URL";
pub const ENV_LOG: &str = "PUSHWAKE_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushwakeConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Log filter directive; `RUST_LOG` still wins when set.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub log_json: bool,
    /// Number of shown-notification records kept.
    #[serde(default = "default_shown_history_capacity")]
    pub shown_history_capacity: usize,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Pending notifications overdue by at least this much are dropped.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: i64,
    /// Re-armed notifications fire no sooner than this after recovery.
    #[serde(default = "default_min_rearm_delay_ms")]
    pub min_rearm_delay_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Runs allowed per item before it is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound of the random delay added to a newly enqueued item.
    #[serde(default = "default_max_initial_jitter_ms")]
    pub max_initial_jitter_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A send that takes longer than this counts as RETRY.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_delivery_backoff")]
    pub delivery_backoff: BackoffPolicy,
    #[serde(default = "default_open_backoff")]
    pub open_backoff: BackoffPolicy,
}

fn default_database_url() -> String {
    "sqlite:pushwake.db?mode=rwc".to_string()
}

fn default_shown_history_capacity() -> usize {
    10
}

fn default_stale_after_ms() -> i64 {
    7 * DAY_MS
}

fn default_min_rearm_delay_ms() -> i64 {
    5_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_initial_jitter_ms() -> u64 {
    2_500
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_run_timeout_ms() -> u64 {
    60_000
}

fn default_delivery_backoff() -> BackoffPolicy {
    BackoffPolicy::linear(10_000)
}

fn default_open_backoff() -> BackoffPolicy {
    BackoffPolicy::exponential(30_000)
}

impl Default for PushwakeConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_filter: None,
            log_json: false,
            shown_history_capacity: default_shown_history_capacity(),
            recovery: RecoveryConfig::default(),
            statistics: StatisticsConfig::default(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: default_stale_after_ms(),
            min_rearm_delay_ms: default_min_rearm_delay_ms(),
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_initial_jitter_ms: default_max_initial_jitter_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            delivery_backoff: default_delivery_backoff(),
            open_backoff: default_open_backoff(),
        }
    }
}

impl PushwakeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Load from the environment, reading `.env` first if present.
    ///
    /// `PUSHWAKE_CONFIG` names a JSON file to start from; `PUSHWAKE_DATABASE_URL`
    /// and `PUSHWAKE_LOG` override single fields.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(ENV_CONFIG_PATH) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            config.database_url = url;
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
            config.log_filter = Some(filter);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        if self.shown_history_capacity == 0 {
            return Err(Error::config("shown_history_capacity must be at least 1"));
        }
        if self.recovery.stale_after_ms <= 0 {
            return Err(Error::config("recovery.stale_after_ms must be positive"));
        }
        if self.recovery.min_rearm_delay_ms < 0 {
            return Err(Error::config("recovery.min_rearm_delay_ms must not be negative"));
        }
        let stats = &self.statistics;
        if stats.max_attempts == 0 {
            return Err(Error::config("statistics.max_attempts must be at least 1"));
        }
        if stats.poll_interval_ms == 0 || stats.run_timeout_ms == 0 {
            return Err(Error::config(
                "statistics poll interval and run timeout must be positive",
            ));
        }
        for (name, policy) in [
            ("delivery_backoff", &stats.delivery_backoff),
            ("open_backoff", &stats.open_backoff),
        ] {
            if policy.initial_delay_ms == 0 || policy.max_delay_ms < policy.initial_delay_ms {
                return Err(Error::config(format!(
                    "statistics.{} needs 0 < initial_delay_ms <= max_delay_ms",
                    name
                )));
            }
        }
        Ok(())
    }
}
