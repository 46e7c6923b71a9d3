//! Backoff policy value object for statistics retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows with the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `initial * attempts`
    Linear,
    /// `initial * 2^(attempts - 1)`
    Exponential,
}

/// Delay before a work item that returned RETRY runs again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_kind")]
    pub kind: BackoffKind,
    /// Delay after the first attempt in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_kind() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_initial_delay_ms() -> u64 {
    30_000
}

/// Five hours.
fn default_max_delay_ms() -> u64 {
    5 * 60 * 60 * 1000
}

impl BackoffPolicy {
    pub fn linear(initial_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Linear,
            initial_delay_ms,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn exponential(initial_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_delay_ms,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Delay after `attempts` runs (1-indexed; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay_ms = match self.kind {
            BackoffKind::Linear => self.initial_delay_ms.saturating_mul(attempts as u64),
            BackoffKind::Exponential => {
                let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
