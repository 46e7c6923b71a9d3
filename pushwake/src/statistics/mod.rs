//! Push engagement statistics.
//!
//! Delivery and open events are persisted in a de-duplicating work queue and
//! sent at least once by the runner, with retries classified per outcome.

pub mod backoff;
pub mod queue;
pub mod runner;
pub mod worker;

pub use backoff::{BackoffKind, BackoffPolicy};
pub use queue::StatisticsQueue;
pub use runner::StatisticsRunner;
pub use worker::StatisticsWorker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of one run of a statistics work item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkResult {
    /// Delivered; the item is removed.
    Success,
    /// Transient problem; the item runs again after backoff.
    Retry,
    /// Permanent problem; the item is removed without retrying.
    Failure,
}

/// Error reported by a [`StatisticsSender`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The request did not produce an HTTP response. `code` 0 means no
    /// connectivity; other codes are treated like HTTP statuses.
    #[error("Connection error (code {code})")]
    Connection { code: u16 },

    #[error("HTTP error: status {0}")]
    Http(u16),

    #[error("Delivery error: {0}")]
    Other(String),
}

impl DeliveryError {
    pub fn classify(&self) -> WorkResult {
        match self {
            Self::Connection { code: 0 } => WorkResult::Retry,
            Self::Connection { code } | Self::Http(code) => classify_status(*code),
            Self::Other(_) => WorkResult::Failure,
        }
    }
}

fn classify_status(status: u16) -> WorkResult {
    match status {
        408 | 429 | 500..=599 => WorkResult::Retry,
        _ => WorkResult::Failure,
    }
}

/// Map a send result to a work result.
pub fn classify(result: &Result<(), DeliveryError>) -> WorkResult {
    match result {
        Ok(()) => WorkResult::Success,
        Err(e) => e.classify(),
    }
}

/// Sends statistics to the backend. Both calls are expected to be idempotent.
#[async_trait]
pub trait StatisticsSender: Send + Sync {
    async fn send_delivered(
        &self,
        push_hash: &str,
        metadata: Option<&str>,
    ) -> Result<(), DeliveryError>;

    async fn send_opened(&self, push_hash: &str, metadata: Option<&str>)
    -> Result<(), DeliveryError>;
}
