//! Statistics work queue database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Push engagement event types reported to the backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StatisticsEventType {
    /// The push reached the device.
    Delivery,
    /// The user opened the push.
    Open,
}

impl StatisticsEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivery => "delivery",
            Self::Open => "open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delivery" => Some(Self::Delivery),
            "open" => Some(Self::Open),
            _ => None,
        }
    }

    /// Dedup key of the durable work item for this event and push.
    pub fn work_key(&self, push_hash: &str) -> String {
        format!("{}_{}", self.as_str(), push_hash)
    }
}

/// Lifecycle of a row in `statistics_work`.
///
/// Terminal outcomes delete the row, so only these two states are stored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    /// Waiting for `next_run_at`.
    Pending,
    /// Claimed by a runner.
    Running,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
        }
    }
}

/// A durable statistics work item.
///
/// `event_type` is kept as text: rows written by older builds or corrupted on
/// disk are rejected by the worker instead of failing to load.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StatisticsWorkDbModel {
    pub id: String,
    pub work_key: String,
    pub event_type: String,
    pub push_hash: String,
    pub metadata: Option<String>,
    pub status: String,
    /// Number of times a runner has started this item.
    pub run_attempt_count: i32,
    pub enqueued_at: i64,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl StatisticsWorkDbModel {
    pub fn new(
        event_type: StatisticsEventType,
        push_hash: impl Into<String>,
        metadata: Option<String>,
        next_run_at: i64,
    ) -> Self {
        let push_hash = push_hash.into();
        let now = crate::database::time::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            work_key: event_type.work_key(&push_hash),
            event_type: event_type.as_str().to_string(),
            push_hash,
            metadata,
            status: WorkStatus::Pending.as_str().to_string(),
            run_attempt_count: 0,
            enqueued_at: now,
            next_run_at,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn event_type(&self) -> Option<StatisticsEventType> {
        StatisticsEventType::parse(&self.event_type)
    }
}
