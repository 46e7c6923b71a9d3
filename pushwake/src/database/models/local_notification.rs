//! Local notification database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A scheduled-but-not-yet-fired local notification.
///
/// The database is the only authoritative copy; the in-memory scheduler only
/// keeps wake timers keyed by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PendingNotificationDbModel {
    pub request_id: i32,
    /// Unix epoch milliseconds at which the notification should fire
    pub trigger_at: i64,
    /// Opaque payload handed to the message dispatcher
    pub payload: Vec<u8>,
    pub created_at: i64,
}

impl PendingNotificationDbModel {
    pub fn new(request_id: i32, trigger_at: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            trigger_at,
            payload: payload.into(),
            created_at: crate::database::time::now_ms(),
        }
    }

    /// How long ago the notification should have fired, relative to `now_ms`.
    ///
    /// Negative when the trigger time is still in the future.
    pub fn overdue_by(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.trigger_at)
    }
}

/// A local notification that was actually displayed.
///
/// Kept so a later cancel-by-request-id can find and dismiss the system
/// notification. `seq` is the insertion order used for FIFO eviction.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ShownNotificationDbModel {
    pub seq: i64,
    pub request_id: i32,
    pub notification_id: i32,
    pub tag: String,
    pub shown_at: i64,
}
