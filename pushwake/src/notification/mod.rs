//! Local notification persistence and the presenter seam.

pub mod storage;

pub use storage::{DEFAULT_SHOWN_HISTORY_CAPACITY, FALLBACK_REQUEST_ID, LocalNotificationStorage};

use async_trait::async_trait;

use crate::Result;

/// Displays and dismisses system notifications.
///
/// Building the visual notification is outside this crate; the core only
/// needs to dismiss one that was already displayed.
#[async_trait]
pub trait NotificationPresenter: Send + Sync {
    async fn dismiss(&self, notification_id: i32, tag: &str) -> Result<()>;
}

/// Presenter that does nothing, for hosts without a notification surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPresenter;

#[async_trait]
impl NotificationPresenter for NoopPresenter {
    async fn dismiss(&self, _notification_id: i32, _tag: &str) -> Result<()> {
        Ok(())
    }
}
