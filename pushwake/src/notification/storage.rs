//! Durable store for local notifications.
//!
//! Every mutating call goes through one coarse lock scoped to this instance.
//! Storage faults are logged here and turned into sentinels; they never reach
//! the wake loop or the statistics runner.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::database::models::{PendingNotificationDbModel, ShownNotificationDbModel};
use crate::database::repositories::LocalNotificationRepository;
use crate::Result;

/// Id returned by [`LocalNotificationStorage::next_request_id`] when the counter
/// cannot be read or written.
///
/// This is also the first id the counter hands out, so repeated faults can
/// produce a duplicate id.
pub const FALLBACK_REQUEST_ID: i32 = 0;

/// Default number of shown-notification records kept.
pub const DEFAULT_SHOWN_HISTORY_CAPACITY: usize = 10;

pub struct LocalNotificationStorage {
    repo: Arc<dyn LocalNotificationRepository>,
    lock: Mutex<()>,
    shown_capacity: usize,
}

impl LocalNotificationStorage {
    pub fn new(repo: Arc<dyn LocalNotificationRepository>, shown_capacity: usize) -> Self {
        Self {
            repo,
            lock: Mutex::new(()),
            shown_capacity: shown_capacity.max(1),
        }
    }

    /// Allocate the next request id, falling back to [`FALLBACK_REQUEST_ID`].
    pub async fn next_request_id(&self) -> i32 {
        let _guard = self.lock.lock().await;
        match self.repo.next_request_id().await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to allocate request id, using fallback: {}", e);
                FALLBACK_REQUEST_ID
            }
        }
    }

    pub async fn save_pending(&self, notification: &PendingNotificationDbModel) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.repo.save_pending(notification).await
    }

    /// Remove and return the pending notification for `request_id`.
    pub async fn take_pending(&self, request_id: i32) -> Result<Option<PendingNotificationDbModel>> {
        let _guard = self.lock.lock().await;
        self.repo.take_pending(request_id).await
    }

    pub async fn get_pending(&self, request_id: i32) -> Result<Option<PendingNotificationDbModel>> {
        let _guard = self.lock.lock().await;
        self.repo.get_pending(request_id).await
    }

    pub async fn remove_pending(&self, request_id: i32) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.repo.remove_pending(request_id).await
    }

    pub async fn update_trigger(&self, request_id: i32, trigger_at: i64) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.repo.update_trigger(request_id, trigger_at).await
    }

    /// Ids of every pending notification. Empty when the store is unreadable.
    pub async fn get_pending_ids(&self) -> BTreeSet<i32> {
        let _guard = self.lock.lock().await;
        match self.repo.list_pending_ids().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!("Failed to read pending notification ids: {}", e);
                BTreeSet::new()
            }
        }
    }

    /// Snapshot every readable pending notification and hand each to `f`.
    ///
    /// The lock is released before `f` runs so the callback may call back into
    /// the store. Returns the number of rows visited.
    pub async fn enumerate_pending<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&PendingNotificationDbModel),
    {
        let snapshot = {
            let _guard = self.lock.lock().await;
            match self.repo.list_pending().await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Failed to enumerate pending notifications: {}", e);
                    return 0;
                }
            }
        };

        for notification in &snapshot {
            f(notification);
        }
        snapshot.len()
    }

    /// Readable pending notifications, or an error when the table cannot be read.
    pub async fn list_pending(&self) -> Result<Vec<PendingNotificationDbModel>> {
        let _guard = self.lock.lock().await;
        self.repo.list_pending().await
    }

    /// Record a displayed notification.
    ///
    /// A record displayed under the same `(notification_id, tag)` is superseded
    /// and removed first; the oldest records beyond capacity are then evicted.
    pub async fn record_shown(&self, request_id: i32, notification_id: i32, tag: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let superseded = self.repo.remove_shown_by_display(notification_id, tag).await?;
        let evicted = self
            .repo
            .add_shown(request_id, notification_id, tag, self.shown_capacity)
            .await?;
        debug!(
            request_id,
            notification_id, superseded, evicted, "Recorded shown notification"
        );
        Ok(())
    }

    pub async fn take_shown(&self, request_id: i32) -> Result<Option<ShownNotificationDbModel>> {
        let _guard = self.lock.lock().await;
        self.repo.take_shown(request_id).await
    }

    pub async fn list_shown(&self) -> Result<Vec<ShownNotificationDbModel>> {
        let _guard = self.lock.lock().await;
        self.repo.list_shown().await
    }

    pub async fn last_sent_hash(&self) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        self.repo.get_last_sent_hash().await
    }

    pub async fn set_last_sent_hash(&self, hash: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.repo.set_last_sent_hash(hash).await
    }

    pub fn shown_capacity(&self) -> usize {
        self.shown_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxLocalNotificationRepository;
    use crate::database::{DbPool, init_pool_with_size, run_migrations};

    async fn setup_storage() -> (DbPool, LocalNotificationStorage) {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqlxLocalNotificationRepository::new(pool.clone()));
        (pool, LocalNotificationStorage::new(repo, DEFAULT_SHOWN_HISTORY_CAPACITY))
    }

    #[tokio::test]
    async fn test_concurrent_allocation_never_repeats() {
        let (_pool, storage) = setup_storage().await;
        let storage = Arc::new(storage);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..5 {
                    ids.push(storage.next_request_id().await);
                }
                ids
            }));
        }

        let mut all = BTreeSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(all.insert(id), "id {} allocated twice", id);
            }
        }
        assert_eq!(all.len(), 40);
    }

    #[tokio::test]
    async fn test_storage_fault_degrades_to_sentinels() {
        let (pool, storage) = setup_storage().await;
        storage
            .save_pending(&PendingNotificationDbModel::new(5, 1, Vec::new()))
            .await
            .unwrap();
        pool.close().await;

        assert_eq!(storage.next_request_id().await, FALLBACK_REQUEST_ID);
        assert!(storage.get_pending_ids().await.is_empty());
        assert_eq!(storage.enumerate_pending(|_| {}).await, 0);
        assert!(storage.save_pending(&PendingNotificationDbModel::new(6, 1, Vec::new())).await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_id_collides_with_first_allocation() {
        // Known hazard: the fallback value equals the first real id.
        let (_pool, storage) = setup_storage().await;
        let first = storage.next_request_id().await;
        assert_eq!(first, FALLBACK_REQUEST_ID);
    }

    #[tokio::test]
    async fn test_enumerate_pending_visits_every_row() {
        let (_pool, storage) = setup_storage().await;
        for id in [3, 1, 2] {
            storage
                .save_pending(&PendingNotificationDbModel::new(id, 1_000 * id as i64, Vec::new()))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let visited = storage.enumerate_pending(|n| seen.push(n.request_id)).await;
        assert_eq!(visited, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(storage.get_pending_ids().await, BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_record_shown_supersedes_same_display() {
        let (_pool, storage) = setup_storage().await;
        storage.record_shown(1, 42, "news").await.unwrap();
        storage.record_shown(2, 42, "news").await.unwrap();
        storage.record_shown(3, 42, "other").await.unwrap();

        let shown = storage.list_shown().await.unwrap();
        let ids: Vec<i32> = shown.iter().map(|s| s.request_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_shown_history_cap() {
        let (_pool, storage) = setup_storage().await;
        for i in 0..11 {
            storage.record_shown(i, 1_000 + i, "").await.unwrap();
        }

        let shown = storage.list_shown().await.unwrap();
        assert_eq!(shown.len(), 10);
        assert_eq!(shown.first().unwrap().request_id, 1);
        assert!(storage.take_shown(0).await.unwrap().is_none());
    }
}
