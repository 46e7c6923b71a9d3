//! Local notification repository.
//!
//! Pending notifications, shown-notification history, the request id counter
//! and the last sent statistics hash.

use async_trait::async_trait;
use sqlx::{FromRow, SqliteConnection};
use tracing::warn;

use crate::database::models::{PendingNotificationDbModel, ShownNotificationDbModel};
use crate::database::time::now_ms;
use crate::database::{DbPool, begin_immediate};
use crate::Result;

const LAST_SENT_HASH_KEY: &str = "last_sent_hash";

/// Local notification repository trait.
#[async_trait]
pub trait LocalNotificationRepository: Send + Sync {
    // Request ids
    async fn next_request_id(&self) -> Result<i32>;

    // Pending notifications
    async fn save_pending(&self, notification: &PendingNotificationDbModel) -> Result<()>;
    async fn get_pending(&self, request_id: i32) -> Result<Option<PendingNotificationDbModel>>;
    async fn take_pending(&self, request_id: i32) -> Result<Option<PendingNotificationDbModel>>;
    async fn remove_pending(&self, request_id: i32) -> Result<bool>;
    async fn update_trigger(&self, request_id: i32, trigger_at: i64) -> Result<bool>;
    async fn list_pending(&self) -> Result<Vec<PendingNotificationDbModel>>;
    async fn list_pending_ids(&self) -> Result<Vec<i32>>;

    // Shown notifications
    async fn add_shown(
        &self,
        request_id: i32,
        notification_id: i32,
        tag: &str,
        capacity: usize,
    ) -> Result<u64>;
    async fn remove_shown_by_display(&self, notification_id: i32, tag: &str) -> Result<u64>;
    async fn take_shown(&self, request_id: i32) -> Result<Option<ShownNotificationDbModel>>;
    async fn list_shown(&self) -> Result<Vec<ShownNotificationDbModel>>;

    // Last sent hash
    async fn get_last_sent_hash(&self) -> Result<Option<String>>;
    async fn set_last_sent_hash(&self, hash: &str) -> Result<()>;
}

/// SQLx implementation of LocalNotificationRepository.
pub struct SqlxLocalNotificationRepository {
    pool: DbPool,
}

impl SqlxLocalNotificationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Read the counter, store its successor and return the read value.
async fn allocate_id(conn: &mut SqliteConnection) -> Result<i32> {
    let current: Option<i32> =
        sqlx::query_scalar("SELECT next_value FROM request_id_counter WHERE id = 0")
            .fetch_optional(&mut *conn)
            .await?;
    let id = current.unwrap_or(0);
    // Wrap to 0 rather than going negative; -1 is the failure sentinel.
    let next = id.wrapping_add(1).max(0);

    sqlx::query(
        r#"
        INSERT INTO request_id_counter (id, next_value) VALUES (0, ?)
        ON CONFLICT(id) DO UPDATE SET next_value = excluded.next_value
        "#,
    )
    .bind(next)
    .execute(&mut *conn)
    .await?;

    Ok(id)
}

async fn insert_shown(
    conn: &mut SqliteConnection,
    request_id: i32,
    notification_id: i32,
    tag: &str,
    capacity: usize,
) -> Result<u64> {
    sqlx::query("DELETE FROM shown_notification WHERE request_id = ?")
        .bind(request_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO shown_notification (request_id, notification_id, tag, shown_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(request_id)
    .bind(notification_id)
    .bind(tag)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shown_notification")
        .fetch_one(&mut *conn)
        .await?;
    let excess = count - capacity as i64;
    if excess <= 0 {
        return Ok(0);
    }

    let evicted = sqlx::query(
        r#"
        DELETE FROM shown_notification WHERE seq IN (
            SELECT seq FROM shown_notification ORDER BY seq ASC LIMIT ?
        )
        "#,
    )
    .bind(excess)
    .execute(&mut *conn)
    .await?;

    Ok(evicted.rows_affected())
}

#[async_trait]
impl LocalNotificationRepository for SqlxLocalNotificationRepository {
    async fn next_request_id(&self) -> Result<i32> {
        let mut tx = begin_immediate(&self.pool).await?;
        match allocate_id(&mut tx).await {
            Ok(id) => {
                tx.commit().await?;
                Ok(id)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn save_pending(&self, notification: &PendingNotificationDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_notification (request_id, trigger_at, payload, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(request_id) DO UPDATE SET
                trigger_at = excluded.trigger_at,
                payload = excluded.payload,
                created_at = excluded.created_at
            "#,
        )
        .bind(notification.request_id)
        .bind(notification.trigger_at)
        .bind(&notification.payload)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pending(&self, request_id: i32) -> Result<Option<PendingNotificationDbModel>> {
        let row = sqlx::query_as::<_, PendingNotificationDbModel>(
            "SELECT * FROM pending_notification WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn take_pending(&self, request_id: i32) -> Result<Option<PendingNotificationDbModel>> {
        // Single statement: two concurrent takers cannot both see the row.
        let row = sqlx::query_as::<_, PendingNotificationDbModel>(
            r#"
            DELETE FROM pending_notification WHERE request_id = ?
            RETURNING request_id, trigger_at, payload, created_at
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn remove_pending(&self, request_id: i32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_notification WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_trigger(&self, request_id: i32, trigger_at: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE pending_notification SET trigger_at = ? WHERE request_id = ?")
                .bind(trigger_at)
                .bind(request_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self) -> Result<Vec<PendingNotificationDbModel>> {
        let rows = sqlx::query("SELECT * FROM pending_notification ORDER BY trigger_at, request_id")
            .fetch_all(&self.pool)
            .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match PendingNotificationDbModel::from_row(row) {
                Ok(model) => pending.push(model),
                Err(e) => warn!(row = index, "Skipping unreadable pending notification: {}", e),
            }
        }
        Ok(pending)
    }

    async fn list_pending_ids(&self) -> Result<Vec<i32>> {
        let ids = sqlx::query_scalar::<_, i32>(
            "SELECT request_id FROM pending_notification ORDER BY request_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn add_shown(
        &self,
        request_id: i32,
        notification_id: i32,
        tag: &str,
        capacity: usize,
    ) -> Result<u64> {
        let mut tx = begin_immediate(&self.pool).await?;
        match insert_shown(&mut tx, request_id, notification_id, tag, capacity).await {
            Ok(evicted) => {
                tx.commit().await?;
                Ok(evicted)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn remove_shown_by_display(&self, notification_id: i32, tag: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM shown_notification WHERE notification_id = ? AND tag = ?")
                .bind(notification_id)
                .bind(tag)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn take_shown(&self, request_id: i32) -> Result<Option<ShownNotificationDbModel>> {
        let row = sqlx::query_as::<_, ShownNotificationDbModel>(
            r#"
            DELETE FROM shown_notification WHERE request_id = ?
            RETURNING seq, request_id, notification_id, tag, shown_at
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_shown(&self) -> Result<Vec<ShownNotificationDbModel>> {
        let rows = sqlx::query_as::<_, ShownNotificationDbModel>(
            "SELECT * FROM shown_notification ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_last_sent_hash(&self) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM notification_prefs WHERE key = ?",
        )
        .bind(LAST_SENT_HASH_KEY)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set_last_sent_hash(&self, hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_prefs (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(LAST_SENT_HASH_KEY)
        .bind(hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool_with_size, run_migrations};

    async fn setup_repo() -> SqlxLocalNotificationRepository {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqlxLocalNotificationRepository::new(pool)
    }

    #[tokio::test]
    async fn test_next_request_id_is_monotonic() {
        let repo = setup_repo().await;
        assert_eq!(repo.next_request_id().await.unwrap(), 0);
        assert_eq!(repo.next_request_id().await.unwrap(), 1);
        assert_eq!(repo.next_request_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_take_pending_removes_row_once() {
        let repo = setup_repo().await;
        repo.save_pending(&PendingNotificationDbModel::new(7, 1_000, b"hello".to_vec()))
            .await
            .unwrap();

        let taken = repo.take_pending(7).await.unwrap().unwrap();
        assert_eq!(taken.payload, b"hello".to_vec());
        assert!(repo.take_pending(7).await.unwrap().is_none());
        assert!(repo.list_pending_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_pending_overwrites_existing() {
        let repo = setup_repo().await;
        repo.save_pending(&PendingNotificationDbModel::new(1, 1_000, b"a".to_vec()))
            .await
            .unwrap();
        repo.save_pending(&PendingNotificationDbModel::new(1, 2_000, b"b".to_vec()))
            .await
            .unwrap();

        let pending = repo.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trigger_at, 2_000);
        assert_eq!(pending[0].payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_update_trigger() {
        let repo = setup_repo().await;
        repo.save_pending(&PendingNotificationDbModel::new(3, 1_000, Vec::new()))
            .await
            .unwrap();

        assert!(repo.update_trigger(3, 9_000).await.unwrap());
        assert!(!repo.update_trigger(4, 9_000).await.unwrap());
        assert_eq!(repo.get_pending(3).await.unwrap().unwrap().trigger_at, 9_000);
    }

    #[tokio::test]
    async fn test_add_shown_evicts_oldest_insertion() {
        let repo = setup_repo().await;
        for i in 0..10 {
            assert_eq!(repo.add_shown(i, 100 + i, "", 10).await.unwrap(), 0);
        }

        let evicted = repo.add_shown(10, 110, "", 10).await.unwrap();
        assert_eq!(evicted, 1);

        let shown = repo.list_shown().await.unwrap();
        assert_eq!(shown.len(), 10);
        assert!(shown.iter().all(|s| s.request_id != 0));
        assert_eq!(shown.last().unwrap().request_id, 10);
    }

    #[tokio::test]
    async fn test_reinserted_shown_record_counts_as_newest() {
        let repo = setup_repo().await;
        for i in 0..3 {
            repo.add_shown(i, i, "", 3).await.unwrap();
        }
        // Re-show request 0; request 1 becomes the oldest.
        repo.add_shown(0, 0, "", 3).await.unwrap();
        repo.add_shown(3, 3, "", 3).await.unwrap();

        let ids: Vec<i32> = repo
            .list_shown()
            .await
            .unwrap()
            .iter()
            .map(|s| s.request_id)
            .collect();
        assert_eq!(ids, vec![2, 0, 3]);
    }

    #[tokio::test]
    async fn test_take_shown_and_remove_by_display() {
        let repo = setup_repo().await;
        repo.add_shown(1, 50, "promo", 10).await.unwrap();
        repo.add_shown(2, 51, "", 10).await.unwrap();

        assert_eq!(repo.remove_shown_by_display(50, "promo").await.unwrap(), 1);
        assert!(repo.take_shown(1).await.unwrap().is_none());

        let record = repo.take_shown(2).await.unwrap().unwrap();
        assert_eq!(record.notification_id, 51);
        assert!(repo.list_shown().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_sent_hash() {
        let repo = setup_repo().await;
        assert!(repo.get_last_sent_hash().await.unwrap().is_none());

        repo.set_last_sent_hash("abc").await.unwrap();
        repo.set_last_sent_hash("def").await.unwrap();
        assert_eq!(repo.get_last_sent_hash().await.unwrap().as_deref(), Some("def"));
    }
}
