//! Statistics work queue repository.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::database::models::{StatisticsWorkDbModel, WorkStatus};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{DbPool, begin_immediate};
use crate::Result;

/// Statistics queue repository trait.
#[async_trait]
pub trait StatisticsQueueRepository: Send + Sync {
    /// Insert `item` unless a row with the same work key exists.
    ///
    /// Returns `false` when the existing row was kept.
    async fn enqueue(&self, item: &StatisticsWorkDbModel) -> Result<bool>;
    async fn get_by_key(&self, work_key: &str) -> Result<Option<StatisticsWorkDbModel>>;
    /// Claim the oldest due PENDING item, marking it RUNNING and counting the attempt.
    async fn claim_next_due(&self, now_ms: i64) -> Result<Option<StatisticsWorkDbModel>>;
    async fn reschedule(&self, id: &str, next_run_at: i64, error: Option<&str>) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn cancel(&self, work_key: &str) -> Result<bool>;
    /// Put RUNNING items left behind by a dead process back to PENDING.
    async fn reset_running(&self) -> Result<u64>;
    async fn next_due_at(&self) -> Result<Option<i64>>;
    async fn count(&self) -> Result<i64>;
}

/// SQLx implementation of StatisticsQueueRepository.
pub struct SqlxStatisticsQueueRepository {
    pool: DbPool,
}

impl SqlxStatisticsQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn claim_in(
    conn: &mut SqliteConnection,
    now: i64,
) -> Result<Option<StatisticsWorkDbModel>> {
    let candidate = sqlx::query_as::<_, StatisticsWorkDbModel>(
        r#"
        SELECT * FROM statistics_work
        WHERE status = ? AND next_run_at <= ?
        ORDER BY next_run_at, enqueued_at
        LIMIT 1
        "#,
    )
    .bind(WorkStatus::Pending.as_str())
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut item) = candidate else {
        return Ok(None);
    };

    sqlx::query(
        r#"
        UPDATE statistics_work
        SET status = ?, run_attempt_count = run_attempt_count + 1, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(WorkStatus::Running.as_str())
    .bind(now)
    .bind(&item.id)
    .execute(&mut *conn)
    .await?;

    item.status = WorkStatus::Running.as_str().to_string();
    item.run_attempt_count += 1;
    item.updated_at = now;
    Ok(Some(item))
}

impl SqlxStatisticsQueueRepository {
    async fn claim_once(&self, now: i64) -> Result<Option<StatisticsWorkDbModel>> {
        let mut tx = begin_immediate(&self.pool).await?;
        match claim_in(&mut tx, now).await {
            Ok(item) => {
                tx.commit().await?;
                Ok(item)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StatisticsQueueRepository for SqlxStatisticsQueueRepository {
    async fn enqueue(&self, item: &StatisticsWorkDbModel) -> Result<bool> {
        retry_on_sqlite_busy("statistics_enqueue", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO statistics_work (
                    id, work_key, event_type, push_hash, metadata, status,
                    run_attempt_count, enqueued_at, next_run_at, last_error, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(work_key) DO NOTHING
                "#,
            )
            .bind(&item.id)
            .bind(&item.work_key)
            .bind(&item.event_type)
            .bind(&item.push_hash)
            .bind(&item.metadata)
            .bind(&item.status)
            .bind(item.run_attempt_count)
            .bind(item.enqueued_at)
            .bind(item.next_run_at)
            .bind(&item.last_error)
            .bind(item.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn get_by_key(&self, work_key: &str) -> Result<Option<StatisticsWorkDbModel>> {
        let item = sqlx::query_as::<_, StatisticsWorkDbModel>(
            "SELECT * FROM statistics_work WHERE work_key = ?",
        )
        .bind(work_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn claim_next_due(&self, now: i64) -> Result<Option<StatisticsWorkDbModel>> {
        retry_on_sqlite_busy("statistics_claim", || self.claim_once(now)).await
    }

    async fn reschedule(&self, id: &str, next_run_at: i64, error: Option<&str>) -> Result<()> {
        retry_on_sqlite_busy("statistics_reschedule", || async {
            sqlx::query(
                r#"
                UPDATE statistics_work
                SET status = ?, next_run_at = ?, last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(WorkStatus::Pending.as_str())
            .bind(next_run_at)
            .bind(error)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        retry_on_sqlite_busy("statistics_delete", || async {
            sqlx::query("DELETE FROM statistics_work WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn cancel(&self, work_key: &str) -> Result<bool> {
        retry_on_sqlite_busy("statistics_cancel", || async {
            let result = sqlx::query("DELETE FROM statistics_work WHERE work_key = ?")
                .bind(work_key)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn reset_running(&self) -> Result<u64> {
        retry_on_sqlite_busy("statistics_reset_running", || async {
            let result = sqlx::query(
                "UPDATE statistics_work SET status = ?, updated_at = ? WHERE status = ?",
            )
            .bind(WorkStatus::Pending.as_str())
            .bind(now_ms())
            .bind(WorkStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn next_due_at(&self) -> Result<Option<i64>> {
        let next = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(next_run_at) FROM statistics_work WHERE status = ?",
        )
        .bind(WorkStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM statistics_work")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
