//! Durable, de-duplicating statistics queue.

use std::sync::Arc;

use rand::random;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::BackoffPolicy;
use crate::Result;
use crate::config::StatisticsConfig;
use crate::database::models::{StatisticsEventType, StatisticsWorkDbModel};
use crate::database::repositories::StatisticsQueueRepository;
use crate::database::time::now_ms;

pub struct StatisticsQueue {
    repo: Arc<dyn StatisticsQueueRepository>,
    config: StatisticsConfig,
    notify: Arc<Notify>,
}

impl StatisticsQueue {
    pub fn new(repo: Arc<dyn StatisticsQueueRepository>, config: StatisticsConfig) -> Self {
        Self {
            repo,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a new item is stored.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn initial_jitter_ms(&self) -> i64 {
        let max = self.config.max_initial_jitter_ms;
        if max == 0 {
            return 0;
        }
        (random::<u64>() % (max + 1)) as i64
    }

    /// Store a work item for `(event_type, push_hash)`.
    ///
    /// Returns `Ok(false)` when `push_hash` is empty or an item with the same
    /// key is already queued or running.
    pub async fn enqueue(
        &self,
        event_type: StatisticsEventType,
        push_hash: &str,
        metadata: Option<&str>,
    ) -> Result<bool> {
        if push_hash.is_empty() {
            return Ok(false);
        }

        let next_run_at = now_ms() + self.initial_jitter_ms();
        let item = StatisticsWorkDbModel::new(
            event_type,
            push_hash,
            metadata.map(str::to_string),
            next_run_at,
        );
        let inserted = self.repo.enqueue(&item).await?;
        if inserted {
            debug!(work_key = %item.work_key, next_run_at, "Enqueued statistics work");
            self.notify.notify_one();
        } else {
            debug!(work_key = %item.work_key, "Statistics work already queued, keeping existing");
        }
        Ok(inserted)
    }

    pub async fn schedule_delivery_event(&self, push_hash: &str, metadata: Option<&str>) -> bool {
        self.schedule(StatisticsEventType::Delivery, push_hash, metadata)
            .await
    }

    pub async fn schedule_open_event(&self, push_hash: &str, metadata: Option<&str>) -> bool {
        self.schedule(StatisticsEventType::Open, push_hash, metadata)
            .await
    }

    async fn schedule(
        &self,
        event_type: StatisticsEventType,
        push_hash: &str,
        metadata: Option<&str>,
    ) -> bool {
        if push_hash.is_empty() {
            warn!(event = %event_type, "Push hash is empty, skipping statistics");
            return false;
        }
        match self.enqueue(event_type, push_hash, metadata).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(event = %event_type, "Failed to enqueue statistics work: {}", e);
                false
            }
        }
    }

    /// Remove the queued item for `(event_type, push_hash)`, if any.
    pub async fn cancel(&self, event_type: StatisticsEventType, push_hash: &str) -> Result<bool> {
        self.repo.cancel(&event_type.work_key(push_hash)).await
    }

    pub fn backoff_for(&self, event_type: StatisticsEventType) -> &BackoffPolicy {
        match event_type {
            StatisticsEventType::Delivery => &self.config.delivery_backoff,
            StatisticsEventType::Open => &self.config.open_backoff,
        }
    }

    pub fn config(&self) -> &StatisticsConfig {
        &self.config
    }

    pub async fn count(&self) -> Result<i64> {
        self.repo.count().await
    }
}
