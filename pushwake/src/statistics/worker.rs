//! Executes a single statistics work item.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{StatisticsSender, WorkResult, classify};
use crate::database::models::{StatisticsEventType, StatisticsWorkDbModel};
use crate::notification::LocalNotificationStorage;
use crate::readiness::ReadinessGate;

pub struct StatisticsWorker {
    gate: Arc<ReadinessGate>,
    sender: Arc<dyn StatisticsSender>,
    storage: Arc<LocalNotificationStorage>,
    max_attempts: u32,
}

impl StatisticsWorker {
    pub fn new(
        gate: Arc<ReadinessGate>,
        sender: Arc<dyn StatisticsSender>,
        storage: Arc<LocalNotificationStorage>,
        max_attempts: u32,
    ) -> Self {
        Self {
            gate,
            sender,
            storage,
            max_attempts,
        }
    }

    /// Run `item` once.
    ///
    /// `item.run_attempt_count` includes this run.
    pub async fn run_once(&self, item: &StatisticsWorkDbModel) -> WorkResult {
        if !self.gate.is_ready() {
            debug!(work_key = %item.work_key, "SDK not ready, retrying statistics later");
            return WorkResult::Retry;
        }

        let Some(event_type) = item.event_type() else {
            warn!(work_key = %item.work_key, event = %item.event_type, "Unknown statistics event type");
            return WorkResult::Failure;
        };
        if item.push_hash.is_empty() {
            warn!(work_key = %item.work_key, "Statistics work without push hash");
            return WorkResult::Failure;
        }

        let previous_runs = item.run_attempt_count.saturating_sub(1).max(0) as u32;
        if previous_runs >= self.max_attempts {
            info!(
                work_key = %item.work_key,
                attempts = previous_runs,
                "Statistics attempts exhausted, giving up"
            );
            return WorkResult::Failure;
        }

        let hash = item.push_hash.as_str();
        let metadata = item.metadata.as_deref();

        let result = match event_type {
            StatisticsEventType::Delivery => self.sender.send_delivered(hash, metadata).await,
            StatisticsEventType::Open => {
                if self.already_reported_open(hash).await {
                    debug!(work_key = %item.work_key, "Open already reported for this push");
                    return WorkResult::Success;
                }
                let result = self.sender.send_opened(hash, metadata).await;
                if result.is_ok()
                    && let Err(e) = self.storage.set_last_sent_hash(hash).await
                {
                    warn!(work_key = %item.work_key, "Failed to record last sent hash: {}", e);
                }
                result
            }
        };

        let outcome = classify(&result);
        match &result {
            Ok(()) => debug!(work_key = %item.work_key, "Statistics delivered"),
            Err(e) => info!(work_key = %item.work_key, %outcome, "Statistics send failed: {}", e),
        }
        outcome
    }

    async fn already_reported_open(&self, hash: &str) -> bool {
        match self.storage.last_sent_hash().await {
            Ok(last) => last.as_deref() == Some(hash),
            Err(e) => {
                warn!("Failed to read last sent hash: {}", e);
                false
            }
        }
    }
}
