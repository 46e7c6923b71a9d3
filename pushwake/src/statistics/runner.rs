//! Host runtime for the statistics queue.
//!
//! Claims due items, runs them through the worker and applies the outcome:
//! SUCCESS and FAILURE delete the item, RETRY reschedules it with backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{StatisticsQueue, StatisticsWorker, WorkResult};
use crate::Result;
use crate::database::models::{StatisticsEventType, StatisticsWorkDbModel};
use crate::database::repositories::StatisticsQueueRepository;
use crate::database::time::{millis_until, now_ms};
use crate::readiness::{ReadinessGate, SdkState};

/// Lower bound between polls, so a storage fault cannot spin the loop.
const MIN_POLL_WAIT: Duration = Duration::from_millis(10);

pub struct StatisticsRunner {
    repo: Arc<dyn StatisticsQueueRepository>,
    queue: Arc<StatisticsQueue>,
    worker: Arc<StatisticsWorker>,
    gate: Arc<ReadinessGate>,
    notify: Arc<Notify>,
}

impl StatisticsRunner {
    pub fn new(
        repo: Arc<dyn StatisticsQueueRepository>,
        queue: Arc<StatisticsQueue>,
        worker: Arc<StatisticsWorker>,
        gate: Arc<ReadinessGate>,
    ) -> Self {
        let notify = queue.notifier();
        Self {
            repo,
            queue,
            worker,
            gate,
            notify,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Poll loop. Returns when cancelled or when the SDK failed to initialize.
    pub async fn run(&self, cancel: CancellationToken) {
        match self.repo.reset_running().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Reset interrupted statistics work"),
            Err(e) => warn!("Failed to reset interrupted statistics work: {}", e),
        }

        let state = tokio::select! {
            _ = cancel.cancelled() => return,
            state = self.gate.wait_settled() => state,
        };
        if state == SdkState::Error {
            warn!("SDK failed to initialize, statistics stay queued");
            return;
        }

        info!("Statistics runner started");
        let poll_interval = Duration::from_millis(self.queue.config().poll_interval_ms);
        loop {
            self.drain_due().await;

            let wait = match self.repo.next_due_at().await {
                Ok(Some(due)) => Duration::from_millis(millis_until(due, now_ms()))
                    .clamp(MIN_POLL_WAIT, poll_interval.max(MIN_POLL_WAIT)),
                Ok(None) => poll_interval,
                Err(e) => {
                    warn!("Failed to read next statistics due time: {}", e);
                    poll_interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Statistics runner stopped");
    }

    /// Run every item that is due now. Returns how many were processed.
    pub async fn drain_due(&self) -> usize {
        let mut processed = 0;
        loop {
            let item = match self.repo.claim_next_due(now_ms()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to claim statistics work: {}", e);
                    break;
                }
            };

            let outcome = self.execute(&item).await;
            if let Err(e) = self.apply_outcome(&item, outcome).await {
                error!(work_key = %item.work_key, "Failed to record statistics outcome: {}", e);
            }
            processed += 1;
        }
        processed
    }

    /// Run the worker in its own task; a panic or timeout counts as RETRY.
    async fn execute(&self, item: &StatisticsWorkDbModel) -> WorkResult {
        let timeout = Duration::from_millis(self.queue.config().run_timeout_ms);
        let worker = self.worker.clone();
        let owned = item.clone();
        let handle = tokio::spawn(async move { worker.run_once(&owned).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(work_key = %item.work_key, "Statistics worker crashed: {}", e);
                WorkResult::Retry
            }
            Err(_) => {
                abort.abort();
                warn!(work_key = %item.work_key, ?timeout, "Statistics worker timed out");
                WorkResult::Retry
            }
        }
    }

    async fn apply_outcome(&self, item: &StatisticsWorkDbModel, outcome: WorkResult) -> Result<()> {
        match outcome {
            WorkResult::Success | WorkResult::Failure => {
                debug!(work_key = %item.work_key, %outcome, "Statistics work finished");
                self.repo.delete(&item.id).await
            }
            WorkResult::Retry => {
                let policy = self
                    .queue
                    .backoff_for(item.event_type().unwrap_or(StatisticsEventType::Delivery));
                let delay = policy.delay_for_attempt(item.run_attempt_count.max(0) as u32);
                let next_run_at = now_ms().saturating_add(delay.as_millis() as i64);
                debug!(work_key = %item.work_key, delay_ms = delay.as_millis() as u64, "Retrying statistics work");
                self.repo
                    .reschedule(&item.id, next_run_at, Some("transient failure"))
                    .await
            }
        }
    }
}
