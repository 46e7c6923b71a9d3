//! Re-arming pending notifications after a restart.
//!
//! Wake timers do not survive a reboot or process death. Every pending row
//! must be visited once: stale rows are dropped, the rest are pushed at least
//! a short delay into the future and re-armed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::wake::WakeTimer;
use crate::config::RecoveryConfig;
use crate::database::models::PendingNotificationDbModel;
use crate::database::time::now_ms;
use crate::notification::LocalNotificationStorage;
use crate::readiness::ReadinessGate;

/// Outcome of one recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub rearmed: usize,
    pub dropped_stale: usize,
    pub failed: usize,
}

pub struct RebootRecovery {
    storage: Arc<LocalNotificationStorage>,
    wake: Arc<dyn WakeTimer>,
    gate: Arc<ReadinessGate>,
    config: RecoveryConfig,
    rescheduled: AtomicBool,
}

impl RebootRecovery {
    pub fn new(
        storage: Arc<LocalNotificationStorage>,
        wake: Arc<dyn WakeTimer>,
        gate: Arc<ReadinessGate>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            storage,
            wake,
            gate,
            config,
            rescheduled: AtomicBool::new(false),
        }
    }

    /// Trigger time to re-arm with, or `None` if the notification is stale.
    pub fn recomputed_trigger(&self, original_trigger: i64, now: i64) -> Option<i64> {
        if now.saturating_sub(original_trigger) >= self.config.stale_after_ms {
            return None;
        }
        Some(
            now.saturating_add(self.config.min_rearm_delay_ms)
                .max(original_trigger),
        )
    }

    /// Visit every pending notification once, dropping or re-arming it.
    ///
    /// A failure on one row is counted and the pass continues.
    pub async fn recover_after_restart(&self, now: i64) -> RecoveryReport {
        let mut rows = Vec::new();
        self.storage
            .enumerate_pending(|n| rows.push(n.clone()))
            .await;

        let mut report = RecoveryReport::default();
        for row in &rows {
            self.recover_one(row, now, &mut report).await;
        }

        info!(
            rearmed = report.rearmed,
            dropped_stale = report.dropped_stale,
            failed = report.failed,
            "Pending notifications recovered"
        );
        report
    }

    async fn recover_one(
        &self,
        row: &PendingNotificationDbModel,
        now: i64,
        report: &mut RecoveryReport,
    ) {
        let request_id = row.request_id;

        let Some(trigger_at) = self.recomputed_trigger(row.trigger_at, now) else {
            self.wake.disarm(request_id);
            match self.storage.remove_pending(request_id).await {
                Ok(_) => {
                    debug!(request_id, overdue_ms = row.overdue_by(now), "Dropped stale notification");
                    report.dropped_stale += 1;
                }
                Err(e) => {
                    warn!(request_id, "Failed to drop stale notification: {}", e);
                    report.failed += 1;
                }
            }
            return;
        };

        match self.storage.update_trigger(request_id, trigger_at).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(request_id, "Notification fired or was cancelled during recovery");
                return;
            }
            Err(e) => {
                warn!(request_id, "Failed to update trigger time: {}", e);
                report.failed += 1;
                return;
            }
        }

        match self.wake.arm(request_id, trigger_at) {
            Ok(()) => report.rearmed += 1,
            Err(e) => {
                warn!(request_id, "Failed to re-arm notification: {}", e);
                report.failed += 1;
            }
        }
    }

    /// Run recovery once per process, after the SDK is ready.
    ///
    /// Returns `false` if recovery was already submitted.
    pub fn on_device_booted(self: &Arc<Self>) -> bool {
        if self.rescheduled.swap(true, Ordering::SeqCst) {
            info!("Pending notifications already rescheduled");
            return false;
        }

        let this = self.clone();
        self.gate.execute_or_queue(async move {
            this.recover_after_restart(now_ms()).await;
        })
    }
}
