//! Service container for dependency injection.
//!
//! Builds every service from a [`PushwakeConfig`] plus the host-provided
//! collaborators, starts the background loops and stops them on shutdown.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::alarm::{
    AlarmScheduler, LocalNotificationRequest, MessageDispatcher, RebootRecovery, TokioWakeTimer,
};
use crate::config::PushwakeConfig;
use crate::database::repositories::{
    SqlxLocalNotificationRepository, SqlxStatisticsQueueRepository,
};
use crate::database::{self, DbPool};
use crate::notification::{LocalNotificationStorage, NotificationPresenter};
use crate::readiness::{InitBarrier, Prerequisite, ReadinessGate, SdkState};
use crate::statistics::{StatisticsQueue, StatisticsRunner, StatisticsSender, StatisticsWorker};

/// Time allowed for background loops to stop.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators supplied by the embedding host.
pub struct Collaborators {
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub presenter: Arc<dyn NotificationPresenter>,
    pub sender: Arc<dyn StatisticsSender>,
}

/// Service container holding all pushwake services.
pub struct ServiceContainer {
    pub pool: DbPool,
    pub config: PushwakeConfig,
    pub storage: Arc<LocalNotificationStorage>,
    pub gate: Arc<ReadinessGate>,
    pub barrier: Arc<InitBarrier>,
    pub wake: Arc<TokioWakeTimer>,
    pub scheduler: Arc<AlarmScheduler>,
    pub recovery: Arc<RebootRecovery>,
    pub statistics: Arc<StatisticsQueue>,
    pub runner: Arc<StatisticsRunner>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Open the database from `config.database_url` and build the container.
    pub async fn new(config: PushwakeConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let pool = database::init_pool(&config.database_url).await?;
        Self::with_pool(pool, config, collaborators).await
    }

    /// Build the container on an existing pool. Runs migrations.
    pub async fn with_pool(
        pool: DbPool,
        config: PushwakeConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        info!("Initializing service container");
        database::run_migrations(&pool).await?;

        let notification_repo = Arc::new(SqlxLocalNotificationRepository::new(pool.clone()));
        let statistics_repo = Arc::new(SqlxStatisticsQueueRepository::new(pool.clone()));

        let storage = Arc::new(LocalNotificationStorage::new(
            notification_repo,
            config.shown_history_capacity,
        ));

        let gate = ReadinessGate::new();
        let barrier = Arc::new(InitBarrier::new(gate.clone()));

        let (wake, wake_events) = TokioWakeTimer::new()?;
        let wake = Arc::new(wake);

        let scheduler = Arc::new(AlarmScheduler::new(
            storage.clone(),
            wake.clone(),
            collaborators.dispatcher,
            collaborators.presenter,
            gate.clone(),
        ));
        let recovery = Arc::new(RebootRecovery::new(
            storage.clone(),
            wake.clone(),
            gate.clone(),
            config.recovery.clone(),
        ));

        let statistics = Arc::new(StatisticsQueue::new(
            statistics_repo.clone(),
            config.statistics.clone(),
        ));
        let worker = Arc::new(StatisticsWorker::new(
            gate.clone(),
            collaborators.sender,
            storage.clone(),
            config.statistics.max_attempts,
        ));
        let runner = Arc::new(StatisticsRunner::new(
            statistics_repo,
            statistics.clone(),
            worker,
            gate.clone(),
        ));

        let cancellation_token = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(
                scheduler
                    .clone()
                    .run_wake_loop(wake_events, cancellation_token.child_token()),
            ),
            runner.clone().start(cancellation_token.child_token()),
        ];

        // Timers from a previous process are gone; re-arm once ready.
        recovery.on_device_booted();

        info!("Service container initialized");
        Ok(Self {
            pool,
            config,
            storage,
            gate,
            barrier,
            wake,
            scheduler,
            recovery,
            statistics,
            runner,
            cancellation_token,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    // Readiness

    pub fn device_id_resolved(&self) -> bool {
        self.barrier.complete(Prerequisite::DeviceId)
    }

    pub fn app_id_resolved(&self) -> bool {
        self.barrier.complete(Prerequisite::AppId)
    }

    pub fn initialization_failed(&self, prerequisite: Prerequisite, reason: &str) -> bool {
        self.barrier.fail(prerequisite, reason)
    }

    pub fn state(&self) -> SdkState {
        self.gate.state()
    }

    // Local notifications

    pub async fn schedule_local_notification(
        &self,
        payload: impl Into<Vec<u8>>,
        delay_secs: u64,
    ) -> LocalNotificationRequest {
        self.scheduler
            .schedule_local_notification(payload, delay_secs)
            .await
    }

    pub async fn cancel_local_notification(&self, request_id: i32) {
        self.scheduler.cancel_local_notification(request_id).await
    }

    pub async fn cancel_all_local_notifications(&self) -> usize {
        self.scheduler.cancel_all().await
    }

    pub async fn get_pending_ids(&self) -> BTreeSet<i32> {
        self.storage.get_pending_ids().await
    }

    pub async fn local_notification(&self, request_id: i32) -> Option<LocalNotificationRequest> {
        self.scheduler.request(request_id).await
    }

    pub async fn record_shown(&self, request_id: i32, notification_id: i32, tag: &str) -> bool {
        self.scheduler
            .record_shown(request_id, notification_id, tag)
            .await
    }

    // Statistics

    pub async fn schedule_delivery_event(&self, push_hash: &str, metadata: Option<&str>) -> bool {
        self.statistics
            .schedule_delivery_event(push_hash, metadata)
            .await
    }

    pub async fn schedule_open_event(&self, push_hash: &str, metadata: Option<&str>) -> bool {
        self.statistics
            .schedule_open_event(push_hash, metadata)
            .await
    }

    /// Stop background loops and release the database.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();
        self.gate.shutdown();
        self.wake.disarm_all();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(DEFAULT_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed during shutdown: {}", e),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        self.pool.close().await;
        info!("Services shut down");
    }
}
