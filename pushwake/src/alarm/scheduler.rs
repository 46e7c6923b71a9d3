//! Alarm scheduler for local notifications.
//!
//! A notification is persisted first and armed second, so a wake event can
//! always find its payload. Firing deletes the row before dispatching, which
//! makes a duplicated wake event a no-op.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::wake::{WakeEvent, WakeTimer};
use crate::Result;
use crate::database::models::PendingNotificationDbModel;
use crate::database::time::now_ms;
use crate::notification::{LocalNotificationStorage, NotificationPresenter};
use crate::readiness::ReadinessGate;

/// Request id reported when scheduling failed.
pub const INVALID_REQUEST_ID: i32 = -1;

/// Receives the payload of a fired local notification.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn dispatch(&self, request_id: i32, payload: Vec<u8>) -> Result<()>;
}

pub struct AlarmScheduler {
    storage: Arc<LocalNotificationStorage>,
    wake: Arc<dyn WakeTimer>,
    dispatcher: Arc<dyn MessageDispatcher>,
    presenter: Arc<dyn NotificationPresenter>,
    gate: Arc<ReadinessGate>,
}

impl AlarmScheduler {
    pub fn new(
        storage: Arc<LocalNotificationStorage>,
        wake: Arc<dyn WakeTimer>,
        dispatcher: Arc<dyn MessageDispatcher>,
        presenter: Arc<dyn NotificationPresenter>,
        gate: Arc<ReadinessGate>,
    ) -> Self {
        Self {
            storage,
            wake,
            dispatcher,
            presenter,
            gate,
        }
    }

    /// Persist a pending notification and arm its wake timer.
    ///
    /// If the timer cannot be armed the row is removed again so nothing is
    /// left that would never fire.
    pub async fn schedule(
        &self,
        request_id: i32,
        trigger_at: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let notification = PendingNotificationDbModel::new(request_id, trigger_at, payload);
        self.storage.save_pending(&notification).await?;

        if let Err(e) = self.wake.arm(request_id, trigger_at) {
            if let Err(remove_err) = self.storage.remove_pending(request_id).await {
                warn!(request_id, "Failed to remove unarmed notification: {}", remove_err);
            }
            return Err(e);
        }

        debug!(request_id, trigger_at, "Scheduled local notification");
        Ok(())
    }

    /// Schedule `payload` to fire `delay_secs` from now.
    ///
    /// Never fails: a storage or wake fault is logged and the returned handle
    /// carries [`INVALID_REQUEST_ID`].
    pub async fn schedule_local_notification(
        self: &Arc<Self>,
        payload: impl Into<Vec<u8>>,
        delay_secs: u64,
    ) -> LocalNotificationRequest {
        let request_id = self.storage.next_request_id().await;
        let delay_ms = i64::try_from(delay_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let trigger_at = now_ms().saturating_add(delay_ms);

        match self.schedule(request_id, trigger_at, payload).await {
            Ok(()) => LocalNotificationRequest {
                request_id,
                trigger_at,
                scheduler: Some(self.clone()),
            },
            Err(e) => {
                error!(request_id, "Failed to schedule local notification: {}", e);
                LocalNotificationRequest::invalid()
            }
        }
    }

    /// Handle for a notification that is still pending.
    pub async fn request(self: &Arc<Self>, request_id: i32) -> Option<LocalNotificationRequest> {
        match self.storage.get_pending(request_id).await {
            Ok(Some(pending)) => Some(LocalNotificationRequest {
                request_id,
                trigger_at: pending.trigger_at,
                scheduler: Some(self.clone()),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(request_id, "Failed to look up pending notification: {}", e);
                None
            }
        }
    }

    /// Disarm and forget a pending notification. Unknown ids are ignored.
    pub async fn cancel(&self, request_id: i32) {
        let was_armed = self.wake.disarm(request_id);
        match self.storage.remove_pending(request_id).await {
            Ok(removed) => debug!(request_id, was_armed, removed, "Cancelled local notification"),
            Err(e) => warn!(request_id, "Failed to remove pending notification: {}", e),
        }
    }

    /// Cancel the pending alarm and dismiss the notification if it was shown.
    pub async fn cancel_local_notification(&self, request_id: i32) {
        self.cancel(request_id).await;

        match self.storage.take_shown(request_id).await {
            Ok(Some(shown)) => {
                if let Err(e) = self.presenter.dismiss(shown.notification_id, &shown.tag).await {
                    warn!(request_id, "Failed to dismiss shown notification: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(request_id, "Failed to look up shown notification: {}", e),
        }
    }

    /// Cancel every pending notification. Returns how many were visited.
    pub async fn cancel_all(&self) -> usize {
        let ids = self.storage.get_pending_ids().await;
        for &request_id in &ids {
            self.cancel(request_id).await;
        }
        info!(count = ids.len(), "Cancelled all local notifications");
        ids.len()
    }

    /// Remember that `request_id` was displayed as `(notification_id, tag)`.
    pub async fn record_shown(&self, request_id: i32, notification_id: i32, tag: &str) -> bool {
        match self.storage.record_shown(request_id, notification_id, tag).await {
            Ok(()) => true,
            Err(e) => {
                warn!(request_id, "Failed to record shown notification: {}", e);
                false
            }
        }
    }

    /// Handle a wake event for `request_id`.
    ///
    /// Returns `true` if a payload was handed to the readiness gate. A second
    /// call for the same id finds nothing and returns `false`.
    pub async fn fire(&self, request_id: i32) -> bool {
        let pending = match self.storage.take_pending(request_id).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                debug!(request_id, "Wake event for unknown notification, ignoring");
                return false;
            }
            Err(e) => {
                error!(request_id, "Failed to load fired notification: {}", e);
                return false;
            }
        };

        let dispatcher = self.dispatcher.clone();
        let payload = pending.payload;
        self.gate.execute_or_queue(async move {
            if let Err(e) = dispatcher.dispatch(request_id, payload).await {
                warn!(request_id, "Message dispatcher failed: {}", e);
            }
        })
    }

    /// Consume wake events until cancelled or the timer side goes away.
    pub async fn run_wake_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WakeEvent>,
        cancel: CancellationToken,
    ) {
        info!("Wake event loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(WakeEvent { request_id }) => {
                        self.fire(request_id).await;
                    }
                    None => break,
                },
            }
        }
        info!("Wake event loop stopped");
    }
}

/// Handle to a scheduled local notification.
#[derive(Clone)]
pub struct LocalNotificationRequest {
    request_id: i32,
    trigger_at: i64,
    scheduler: Option<Arc<AlarmScheduler>>,
}

impl LocalNotificationRequest {
    fn invalid() -> Self {
        Self {
            request_id: INVALID_REQUEST_ID,
            trigger_at: 0,
            scheduler: None,
        }
    }

    /// The request id, or [`INVALID_REQUEST_ID`] if scheduling failed.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn trigger_at(&self) -> i64 {
        self.trigger_at
    }

    pub fn is_valid(&self) -> bool {
        self.request_id != INVALID_REQUEST_ID
    }

    /// Cancel the alarm and dismiss the notification if it is already displayed.
    pub async fn cancel(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel_local_notification(self.request_id).await;
        }
    }
}

impl fmt::Debug for LocalNotificationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNotificationRequest")
            .field("request_id", &self.request_id)
            .field("trigger_at", &self.trigger_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::wake::TokioWakeTimer;
    use crate::database::repositories::SqlxLocalNotificationRepository;
    use crate::database::{DbPool, init_pool_with_size, run_migrations};
    use crate::notification::DEFAULT_SHOWN_HISTORY_CAPACITY;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<(i32, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn dispatch(&self, request_id: i32, payload: Vec<u8>) -> Result<()> {
            self.dispatched.lock().push((request_id, payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPresenter {
        dismissed: Mutex<Vec<(i32, String)>>,
    }

    #[async_trait]
    impl NotificationPresenter for RecordingPresenter {
        async fn dismiss(&self, notification_id: i32, tag: &str) -> Result<()> {
            self.dismissed.lock().push((notification_id, tag.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        pool: DbPool,
        scheduler: Arc<AlarmScheduler>,
        timer: Arc<TokioWakeTimer>,
        dispatcher: Arc<RecordingDispatcher>,
        presenter: Arc<RecordingPresenter>,
        gate: Arc<ReadinessGate>,
        _events: mpsc::UnboundedReceiver<WakeEvent>,
    }

    async fn setup() -> Fixture {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqlxLocalNotificationRepository::new(pool.clone()));
        let storage = Arc::new(LocalNotificationStorage::new(
            repo,
            DEFAULT_SHOWN_HISTORY_CAPACITY,
        ));
        let (timer, events) = TokioWakeTimer::new().unwrap();
        let timer = Arc::new(timer);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let presenter = Arc::new(RecordingPresenter::default());
        let gate = ReadinessGate::new();
        gate.set_ready().unwrap();

        let scheduler = Arc::new(AlarmScheduler::new(
            storage,
            timer.clone(),
            dispatcher.clone(),
            presenter.clone(),
            gate.clone(),
        ));
        Fixture {
            pool,
            scheduler,
            timer,
            dispatcher,
            presenter,
            gate,
            _events: events,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_schedule_persists_and_arms() {
        let f = setup().await;
        let request = f.scheduler.schedule_local_notification(b"hi".to_vec(), 60).await;

        assert!(request.is_valid());
        assert_eq!(f.timer.armed_ids(), vec![request.request_id()]);
        assert_eq!(f.timer.armed_trigger(request.request_id()), Some(request.trigger_at()));
        assert!(f.scheduler.request(request.request_id()).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let f = setup().await;
        f.scheduler.schedule(5, now_ms() + 60_000, b"x".to_vec()).await.unwrap();

        f.scheduler.cancel(5).await;
        f.scheduler.cancel(5).await;
        f.scheduler.cancel(12345).await;

        assert!(f.timer.armed_ids().is_empty());
        assert!(f.scheduler.request(5).await.is_none());
        assert!(!f.scheduler.fire(5).await);
    }

    #[tokio::test]
    async fn test_duplicate_fire_dispatches_once() {
        let f = setup().await;
        f.scheduler.schedule(9, now_ms() + 60_000, b"payload".to_vec()).await.unwrap();

        assert!(f.scheduler.fire(9).await);
        assert!(!f.scheduler.fire(9).await);
        settle().await;

        let dispatched = f.dispatcher.dispatched.lock().clone();
        assert_eq!(dispatched, vec![(9, b"payload".to_vec())]);
    }

    #[tokio::test]
    async fn test_fire_waits_for_readiness() {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let storage = Arc::new(LocalNotificationStorage::new(
            Arc::new(SqlxLocalNotificationRepository::new(pool)),
            DEFAULT_SHOWN_HISTORY_CAPACITY,
        ));
        let (timer, _events) = TokioWakeTimer::new().unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let gate = ReadinessGate::new();
        let scheduler = AlarmScheduler::new(
            storage,
            Arc::new(timer),
            dispatcher.clone(),
            Arc::new(RecordingPresenter::default()),
            gate.clone(),
        );

        scheduler.schedule(1, now_ms(), b"a".to_vec()).await.unwrap();
        assert!(scheduler.fire(1).await);
        settle().await;
        assert!(dispatcher.dispatched.lock().is_empty());

        gate.set_ready().unwrap();
        settle().await;
        assert_eq!(dispatcher.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_arm_failure_removes_row_and_returns_sentinel() {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let storage = Arc::new(LocalNotificationStorage::new(
            Arc::new(SqlxLocalNotificationRepository::new(pool)),
            DEFAULT_SHOWN_HISTORY_CAPACITY,
        ));
        let (timer, events) = TokioWakeTimer::new().unwrap();
        drop(events);
        let scheduler = Arc::new(AlarmScheduler::new(
            storage.clone(),
            Arc::new(timer),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(RecordingPresenter::default()),
            ReadinessGate::new(),
        ));

        let request = scheduler.schedule_local_notification(b"x".to_vec(), 1).await;
        assert!(!request.is_valid());
        assert_eq!(request.request_id(), INVALID_REQUEST_ID);
        assert!(storage.get_pending_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_fault_returns_sentinel() {
        let f = setup().await;
        f.pool.close().await;

        let request = f.scheduler.schedule_local_notification(b"x".to_vec(), 1).await;
        assert_eq!(request.request_id(), INVALID_REQUEST_ID);
        assert!(!f.scheduler.fire(0).await);
        f.scheduler.cancel(0).await;
    }

    #[tokio::test]
    async fn test_request_cancel_dismisses_shown_notification() {
        let f = setup().await;
        let request = f.scheduler.schedule_local_notification(b"x".to_vec(), 60).await;
        assert!(f.scheduler.record_shown(request.request_id(), 77, "promo").await);

        request.cancel().await;

        assert!(f.timer.armed_ids().is_empty());
        assert_eq!(
            f.presenter.dismissed.lock().clone(),
            vec![(77, "promo".to_string())]
        );
        // A second cancel has nothing left to dismiss.
        request.cancel().await;
        assert_eq!(f.presenter.dismissed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let f = setup().await;
        for _ in 0..3 {
            f.scheduler.schedule_local_notification(Vec::new(), 60).await;
        }

        assert_eq!(f.scheduler.cancel_all().await, 3);
        assert!(f.timer.armed_ids().is_empty());
        assert_eq!(f.scheduler.cancel_all().await, 0);
    }

    #[tokio::test]
    async fn test_wake_loop_dispatches_fired_timer() {
        let pool = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let storage = Arc::new(LocalNotificationStorage::new(
            Arc::new(SqlxLocalNotificationRepository::new(pool)),
            DEFAULT_SHOWN_HISTORY_CAPACITY,
        ));
        let (timer, events) = TokioWakeTimer::new().unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let gate = ReadinessGate::new();
        gate.set_ready().unwrap();
        let scheduler = Arc::new(AlarmScheduler::new(
            storage,
            Arc::new(timer),
            dispatcher.clone(),
            Arc::new(RecordingPresenter::default()),
            gate,
        ));

        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(scheduler.clone().run_wake_loop(events, cancel.clone()));

        scheduler.schedule(4, now_ms() + 20, b"wake".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(dispatcher.dispatched.lock().clone(), vec![(4, b"wake".to_vec())]);
        cancel.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_error_drops_fired_payload() {
        let f = setup().await;
        // `setup` leaves the gate READY; a fresh gate in ERROR drops work.
        assert!(f.gate.is_ready());

        let gate = ReadinessGate::new();
        gate.set_error("no app id").unwrap();
        let scheduler = AlarmScheduler::new(
            f.scheduler.storage.clone(),
            f.timer.clone(),
            f.dispatcher.clone(),
            f.presenter.clone(),
            gate,
        );
        scheduler.schedule(8, now_ms() + 60_000, b"x".to_vec()).await.unwrap();
        assert!(!scheduler.fire(8).await);
        settle().await;
        assert!(f.dispatcher.dispatched.lock().is_empty());
    }
}
