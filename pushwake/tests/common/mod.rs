//! Shared test doubles for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pushwake::alarm::MessageDispatcher;
use pushwake::notification::NotificationPresenter;
use pushwake::services::Collaborators;
use pushwake::statistics::{DeliveryError, StatisticsSender};

#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<(i32, Vec<u8>)>>,
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request_id: i32, payload: Vec<u8>) -> pushwake::Result<()> {
        self.dispatched.lock().push((request_id, payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    pub dismissed: Mutex<Vec<(i32, String)>>,
}

#[async_trait]
impl NotificationPresenter for RecordingPresenter {
    async fn dismiss(&self, notification_id: i32, tag: &str) -> pushwake::Result<()> {
        self.dismissed.lock().push((notification_id, tag.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSender {
    pub delivered: Mutex<Vec<String>>,
    pub opened: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl RecordingSender {
    pub fn total(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatisticsSender for RecordingSender {
    async fn send_delivered(
        &self,
        push_hash: &str,
        _metadata: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.delivered.lock().push(push_hash.to_string());
        Ok(())
    }

    async fn send_opened(
        &self,
        push_hash: &str,
        _metadata: Option<&str>,
    ) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().push(push_hash.to_string());
        Ok(())
    }
}

pub struct Doubles {
    pub dispatcher: Arc<RecordingDispatcher>,
    pub presenter: Arc<RecordingPresenter>,
    pub sender: Arc<RecordingSender>,
}

impl Doubles {
    pub fn new() -> Self {
        Self {
            dispatcher: Arc::new(RecordingDispatcher::default()),
            presenter: Arc::new(RecordingPresenter::default()),
            sender: Arc::new(RecordingSender::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            dispatcher: self.dispatcher.clone(),
            presenter: self.presenter.clone(),
            sender: self.sender.clone(),
        }
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
