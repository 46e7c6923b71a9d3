//! Pending work survives a process restart.
//!
//! Each "process" is a ServiceContainer on the same SQLite file; the first is
//! shut down before the second is built.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use tempfile::TempDir;

use common::{Doubles, eventually};
use pushwake::config::{PushwakeConfig, StatisticsConfig};
use pushwake::database::time::now_ms;
use pushwake::readiness::SdkState;
use pushwake::services::ServiceContainer;

fn file_config(dir: &TempDir) -> PushwakeConfig {
    let path = dir.path().join("pushwake.db");
    PushwakeConfig {
        database_url: format!("sqlite:{}?mode=rwc", path.display()),
        statistics: StatisticsConfig {
            max_initial_jitter_ms: 0,
            poll_interval_ms: 20,
            ..StatisticsConfig::default()
        },
        ..PushwakeConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_notification_is_rearmed_after_restart() {
    let dir = TempDir::new().unwrap();

    let first = Doubles::new();
    let container = ServiceContainer::new(file_config(&dir), first.collaborators())
        .await
        .unwrap();
    let request = container
        .schedule_local_notification(b"remind me".to_vec(), 3_600)
        .await;
    assert!(request.is_valid());
    container.shutdown().await;

    let second = Doubles::new();
    let container = ServiceContainer::new(file_config(&dir), second.collaborators())
        .await
        .unwrap();
    assert_eq!(
        container.get_pending_ids().await,
        BTreeSet::from([request.request_id()])
    );

    // Recovery waits for readiness.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(container.wake.armed_ids().is_empty());

    let restarted_at = now_ms();
    container.device_id_resolved();
    container.app_id_resolved();
    assert_eq!(container.state(), SdkState::Ready);

    let wake = container.wake.clone();
    let id = request.request_id();
    assert!(eventually(Duration::from_secs(2), || wake.armed_ids() == vec![id]).await);
    let trigger = container.wake.armed_trigger(id).unwrap();
    assert!(trigger >= restarted_at + 5_000);

    // A wake event delivers the payload once.
    assert!(container.scheduler.fire(id).await);
    assert!(!container.scheduler.fire(id).await);
    let dispatcher = second.dispatcher.clone();
    assert!(eventually(Duration::from_secs(2), || dispatcher.dispatched.lock().len() == 1).await);
    assert_eq!(second.dispatcher.dispatched.lock()[0].1, b"remind me".to_vec());

    container.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_ids_continue_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut seen = BTreeSet::new();

    for _ in 0..2 {
        let doubles = Doubles::new();
        let container = ServiceContainer::new(file_config(&dir), doubles.collaborators())
            .await
            .unwrap();
        for _ in 0..3 {
            let request = container
                .schedule_local_notification(Vec::new(), 3_600)
                .await;
            assert!(seen.insert(request.request_id()));
        }
        container.shutdown().await;
    }

    assert_eq!(seen.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_statistics_are_sent_after_restart() {
    let dir = TempDir::new().unwrap();

    // First process never becomes ready, so nothing is sent.
    let first = Doubles::new();
    let container = ServiceContainer::new(file_config(&dir), first.collaborators())
        .await
        .unwrap();
    assert!(container.schedule_delivery_event("hash1", None).await);
    assert!(container.schedule_open_event("hash1", Some("{}")).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    container.shutdown().await;
    assert_eq!(first.sender.total(), 0);

    let second = Doubles::new();
    let container = ServiceContainer::new(file_config(&dir), second.collaborators())
        .await
        .unwrap();
    container.device_id_resolved();
    container.app_id_resolved();

    let sender = second.sender.clone();
    assert!(eventually(Duration::from_secs(3), || sender.total() == 2).await);
    assert_eq!(*second.sender.delivered.lock(), vec!["hash1".to_string()]);
    assert_eq!(*second.sender.opened.lock(), vec!["hash1".to_string()]);
    assert_eq!(container.statistics.count().await.unwrap(), 0);

    container.shutdown().await;
}
