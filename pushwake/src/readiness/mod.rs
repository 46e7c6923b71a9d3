//! SDK readiness gate.
//!
//! Work submitted before initialization finishes is queued and flushed in
//! submission order once the gate becomes READY. A gate that enters ERROR
//! drops queued and future work for the rest of the process lifetime.

pub mod barrier;

pub use barrier::{InitBarrier, Prerequisite};

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Readiness of the SDK for the current process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdkState {
    Initializing,
    Ready,
    Error,
}

impl SdkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        }
    }

    /// Only forward transitions out of INITIALIZING are allowed.
    pub fn can_transition_to(&self, target: &SdkState) -> bool {
        matches!(
            (self, target),
            (Self::Initializing, Self::Ready) | (Self::Initializing, Self::Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initializing)
    }
}

/// A unit of deferred work.
pub type GateTask = BoxFuture<'static, ()>;

struct GateInner {
    state: SdkState,
    pending: VecDeque<GateTask>,
}

/// Queues work until the SDK is ready, then runs it in order.
///
/// Tasks run one at a time on a dedicated executor task, so a task handed over
/// directly in READY still runs after every task flushed before it.
pub struct ReadinessGate {
    inner: Mutex<GateInner>,
    executor: mpsc::UnboundedSender<GateTask>,
    state_tx: watch::Sender<SdkState>,
    cancel: CancellationToken,
}

impl ReadinessGate {
    /// Create a gate in INITIALIZING and start its executor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Arc<Self> {
        let (executor, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SdkState::Initializing);
        let cancel = CancellationToken::new();

        tokio::spawn(run_executor(rx, cancel.clone()));

        Arc::new(Self {
            inner: Mutex::new(GateInner {
                state: SdkState::Initializing,
                pending: VecDeque::new(),
            }),
            executor,
            state_tx,
            cancel,
        })
    }

    pub fn state(&self) -> SdkState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SdkState::Ready
    }

    /// Number of tasks waiting for READY.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Run `task` now if READY, queue it while INITIALIZING, drop it in ERROR.
    ///
    /// Returns `false` when the task was dropped.
    pub fn execute_or_queue<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: GateTask = Box::pin(task);
        let mut inner = self.inner.lock();
        match inner.state {
            SdkState::Ready => {
                if self.executor.send(task).is_err() {
                    warn!("Readiness gate executor is stopped, dropping task");
                    return false;
                }
                true
            }
            SdkState::Initializing => {
                inner.pending.push_back(task);
                debug!(pending = inner.pending.len(), "Queued task until SDK is ready");
                true
            }
            SdkState::Error => {
                warn!("SDK failed to initialize, dropping task");
                false
            }
        }
    }

    /// Move to READY and flush queued tasks in submission order.
    pub fn set_ready(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_transition(inner.state, SdkState::Ready)?;

        let flushed = inner.pending.len();
        // Flushing under the lock keeps new submissions behind the backlog.
        while let Some(task) = inner.pending.pop_front() {
            if self.executor.send(task).is_err() {
                warn!("Readiness gate executor is stopped, dropping queued task");
            }
        }
        inner.state = SdkState::Ready;
        self.state_tx.send_replace(SdkState::Ready);
        drop(inner);

        info!(flushed, "SDK ready");
        Ok(())
    }

    /// Move to ERROR and discard queued tasks.
    pub fn set_error(&self, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_transition(inner.state, SdkState::Error)?;

        let dropped = inner.pending.len();
        inner.pending.clear();
        inner.state = SdkState::Error;
        self.state_tx.send_replace(SdkState::Error);
        drop(inner);

        warn!(dropped, "SDK initialization failed: {}", reason);
        Ok(())
    }

    fn check_transition(from: SdkState, to: SdkState) -> Result<()> {
        if from.can_transition_to(&to) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SdkState> {
        self.state_tx.subscribe()
    }

    /// Wait until the gate leaves INITIALIZING. Waits forever if it never does.
    pub async fn wait_settled(&self) -> SdkState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Wait for READY. Returns `false` if the gate entered ERROR instead.
    pub async fn wait_ready(&self) -> bool {
        self.wait_settled().await == SdkState::Ready
    }

    /// Stop the executor. Tasks not yet started are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.inner.lock().pending.clear();
    }
}

async fn run_executor(mut rx: mpsc::UnboundedReceiver<GateTask>, cancel: CancellationToken) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        // A panicking task must not take the executor down with it.
        if let Err(e) = tokio::spawn(task).await {
            warn!("Deferred task failed: {}", e);
        }
    }
    debug!("Readiness gate executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recorder() -> (
        Arc<Mutex<Vec<u32>>>,
        impl Fn(u32) -> GateTask + Clone + Send + 'static,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |n: u32| -> GateTask {
            let log = log_clone.clone();
            Box::pin(async move {
                log.lock().push(n);
            })
        };
        (log, make)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_state_transitions() {
        assert!(SdkState::Initializing.can_transition_to(&SdkState::Ready));
        assert!(SdkState::Initializing.can_transition_to(&SdkState::Error));
        assert!(!SdkState::Ready.can_transition_to(&SdkState::Initializing));
        assert!(!SdkState::Ready.can_transition_to(&SdkState::Error));
        assert!(!SdkState::Error.can_transition_to(&SdkState::Ready));
        assert_eq!(SdkState::Ready.as_str(), "READY");
    }

    #[tokio::test]
    async fn test_queued_tasks_wait_for_ready_and_run_in_order() {
        let gate = ReadinessGate::new();
        let (log, make) = recorder();

        for n in 0..5 {
            assert!(gate.execute_or_queue(make(n)));
        }
        settle().await;
        assert!(log.lock().is_empty());
        assert_eq!(gate.pending_len(), 5);

        gate.set_ready().unwrap();
        gate.execute_or_queue(make(5));
        settle().await;

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(gate.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_error_drops_queued_and_new_tasks() {
        let gate = ReadinessGate::new();
        let (log, make) = recorder();

        gate.execute_or_queue(make(1));
        gate.set_error("device id unavailable").unwrap();
        assert!(!gate.execute_or_queue(make(2)));
        settle().await;

        assert!(log.lock().is_empty());
        assert_eq!(gate.state(), SdkState::Error);
        assert!(matches!(
            gate.set_ready(),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stop_executor() {
        let gate = ReadinessGate::new();
        let (log, make) = recorder();
        gate.set_ready().unwrap();

        gate.execute_or_queue(async { panic!("boom") });
        gate.execute_or_queue(make(7));
        settle().await;

        assert_eq!(*log.lock(), vec![7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submit_while_flushing_runs_each_task_once() {
        let gate = ReadinessGate::new();
        let (log, make) = recorder();

        for n in 0..100 {
            gate.execute_or_queue(make(n));
        }

        let submitter = {
            let gate = gate.clone();
            let make = make.clone();
            tokio::spawn(async move {
                for n in 100..200 {
                    gate.execute_or_queue(make(n));
                    tokio::task::yield_now().await;
                }
            })
        };
        gate.set_ready().unwrap();
        submitter.await.unwrap();
        settle().await;

        let mut seen = log.lock().clone();
        assert_eq!(seen.len(), 200);
        // The backlog precedes anything submitted after it.
        assert_eq!(&seen[..100], (0..100).collect::<Vec<_>>().as_slice());
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let gate = ReadinessGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_ready().await })
        };

        settle().await;
        assert!(!waiter.is_finished());
        gate.set_ready().unwrap();
        assert!(waiter.await.unwrap());
    }
}
