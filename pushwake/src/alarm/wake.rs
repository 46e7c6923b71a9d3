//! One-shot wake timers keyed by request id.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::database::time::{millis_until, now_ms};
use crate::{Error, Result};

/// Delivered when an armed timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEvent {
    pub request_id: i32,
}

/// A one-shot wake primitive.
///
/// Arming an id that is already armed replaces the earlier timer. Timers are
/// not expected to survive process death; recovery re-arms them.
pub trait WakeTimer: Send + Sync {
    fn arm(&self, request_id: i32, trigger_at_ms: i64) -> Result<()>;

    /// Returns `true` if a timer was armed for `request_id`.
    fn disarm(&self, request_id: i32) -> bool;
}

struct ArmedTimer {
    generation: u64,
    trigger_at: i64,
    cancel: CancellationToken,
}

/// [`WakeTimer`] backed by Tokio sleep tasks.
///
/// Fired timers are reported as [`WakeEvent`]s on the channel returned by
/// [`TokioWakeTimer::new`].
pub struct TokioWakeTimer {
    timers: Arc<DashMap<i32, ArmedTimer>>,
    events: mpsc::UnboundedSender<WakeEvent>,
    handle: Handle,
    generation: AtomicU64,
}

impl TokioWakeTimer {
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<WakeEvent>)> {
        let handle = Handle::try_current()
            .map_err(|e| Error::wake(format!("no Tokio runtime available: {}", e)))?;
        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                timers: Arc::new(DashMap::new()),
                events,
                handle,
                generation: AtomicU64::new(0),
            },
            rx,
        ))
    }

    pub fn armed_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.timers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Trigger time of the timer armed for `request_id`, if any.
    pub fn armed_trigger(&self, request_id: i32) -> Option<i64> {
        self.timers.get(&request_id).map(|t| t.trigger_at)
    }

    pub fn disarm_all(&self) {
        self.timers.retain(|_, timer| {
            timer.cancel.cancel();
            false
        });
    }
}

impl WakeTimer for TokioWakeTimer {
    fn arm(&self, request_id: i32, trigger_at_ms: i64) -> Result<()> {
        if self.events.is_closed() {
            return Err(Error::wake("wake event loop is not running"));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let delay = Duration::from_millis(millis_until(trigger_at_ms, now_ms()));

        if let Some(previous) = self.timers.insert(
            request_id,
            ArmedTimer {
                generation,
                trigger_at: trigger_at_ms,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
            trace!(request_id, "Replaced armed wake timer");
        }

        let timers = self.timers.clone();
        let events = self.events.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // A re-arm between expiry and here owns the entry now.
                    let current = timers
                        .remove_if(&request_id, |_, t| t.generation == generation)
                        .is_some();
                    if current && events.send(WakeEvent { request_id }).is_err() {
                        debug!(request_id, "Wake timer fired after the event loop stopped");
                    }
                }
            }
        });

        debug!(request_id, delay_ms = delay.as_millis() as u64, "Armed wake timer");
        Ok(())
    }

    fn disarm(&self, request_id: i32) -> bool {
        match self.timers.remove(&request_id) {
            Some((_, timer)) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }
}
