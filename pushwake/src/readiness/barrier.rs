//! Two-signal initialization barrier.
//!
//! The gate becomes READY only after both the device identifier and the
//! application identifier have been resolved. If either signal never arrives
//! the gate stays INITIALIZING; [`InitBarrier::outstanding`] shows which one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::ReadinessGate;

/// A signal the SDK needs before it may run deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Prerequisite {
    DeviceId,
    AppId,
}

impl Prerequisite {
    pub const ALL: [Prerequisite; 2] = [Prerequisite::DeviceId, Prerequisite::AppId];
}

#[derive(Debug, Clone)]
enum Arrival {
    Completed,
    Failed(String),
}

pub struct InitBarrier {
    gate: Arc<ReadinessGate>,
    arrivals: Mutex<HashMap<Prerequisite, Arrival>>,
}

impl InitBarrier {
    pub fn new(gate: Arc<ReadinessGate>) -> Self {
        Self {
            gate,
            arrivals: Mutex::new(HashMap::new()),
        }
    }

    /// Signal that `prerequisite` resolved. Returns `false` for a duplicate.
    pub fn complete(&self, prerequisite: Prerequisite) -> bool {
        self.arrive(prerequisite, Arrival::Completed)
    }

    /// Signal that `prerequisite` cannot be resolved. Returns `false` for a duplicate.
    pub fn fail(&self, prerequisite: Prerequisite, reason: impl Into<String>) -> bool {
        self.arrive(prerequisite, Arrival::Failed(reason.into()))
    }

    /// Prerequisites that have not signalled yet.
    pub fn outstanding(&self) -> Vec<Prerequisite> {
        let arrivals = self.arrivals.lock();
        Prerequisite::ALL
            .into_iter()
            .filter(|p| !arrivals.contains_key(p))
            .collect()
    }

    fn arrive(&self, prerequisite: Prerequisite, arrival: Arrival) -> bool {
        let outcome = {
            let mut arrivals = self.arrivals.lock();
            if arrivals.contains_key(&prerequisite) {
                debug!(%prerequisite, "Ignoring duplicate readiness signal");
                return false;
            }
            arrivals.insert(prerequisite, arrival);

            if arrivals.len() < Prerequisite::ALL.len() {
                debug!(%prerequisite, "Readiness signal received, waiting for the rest");
                return true;
            }

            let failures: Vec<String> = Prerequisite::ALL
                .iter()
                .filter_map(|p| match arrivals.get(p) {
                    Some(Arrival::Failed(reason)) => Some(format!("{}: {}", p, reason)),
                    _ => None,
                })
                .collect();
            failures
        };

        let result = if outcome.is_empty() {
            self.gate.set_ready()
        } else {
            self.gate.set_error(&outcome.join("; "))
        };
        if let Err(e) = result {
            warn!("Readiness gate already settled: {}", e);
        }
        true
    }
}
