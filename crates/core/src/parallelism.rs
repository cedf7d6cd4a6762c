use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::admission::AdmissionSlotPool;
use crate::config::MAX_PARALLELISM;
use crate::controller::AdaptiveController;

/// Result of one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub desired: usize,
    pub granted: usize,
    pub started_workers: usize,
    /// Workers the caller should spawn now; they count as started from here on.
    pub workers_to_start: usize,
}

/// Keeps the admission pool and the worker count in line with the controller's
/// parallelism. Driven from a single loop, so it needs no locking of its own.
#[derive(Debug)]
pub struct ParallelismManager {
    controller: Arc<AdaptiveController>,
    slots: AdmissionSlotPool,
    granted: usize,
    started_workers: usize,
    max_workers: usize,
}

impl ParallelismManager {
    pub fn new(
        controller: Arc<AdaptiveController>,
        slots: AdmissionSlotPool,
        max_workers: usize,
    ) -> Self {
        Self {
            controller,
            slots,
            granted: 0,
            started_workers: 0,
            max_workers: max_workers.clamp(1, MAX_PARALLELISM),
        }
    }

    pub fn granted(&self) -> usize {
        self.granted
    }

    pub fn started_workers(&self) -> usize {
        self.started_workers
    }

    /// Grows or shrinks the slot grant toward the desired parallelism. Only idle slots
    /// can be revoked; the rest of a shrink is retried on the next tick. Workers are
    /// started up to the cap and never stopped.
    pub fn reconcile(&mut self) -> Reconciliation {
        let desired = self.controller.parallelism().clamp(1, MAX_PARALLELISM);

        if desired > self.granted {
            let grow = desired - self.granted;
            self.slots.grant(grow);
            self.granted = desired;
            debug!(event = "parallelism.grow", desired, granted = self.granted, "parallelism.grow");
        } else if desired < self.granted {
            let wanted = self.granted - desired;
            let revoked = self.slots.try_revoke(wanted);
            self.granted -= revoked;
            if revoked < wanted {
                warn!(
                    event = "parallelism.shrink_partial",
                    desired,
                    granted = self.granted,
                    revoked,
                    pending = wanted - revoked,
                    "parallelism.shrink_partial"
                );
            } else {
                debug!(event = "parallelism.shrink", desired, granted = self.granted, "parallelism.shrink");
            }
        }

        let target_workers = desired.min(self.max_workers);
        let workers_to_start = target_workers.saturating_sub(self.started_workers);
        self.started_workers += workers_to_start;

        Reconciliation {
            desired,
            granted: self.granted,
            started_workers: self.started_workers,
            workers_to_start,
        }
    }
}
