//! Run statistics for one root computation.
//!
//! T1 (total serial work) and T-infinity (critical path) are computed
//! bottom-up through the join DAG as results are processed; the totals here
//! are the root's, reported once the final value is delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ComputeStats {
    /// Results processed so far.
    tasks: AtomicU64,
    /// Raw task running time folded in per result, in nanos.
    busy_nanos: AtomicU64,
    /// Critical-path time of the delivered root result, in nanos.
    t_inf_nanos: AtomicU64,
}

impl ComputeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero everything at the start of a root computation.
    pub fn reset(&self) {
        self.tasks.store(0, Ordering::Relaxed);
        self.busy_nanos.store(0, Ordering::Relaxed);
        self.t_inf_nanos.store(0, Ordering::Relaxed);
    }

    pub fn record_result(&self, run_time: Duration) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
        self.busy_nanos.fetch_add(
            u64::try_from(run_time.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn set_t_inf(&self, t_inf: Duration) {
        self.t_inf_nanos.store(
            u64::try_from(t_inf.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks: self.tasks.load(Ordering::Relaxed),
            busy: Duration::from_nanos(self.busy_nanos.load(Ordering::Relaxed)),
            t_inf: Duration::from_nanos(self.t_inf_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub tasks: u64,
    pub busy: Duration,
    pub t_inf: Duration,
}
