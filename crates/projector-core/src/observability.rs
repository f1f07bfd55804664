use serde::{Deserialize, Serialize};

/// Queue depth by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub retrying: usize,

    /// Retrying rows whose `next_run_at` is already due.
    pub retry_due: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.retrying
    }
}

/// Cumulative worker outcomes since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingCounters {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub applied: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
    pub store_failures: u64,
    pub claims_lost: u64,
}
