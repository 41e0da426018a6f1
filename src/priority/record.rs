//! Per-user quota and priority rows.

use serde::{Deserialize, Serialize};

/// Computed priority of a user who exceeded a quota.
pub const QUOTA_EXCEEDED: f64 = -1.0;

/// One row of the priority quota table.
///
/// The base fields belong to quota administration; `userload` and
/// `computed_priority` are only ever written by the priority engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityRecord {
    pub user: String,
    /// Administrator-assigned weight.
    pub priority: f64,
    /// Cores currently allocated to the user's running jobs.
    pub running: i64,
    pub max_parallel_jobs: i64,
    /// Seconds of running time accumulated over the last 24 hours.
    pub total_running_time_last24h: i64,
    /// 24 hour running time quota, in seconds.
    pub max_total_running_time: i64,
    pub userload: f64,
    /// Either `QUOTA_EXCEEDED` or a positive ranking weight.
    pub computed_priority: f64,
}

impl PriorityRecord {
    pub fn new(user: impl Into<String>, priority: f64) -> Self {
        Self {
            user: user.into(),
            priority,
            running: 0,
            max_parallel_jobs: 100,
            total_running_time_last24h: 0,
            max_total_running_time: 1_000_000,
            userload: 0.0,
            computed_priority: 1.0,
        }
    }

    pub fn with_running(mut self, running: i64, max_parallel_jobs: i64) -> Self {
        self.running = running;
        self.max_parallel_jobs = max_parallel_jobs;
        self
    }

    pub fn with_usage(mut self, last24h: i64, max_total: i64) -> Self {
        self.total_running_time_last24h = last24h;
        self.max_total_running_time = max_total;
        self
    }

    /// The five inputs the priority function depends on.
    pub fn inputs(&self) -> PriorityInputs {
        PriorityInputs {
            priority: self.priority,
            running: self.running,
            max_parallel_jobs: self.max_parallel_jobs,
            total_running_time_last24h: self.total_running_time_last24h,
            max_total_running_time: self.max_total_running_time,
        }
    }

    /// Whether the user's jobs are currently excluded from matching.
    pub fn is_excluded(&self) -> bool {
        self.computed_priority <= 0.0
    }

    /// True when the user consumed anything in the last 24 hours or has
    /// cores allocated right now.
    pub fn has_recent_usage(&self) -> bool {
        self.running > 0 || self.total_running_time_last24h > 0
    }
}

/// Inputs of `compute_priority`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInputs {
    pub priority: f64,
    pub running: i64,
    pub max_parallel_jobs: i64,
    pub total_running_time_last24h: i64,
    pub max_total_running_time: i64,
}
