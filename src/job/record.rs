//! The task queue row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::JobStatus;

/// Who submitted a job and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOwner {
    /// Account the job runs as.
    pub user: String,
    /// Host the job was submitted from.
    pub submit_host: String,
}

impl JobOwner {
    pub fn new(user: impl Into<String>, submit_host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            submit_host: submit_host.into(),
        }
    }
}

/// One unit of work in the task queue.
///
/// The queue identifier never changes and the resubmission counter only
/// grows. Status changes go through `JobStatus::transition_actor`; the store
/// enforces that table with a single conditional update per change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, immutable queue identifier.
    pub queue_id: i64,
    pub status: JobStatus,
    pub owner: JobOwner,
    /// Site the job was assigned to, once claimed.
    pub site: Option<String>,
    /// CE the job was assigned through, once claimed.
    pub ce: Option<String>,
    /// Worker node host that claimed the job.
    pub exec_host: Option<String>,
    /// Job descriptor (requirements + executable); opaque to the broker.
    pub jdl: String,
    pub priority: i32,
    pub price: f64,
    /// Incremented on every assignment; agents echo it on each update.
    pub resubmission: i32,
    /// Waiting aggregate this job is grouped under, while waiting.
    pub aggregate_id: Option<i64>,
    /// Master job identifier, for subjobs.
    pub split: Option<i64>,
    /// Whether this row is a master job that fans out into subjobs.
    pub master_job: bool,
    pub submitted_at: DateTime<Utc>,
    /// Last heartbeat received from the agent, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a waiting job owned by `owner`.
    pub fn new(queue_id: i64, owner: JobOwner, jdl: impl Into<String>) -> Self {
        Self {
            queue_id,
            status: JobStatus::Waiting,
            owner,
            site: None,
            ce: None,
            exec_host: None,
            jdl: jdl.into(),
            priority: 0,
            price: 1.0,
            resubmission: 0,
            aggregate_id: None,
            split: None,
            master_job: false,
            submitted_at: Utc::now(),
            last_heartbeat: None,
        }
    }

    /// Groups the job under a waiting aggregate.
    pub fn with_aggregate(mut self, aggregate_id: i64) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    /// Marks the job as a subjob of `master_id`.
    pub fn with_master(mut self, master_id: i64) -> Self {
        self.split = Some(master_id);
        self
    }

    /// Marks the job as a master job.
    pub fn as_master(mut self) -> Self {
        self.master_job = true;
        self
    }

    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// A master job has children instead of being directly executable.
    pub fn is_master_job(&self) -> bool {
        self.master_job || self.status.is_master_status()
    }

    /// Time since the last heartbeat, or `None` if none was ever received.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_heartbeat.map(|at| now - at)
    }
}
