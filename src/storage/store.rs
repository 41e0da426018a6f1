//! The task queue store interface.
//!
//! Every mutation that must be exclusive (claim, status change, priority
//! write, marker acquisition) is a single atomic statement against one row.
//! No operation here is a read-modify-write pair coordinated in memory.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::job::{Job, JobOwner, JobStatus, TransitionActor, WaitingAggregate};
use crate::priority::PriorityRecord;

use super::filter::AggregateFilter;

/// Ownership stamped onto a job when it is claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTarget {
    pub site: String,
    pub ce: String,
    pub host: String,
}

/// The row changed by a successful claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub queue_id: i64,
    /// Counter after the claim; the agent must echo it on every update.
    pub resubmission: i32,
    pub owner: JobOwner,
    pub jdl: String,
    pub aggregate_id: i64,
}

/// A resubmission-guarded status change request.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub queue_id: i64,
    /// Counter the requester believes is current.
    pub resubmission: i32,
    pub status: JobStatus,
    pub actor: TransitionActor,
}

impl StatusChange {
    pub fn new(queue_id: i64, resubmission: i32, status: JobStatus, actor: TransitionActor) -> Self {
        Self {
            queue_id,
            resubmission,
            status,
            actor,
        }
    }

    /// Statuses the job may currently be in for this change to apply.
    ///
    /// An in-flight status reported again by the agent is a heartbeat, so the
    /// target itself is accepted for in-flight targets.
    pub fn allowed_from(&self) -> Vec<JobStatus> {
        let mut from = JobStatus::predecessors(self.status, self.actor);
        if self.actor == TransitionActor::Agent && self.status.is_in_flight() {
            from.push(self.status);
        }
        from
    }
}

/// Outcome of a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The change was written; `previous` is the status it replaced.
    Applied { previous: JobStatus },
    /// The requester's resubmission counter is outdated; nothing was written.
    Stale { current_resubmission: i32 },
    /// The state machine does not allow the change from `current`.
    Rejected { current: JobStatus },
    NotFound,
}

impl StatusUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied { .. })
    }
}

/// A job whose heartbeat is older than a sweep threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleJob {
    pub queue_id: i64,
    pub status: JobStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Upper bound on how early a periodic task may take its marker again.
const MARKER_SLACK_CAP: Duration = Duration::from_secs(30);

/// Marker age after which a task ticking every `interval` may run again.
///
/// A tenth of the interval (at most 30s) shorter than `interval`, so a tick
/// whose clock reading lands slightly earlier than the previous one is not
/// skipped. Other instances are still held off for almost a full interval.
pub fn marker_min_age(interval: Duration) -> Duration {
    interval - (interval / 10).min(MARKER_SLACK_CAP)
}

/// Which priority rows a batch run visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityScope {
    All,
    /// Only users with running cores or usage in the last 24 hours.
    ActiveOnly,
}

/// Queue-visible state of one CE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteQueue {
    pub ce: String,
    pub site: String,
    pub status: String,
    pub blocked: bool,
    pub assigned: i64,
    pub waiting: i64,
    pub status_changed_at: DateTime<Utc>,
}

/// One audit line of a job's trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub queue_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub tag: String,
    pub message: String,
}

/// Durable task queue access used by the broker, the liveness monitor and
/// the priority engine.
#[async_trait]
pub trait TaskQueueStore: Send + Sync {
    /// Fetches jobs by identifier; unknown identifiers are skipped.
    async fn get_jobs(&self, queue_ids: &[i64]) -> Result<Vec<Job>, StoreError>;

    /// Returns the best ranked aggregate satisfying `filter`.
    ///
    /// Ranking is effective priority descending, then price descending, then
    /// oldest job identifier ascending. Aggregates of users whose computed
    /// priority marks them over quota are never returned.
    async fn find_waiting_aggregate(
        &self,
        filter: &AggregateFilter,
    ) -> Result<Option<WaitingAggregate>, StoreError>;

    /// Atomically moves the oldest waiting job of `aggregate` to ASSIGNED.
    ///
    /// At most one row changes. `None` means a concurrent caller took the
    /// last candidate.
    async fn claim_waiting_job(
        &self,
        aggregate: &WaitingAggregate,
        target: &ClaimTarget,
    ) -> Result<Option<ClaimedJob>, StoreError>;

    /// Decrements an aggregate's waiting counter (never below zero) and
    /// records that a local agent just matched it.
    async fn decrement_aggregate(&self, entry_id: i64, local_match: bool) -> Result<(), StoreError>;

    /// Applies a resubmission-guarded status change; also refreshes the
    /// heartbeat when the change is applied.
    async fn update_job_status(&self, change: &StatusChange) -> Result<StatusUpdate, StoreError>;

    /// Refreshes the heartbeat of an in-flight job without changing its
    /// status. A `ZOMBIE` job is revived to `RUNNING`.
    ///
    /// Returns false when the counter is stale or the job is neither
    /// in flight nor a zombie.
    async fn touch_heartbeat(&self, queue_id: i64, resubmission: i32) -> Result<bool, StoreError>;

    /// Administrative override into a failure status, ignoring the
    /// resubmission counter.
    async fn force_job_status(
        &self,
        queue_id: i64,
        status: JobStatus,
    ) -> Result<StatusUpdate, StoreError>;

    /// Jobs in one of `statuses` whose last heartbeat is older than `older_than`.
    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<StaleJob>, StoreError>;

    /// Moves one job to `to` if it is still in one of `from` and its
    /// heartbeat is still older than `older_than`. Returns whether it moved.
    async fn transition_if_stale(
        &self,
        queue_id: i64,
        from: &[JobStatus],
        to: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Claims the right to run the periodic task `name` now.
    ///
    /// Succeeds only if the shared marker is older than `min_interval`, in
    /// which case the marker is moved to `now` in the same statement.
    async fn try_acquire_marker(
        &self,
        name: &str,
        owner: &str,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn priority_records(&self, scope: PriorityScope) -> Result<Vec<PriorityRecord>, StoreError>;

    /// Overwrites the derived priority fields of one user.
    async fn update_computed_priority(
        &self,
        user: &str,
        userload: f64,
        computed_priority: f64,
    ) -> Result<(), StoreError>;

    async fn site_queue(&self, ce: &str) -> Result<Option<SiteQueue>, StoreError>;

    /// Adds the deltas to a CE's assigned and waiting counters, creating the
    /// row if needed.
    async fn adjust_site_counters(
        &self,
        ce: &str,
        site: &str,
        assigned_delta: i64,
        waiting_delta: i64,
    ) -> Result<(), StoreError>;

    async fn set_site_queue_status(&self, ce: &str, site: &str, status: &str) -> Result<(), StoreError>;

    /// Operator action: blocks or unblocks a CE's queue.
    async fn set_site_queue_blocked(&self, ce: &str, blocked: bool) -> Result<(), StoreError>;
}

/// Append-only per-job audit trail.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn append_trace(&self, queue_id: i64, tag: &str, message: &str) -> Result<(), StoreError>;

    async fn job_trace(&self, queue_id: i64) -> Result<Vec<TraceEntry>, StoreError>;
}
