//! In-process task queue store.
//!
//! All tables sit behind one `tokio::sync::Mutex`, so every trait method is
//! a single critical section and observes the same atomicity the SQL
//! statements give the PostgreSQL store. Used by tests and by embedders
//! that run the broker without a database.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::job::{Job, JobStatus, WaitingAggregate};
use crate::priority::PriorityRecord;

use super::filter::{effective_priority, rank, AggregateFilter};
use super::store::{
    ClaimTarget, ClaimedJob, PriorityScope, SiteQueue, StaleJob, StatusChange, StatusUpdate,
    TaskQueueStore, TraceEntry, TraceSink,
};

#[derive(Default)]
struct Tables {
    jobs: BTreeMap<i64, Job>,
    aggregates: BTreeMap<i64, WaitingAggregate>,
    priorities: BTreeMap<String, PriorityRecord>,
    site_queues: BTreeMap<String, SiteQueue>,
    traces: Vec<TraceEntry>,
    markers: HashMap<String, (String, DateTime<Utc>)>,
}

impl Tables {
    fn heartbeat_of(job: &Job) -> DateTime<Utc> {
        job.last_heartbeat.unwrap_or(job.submitted_at)
    }

    fn miss(&self, queue_id: i64, resubmission: Option<i32>) -> StatusUpdate {
        match self.jobs.get(&queue_id) {
            None => StatusUpdate::NotFound,
            Some(job) if resubmission.is_some_and(|r| r != job.resubmission) => StatusUpdate::Stale {
                current_resubmission: job.resubmission,
            },
            Some(job) => StatusUpdate::Rejected { current: job.status },
        }
    }
}

/// `TaskQueueStore` and `TraceSink` over in-memory tables.
#[derive(Default)]
pub struct MemoryTaskQueueStore {
    tables: Mutex<Tables>,
}

impl MemoryTaskQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a job row.
    pub async fn insert_job(&self, job: Job) {
        self.tables.lock().await.jobs.insert(job.queue_id, job);
    }

    /// Inserts or replaces a waiting aggregate.
    pub async fn insert_aggregate(&self, aggregate: WaitingAggregate) {
        self.tables
            .lock()
            .await
            .aggregates
            .insert(aggregate.entry_id, aggregate);
    }

    /// Inserts or replaces a user's priority row.
    pub async fn upsert_priority(&self, record: PriorityRecord) {
        self.tables
            .lock()
            .await
            .priorities
            .insert(record.user.clone(), record);
    }

    /// Overwrites a job's last heartbeat.
    pub async fn set_heartbeat(&self, queue_id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let job = tables
            .jobs
            .get_mut(&queue_id)
            .ok_or_else(|| StoreError::NotFound(format!("Job {}", queue_id)))?;
        job.last_heartbeat = Some(at);
        Ok(())
    }

    pub async fn job(&self, queue_id: i64) -> Option<Job> {
        self.tables.lock().await.jobs.get(&queue_id).cloned()
    }

    pub async fn aggregate(&self, entry_id: i64) -> Option<WaitingAggregate> {
        self.tables.lock().await.aggregates.get(&entry_id).cloned()
    }

    pub async fn priority(&self, user: &str) -> Option<PriorityRecord> {
        self.tables.lock().await.priorities.get(user).cloned()
    }
}

#[async_trait]
impl TaskQueueStore for MemoryTaskQueueStore {
    async fn get_jobs(&self, queue_ids: &[i64]) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<Job> = queue_ids
            .iter()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect();
        jobs.sort_by_key(|j| j.queue_id);
        jobs.dedup_by_key(|j| j.queue_id);
        Ok(jobs)
    }

    async fn find_waiting_aggregate(
        &self,
        filter: &AggregateFilter,
    ) -> Result<Option<WaitingAggregate>, StoreError> {
        let tables = self.tables.lock().await;

        let best = tables
            .aggregates
            .values()
            .filter(|agg| filter.matches(agg))
            .filter_map(|agg| {
                effective_priority(agg, tables.priorities.get(&agg.user)).map(|p| (p, agg))
            })
            .min_by(|a, b| rank(*a, *b))
            .map(|(_, agg)| agg.clone());

        Ok(best)
    }

    async fn claim_waiting_job(
        &self,
        aggregate: &WaitingAggregate,
        target: &ClaimTarget,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let mut tables = self.tables.lock().await;

        let candidate = tables
            .jobs
            .values_mut()
            .find(|j| j.status == JobStatus::Waiting && j.aggregate_id == Some(aggregate.entry_id));

        let Some(job) = candidate else {
            return Ok(None);
        };

        job.status = JobStatus::Assigned;
        job.site = Some(target.site.clone());
        job.ce = Some(target.ce.clone());
        job.exec_host = Some(target.host.clone());
        job.resubmission += 1;
        job.last_heartbeat = Some(Utc::now());

        Ok(Some(ClaimedJob {
            queue_id: job.queue_id,
            resubmission: job.resubmission,
            owner: job.owner.clone(),
            jdl: job.jdl.clone(),
            aggregate_id: aggregate.entry_id,
        }))
    }

    async fn decrement_aggregate(&self, entry_id: i64, local_match: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(agg) = tables.aggregates.get_mut(&entry_id) {
            agg.counter = (agg.counter - 1).max(0);
            if local_match {
                agg.idle_since = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_job_status(&self, change: &StatusChange) -> Result<StatusUpdate, StoreError> {
        let allowed = change.allowed_from();
        let mut tables = self.tables.lock().await;

        match tables.jobs.get_mut(&change.queue_id) {
            Some(job)
                if job.resubmission == change.resubmission && allowed.contains(&job.status) =>
            {
                let previous = job.status;
                job.status = change.status;
                job.last_heartbeat = Some(Utc::now());
                Ok(StatusUpdate::Applied { previous })
            }
            _ => Ok(tables.miss(change.queue_id, Some(change.resubmission))),
        }
    }

    async fn touch_heartbeat(&self, queue_id: i64, resubmission: i32) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.get_mut(&queue_id) {
            Some(job) if job.resubmission == resubmission && job.status.is_in_flight() => {
                job.last_heartbeat = Some(Utc::now());
                Ok(true)
            }
            Some(job) if job.resubmission == resubmission && job.status == JobStatus::Zombie => {
                job.status = JobStatus::Running;
                job.last_heartbeat = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_job_status(
        &self,
        queue_id: i64,
        status: JobStatus,
    ) -> Result<StatusUpdate, StoreError> {
        let mut tables = self.tables.lock().await;

        match tables.jobs.get_mut(&queue_id) {
            Some(job) if job.status.can_force(status) => {
                let previous = job.status;
                job.status = status;
                Ok(StatusUpdate::Applied { previous })
            }
            _ => Ok(tables.miss(queue_id, None)),
        }
    }

    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<StaleJob>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status) && Tables::heartbeat_of(j) < older_than)
            .map(|j| StaleJob {
                queue_id: j.queue_id,
                status: j.status,
                last_heartbeat: j.last_heartbeat,
            })
            .collect())
    }

    async fn transition_if_stale(
        &self,
        queue_id: i64,
        from: &[JobStatus],
        to: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.jobs.get_mut(&queue_id) {
            Some(job) if from.contains(&job.status) && Tables::heartbeat_of(job) < older_than => {
                job.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_acquire_marker(
        &self,
        name: &str,
        owner: &str,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let interval = chrono::Duration::from_std(min_interval)
            .map_err(|e| StoreError::Corrupt(format!("marker interval: {}", e)))?;

        let mut tables = self.tables.lock().await;
        let due = match tables.markers.get(name) {
            Some((_, last)) => *last <= now - interval,
            None => true,
        };

        if due {
            tables
                .markers
                .insert(name.to_string(), (owner.to_string(), now));
        }
        Ok(due)
    }

    async fn priority_records(&self, scope: PriorityScope) -> Result<Vec<PriorityRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .priorities
            .values()
            .filter(|r| scope == PriorityScope::All || r.has_recent_usage())
            .cloned()
            .collect())
    }

    async fn update_computed_priority(
        &self,
        user: &str,
        userload: f64,
        computed_priority: f64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .priorities
            .get_mut(user)
            .ok_or_else(|| StoreError::NotFound(format!("Priority record {}", user)))?;
        record.userload = userload;
        record.computed_priority = computed_priority;
        Ok(())
    }

    async fn site_queue(&self, ce: &str) -> Result<Option<SiteQueue>, StoreError> {
        Ok(self.tables.lock().await.site_queues.get(ce).cloned())
    }

    async fn adjust_site_counters(
        &self,
        ce: &str,
        site: &str,
        assigned_delta: i64,
        waiting_delta: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let queue = tables
            .site_queues
            .entry(ce.to_string())
            .or_insert_with(|| new_site_queue(ce, site));
        queue.site = site.to_string();
        queue.assigned = (queue.assigned + assigned_delta).max(0);
        queue.waiting = (queue.waiting + waiting_delta).max(0);
        Ok(())
    }

    async fn set_site_queue_status(&self, ce: &str, site: &str, status: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let queue = tables
            .site_queues
            .entry(ce.to_string())
            .or_insert_with(|| new_site_queue(ce, site));
        if queue.status != status {
            queue.status = status.to_string();
            queue.status_changed_at = Utc::now();
        }
        Ok(())
    }

    async fn set_site_queue_blocked(&self, ce: &str, blocked: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let queue = tables
            .site_queues
            .entry(ce.to_string())
            .or_insert_with(|| new_site_queue(ce, ""));
        queue.blocked = blocked;
        queue.status = if blocked { "blocked" } else { "open" }.to_string();
        queue.status_changed_at = Utc::now();
        Ok(())
    }
}

fn new_site_queue(ce: &str, site: &str) -> SiteQueue {
    SiteQueue {
        ce: ce.to_string(),
        site: site.to_string(),
        status: "open".to_string(),
        blocked: false,
        assigned: 0,
        waiting: 0,
        status_changed_at: Utc::now(),
    }
}

#[async_trait]
impl TraceSink for MemoryTaskQueueStore {
    async fn append_trace(&self, queue_id: i64, tag: &str, message: &str) -> Result<(), StoreError> {
        self.tables.lock().await.traces.push(TraceEntry {
            queue_id,
            recorded_at: Utc::now(),
            tag: tag.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn job_trace(&self, queue_id: i64) -> Result<Vec<TraceEntry>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .traces
            .iter()
            .filter(|t| t.queue_id == queue_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOwner, TransitionActor};

    fn target() -> ClaimTarget {
        ClaimTarget {
            site: "CERN".to_string(),
            ce: "ALICE::CERN::LCG".to_string(),
            host: "wn001.cern.ch".to_string(),
        }
    }

    async fn seeded() -> MemoryTaskQueueStore {
        let store = MemoryTaskQueueStore::new();
        store
            .insert_aggregate(WaitingAggregate::new(1, "alice", 10).with_counter(2))
            .await;
        for id in [11, 10] {
            store
                .insert_job(Job::new(id, JobOwner::new("alice", "submit.cern.ch"), "jdl").with_aggregate(1))
                .await;
        }
        store
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_and_bumps_resubmission() {
        let store = seeded().await;
        let agg = store.aggregate(1).await.unwrap();

        let claimed = store.claim_waiting_job(&agg, &target()).await.unwrap().unwrap();
        assert_eq!(claimed.queue_id, 10);
        assert_eq!(claimed.resubmission, 1);

        let job = store.job(10).await.unwrap();
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.exec_host.as_deref(), Some("wn001.cern.ch"));
        assert!(job.last_heartbeat.is_some());

        let second = store.claim_waiting_job(&agg, &target()).await.unwrap().unwrap();
        assert_eq!(second.queue_id, 11);
        assert!(store.claim_waiting_job(&agg, &target()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_decrement_never_goes_negative() {
        let store = seeded().await;
        for _ in 0..4 {
            store.decrement_aggregate(1, true).await.unwrap();
        }
        assert_eq!(store.aggregate(1).await.unwrap().counter, 0);
    }

    #[tokio::test]
    async fn test_stale_resubmission_is_not_applied() {
        let store = seeded().await;
        let agg = store.aggregate(1).await.unwrap();
        store.claim_waiting_job(&agg, &target()).await.unwrap();

        let stale = StatusChange::new(10, 0, JobStatus::Started, TransitionActor::Agent);
        assert_eq!(
            store.update_job_status(&stale).await.unwrap(),
            StatusUpdate::Stale {
                current_resubmission: 1
            }
        );
        assert_eq!(store.job(10).await.unwrap().status, JobStatus::Assigned);

        let fresh = StatusChange::new(10, 1, JobStatus::Started, TransitionActor::Agent);
        assert!(store.update_job_status(&fresh).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let store = seeded().await;
        let change = StatusChange::new(10, 0, JobStatus::Done, TransitionActor::Agent);
        assert_eq!(
            store.update_job_status(&change).await.unwrap(),
            StatusUpdate::Rejected {
                current: JobStatus::Waiting
            }
        );
        assert_eq!(
            store
                .update_job_status(&StatusChange::new(99, 0, JobStatus::Done, TransitionActor::Agent))
                .await
                .unwrap(),
            StatusUpdate::NotFound
        );
    }

    #[tokio::test]
    async fn test_marker_is_exclusive_within_interval() {
        let store = MemoryTaskQueueStore::new();
        let now = Utc::now();
        let interval = Duration::from_secs(300);

        assert!(store.try_acquire_marker("sweep", "a", interval, now).await.unwrap());
        assert!(!store.try_acquire_marker("sweep", "b", interval, now).await.unwrap());
        assert!(
            store
                .try_acquire_marker("sweep", "b", interval, now + chrono::Duration::seconds(300))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_site_counters_clamp_at_zero() {
        let store = MemoryTaskQueueStore::new();
        store
            .adjust_site_counters("ALICE::CERN::LCG", "CERN", 1, -1)
            .await
            .unwrap();

        let queue = store.site_queue("ALICE::CERN::LCG").await.unwrap().unwrap();
        assert_eq!(queue.assigned, 1);
        assert_eq!(queue.waiting, 0);
    }
}
