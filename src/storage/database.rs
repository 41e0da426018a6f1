//! PostgreSQL task queue store.
//!
//! Every statement runs under a time bound: `query_timeout` for ordinary
//! reads and writes, `claim_timeout` for the claim. An elapsed bound is a
//! `StoreError::Timeout` and is never retried here.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::error::StoreError;
use crate::job::{Job, JobOwner, JobStatus, WaitingAggregate};
use crate::priority::PriorityRecord;

use super::filter::{AggregateFilter, PackageCheck};
use super::migrations::{AppliedMigration, MigrationRunner};
use super::store::{
    ClaimTarget, ClaimedJob, PriorityScope, SiteQueue, StaleJob, StatusChange, StatusUpdate,
    TaskQueueStore, TraceEntry, TraceSink,
};

/// Time bounds applied to store statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreTimeouts {
    pub query_timeout: Duration,
    pub claim_timeout: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            claim_timeout: Duration::from_secs(120),
        }
    }
}

/// PostgreSQL implementation of `TaskQueueStore` and `TraceSink`.
pub struct PgTaskQueueStore {
    pool: PgPool,
    timeouts: StoreTimeouts,
}

const JOB_COLUMNS: &str = r#"
    q.queue_id, q.status, q.user_name, q.submit_host, q.site, q.ce, q.exec_host, q.jdl,
    q.priority, q.price, q.resubmission, q.aggregate_id, q.split, q.master_job,
    q.submitted_at, h.last_update
"#;

const AGGREGATE_COLUMNS: &str = r#"
    a.entry_id, a.counter, a.user_name, a.sites, a.ces, a.excluded_ces, a.packages,
    a.partitions, a.excluded_partitions, a.ttl, a.disk, a.priority, a.price,
    a.oldest_queue_id, a.remote_allowed, a.remote_timeout_secs, a.idle_since
"#;

impl PgTaskQueueStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `max_connections` - Upper bound of the connection pool
    /// * `timeouts` - Statement time bounds
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        timeouts: StoreTimeouts,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(timeouts.query_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self { pool, timeouts })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool, timeouts: StoreTimeouts) -> Self {
        Self { pool, timeouts }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending schema parts and returns the names applied.
    pub async fn run_migrations(&self) -> Result<Vec<&'static str>, StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.applied_migrations().await?)
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        bounded(operation, self.timeouts.query_timeout, fut).await
    }

    async fn current_status(&self, queue_id: i64) -> Result<Option<(JobStatus, i32)>, StoreError> {
        let row = self
            .bounded(
                "current_status",
                sqlx::query("SELECT status, resubmission FROM queue WHERE queue_id = $1")
                    .bind(queue_id)
                    .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(r) => {
                let status = parse_status(r.get("status"))?;
                Ok(Some((status, r.get("resubmission"))))
            }
            None => Ok(None),
        }
    }

    /// Explains why a guarded update changed nothing.
    async fn classify_miss(&self, queue_id: i64, resubmission: Option<i32>) -> Result<StatusUpdate, StoreError> {
        Ok(match self.current_status(queue_id).await? {
            None => StatusUpdate::NotFound,
            Some((_, current)) if resubmission.is_some_and(|r| r != current) => {
                StatusUpdate::Stale {
                    current_resubmission: current,
                }
            }
            Some((status, _)) => StatusUpdate::Rejected { current: status },
        })
    }
}

async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout { operation, timeout }),
    }
}

fn parse_status(raw: String) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|e: crate::job::status::UnknownStatus| StoreError::Corrupt(e.to_string()))
}

fn status_names(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    Ok(Job {
        queue_id: row.get("queue_id"),
        status: parse_status(row.get("status"))?,
        owner: JobOwner {
            user: row.get("user_name"),
            submit_host: row.get("submit_host"),
        },
        site: row.get("site"),
        ce: row.get("ce"),
        exec_host: row.get("exec_host"),
        jdl: row.get("jdl"),
        priority: row.get("priority"),
        price: row.get("price"),
        resubmission: row.get("resubmission"),
        aggregate_id: row.get("aggregate_id"),
        split: row.get("split"),
        master_job: row.get("master_job"),
        submitted_at: row.get("submitted_at"),
        last_heartbeat: row.get("last_update"),
    })
}

fn aggregate_from_row(row: &PgRow) -> WaitingAggregate {
    WaitingAggregate {
        entry_id: row.get("entry_id"),
        counter: row.get("counter"),
        user: row.get("user_name"),
        sites: row.get("sites"),
        ces: row.get("ces"),
        excluded_ces: row.get("excluded_ces"),
        packages: row.get("packages"),
        partitions: row.get("partitions"),
        excluded_partitions: row.get("excluded_partitions"),
        ttl: row.get("ttl"),
        disk: row.get("disk"),
        priority: row.get("priority"),
        price: row.get("price"),
        oldest_queue_id: row.get("oldest_queue_id"),
        remote_allowed: row.get("remote_allowed"),
        remote_timeout_secs: row.get("remote_timeout_secs"),
        idle_since: row.get("idle_since"),
    }
}

fn priority_from_row(row: &PgRow) -> PriorityRecord {
    PriorityRecord {
        user: row.get("user_name"),
        priority: row.get("priority"),
        running: row.get("running"),
        max_parallel_jobs: row.get("max_parallel_jobs"),
        total_running_time_last24h: row.get("total_running_time_last24h"),
        max_total_running_time: row.get("max_total_running_time"),
        userload: row.get("userload"),
        computed_priority: row.get("computed_priority"),
    }
}

/// Builds the aggregate lookup for `filter`.
///
/// Parameters `$1` and `$2` are always the TTL and disk ceilings; the rest
/// are numbered in the order `bind_aggregate_filter` binds them.
fn aggregate_query(filter: &AggregateFilter) -> String {
    let mut conditions = vec![
        "a.counter > 0".to_string(),
        "a.ttl <= $1".to_string(),
        "a.disk <= $2".to_string(),
        "(p.user_name IS NULL OR p.computed_priority > 0)".to_string(),
    ];
    let mut param_idx = 3;

    if filter.ce.is_some() {
        conditions.push(format!(
            "((cardinality(a.ces) = 0 OR ${i} = ANY(a.ces)) AND NOT (${i} = ANY(a.excluded_ces)))",
            i = param_idx
        ));
        param_idx += 1;
    }

    if filter.site.is_some() {
        conditions.push(format!(
            "(cardinality(a.sites) = 0 OR a.sites && ${})",
            param_idx
        ));
        param_idx += 1;
    }

    if filter.partitions.is_some() {
        conditions.push(format!(
            "((cardinality(a.partitions) = 0 OR a.partitions && ${i}) AND NOT (a.excluded_partitions && ${i}))",
            i = param_idx
        ));
        param_idx += 1;
    }

    if !filter.allowed_users.is_empty() {
        conditions.push(format!("a.user_name = ANY(${})", param_idx));
        param_idx += 1;
    }

    if !filter.denied_users.is_empty() {
        conditions.push(format!("NOT (a.user_name = ANY(${}))", param_idx));
        param_idx += 1;
    }

    if matches!(filter.packages, PackageCheck::Installed(_)) {
        conditions.push(format!("a.packages <@ ${}", param_idx));
        param_idx += 1;
    }

    if filter.remote.is_some() {
        conditions.push(format!(
            "(a.remote_allowed AND a.idle_since <= ${} - make_interval(secs => COALESCE(a.remote_timeout_secs, ${})::double precision))",
            param_idx,
            param_idx + 1
        ));
    }

    format!(
        r#"
        SELECT {columns}
        FROM waiting_aggregate a
        LEFT JOIN priority_quota p ON p.user_name = a.user_name
        WHERE {conditions}
        ORDER BY COALESCE(p.computed_priority, a.priority) DESC, a.price DESC, a.oldest_queue_id ASC
        LIMIT 1
        "#,
        columns = AGGREGATE_COLUMNS,
        conditions = conditions.join(" AND ")
    )
}

#[async_trait]
impl TaskQueueStore for PgTaskQueueStore {
    async fn get_jobs(&self, queue_ids: &[i64]) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM queue q
            LEFT JOIN queue_heartbeat h ON h.queue_id = q.queue_id
            WHERE q.queue_id = ANY($1)
            ORDER BY q.queue_id
            "#,
            JOB_COLUMNS
        );

        let rows = self
            .bounded(
                "get_jobs",
                sqlx::query(&query)
                    .bind(queue_ids.to_vec())
                    .fetch_all(&self.pool),
            )
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn find_waiting_aggregate(
        &self,
        filter: &AggregateFilter,
    ) -> Result<Option<WaitingAggregate>, StoreError> {
        let query = aggregate_query(filter);

        let mut sqlx_query = sqlx::query(&query).bind(filter.ttl).bind(filter.disk);

        if let Some(ref ce) = filter.ce {
            sqlx_query = sqlx_query.bind(ce);
        }

        if let Some(ref site) = filter.site {
            let mut sites = vec![site.clone()];
            sites.extend(filter.extra_sites.iter().cloned());
            sqlx_query = sqlx_query.bind(sites);
        }

        if let Some(ref partitions) = filter.partitions {
            sqlx_query = sqlx_query.bind(partitions.clone());
        }

        if !filter.allowed_users.is_empty() {
            sqlx_query = sqlx_query.bind(filter.allowed_users.clone());
        }

        if !filter.denied_users.is_empty() {
            sqlx_query = sqlx_query.bind(filter.denied_users.clone());
        }

        if let PackageCheck::Installed(ref installed) = filter.packages {
            sqlx_query = sqlx_query.bind(installed.iter().cloned().collect::<Vec<String>>());
        }

        if let Some(ref remote) = filter.remote {
            sqlx_query = sqlx_query.bind(remote.now).bind(remote.default_timeout_secs);
        }

        let row = self
            .bounded("find_waiting_aggregate", sqlx_query.fetch_optional(&self.pool))
            .await?;

        Ok(row.as_ref().map(aggregate_from_row))
    }

    async fn claim_waiting_job(
        &self,
        aggregate: &WaitingAggregate,
        target: &ClaimTarget,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        // One statement: pick the oldest waiting row of the aggregate, skip
        // rows another claimer holds, flip it to ASSIGNED and seed its
        // heartbeat. Zero rows back means someone else won.
        let claim = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT queue_id
                FROM queue
                WHERE status = 'WAITING' AND aggregate_id = $1
                ORDER BY queue_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE queue q
                SET status = 'ASSIGNED',
                    site = $2,
                    ce = $3,
                    exec_host = $4,
                    resubmission = q.resubmission + 1,
                    assigned_at = NOW()
                FROM candidate
                WHERE q.queue_id = candidate.queue_id AND q.status = 'WAITING'
                RETURNING q.queue_id, q.resubmission, q.user_name, q.submit_host, q.jdl
            ),
            heartbeat AS (
                INSERT INTO queue_heartbeat (queue_id, last_update)
                SELECT queue_id, NOW() FROM claimed
                ON CONFLICT (queue_id) DO UPDATE SET last_update = EXCLUDED.last_update
            )
            SELECT queue_id, resubmission, user_name, submit_host, jdl FROM claimed
            "#,
        )
        .bind(aggregate.entry_id)
        .bind(&target.site)
        .bind(&target.ce)
        .bind(&target.host)
        .fetch_optional(&self.pool);

        let row = bounded("claim_waiting_job", self.timeouts.claim_timeout, claim).await?;

        Ok(row.map(|r| ClaimedJob {
            queue_id: r.get("queue_id"),
            resubmission: r.get("resubmission"),
            owner: JobOwner {
                user: r.get("user_name"),
                submit_host: r.get("submit_host"),
            },
            jdl: r.get("jdl"),
            aggregate_id: aggregate.entry_id,
        }))
    }

    async fn decrement_aggregate(&self, entry_id: i64, local_match: bool) -> Result<(), StoreError> {
        self.bounded(
            "decrement_aggregate",
            sqlx::query(
                r#"
                UPDATE waiting_aggregate
                SET counter = GREATEST(counter - 1, 0),
                    idle_since = CASE WHEN $2 THEN NOW() ELSE idle_since END
                WHERE entry_id = $1
                "#,
            )
            .bind(entry_id)
            .bind(local_match)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn update_job_status(&self, change: &StatusChange) -> Result<StatusUpdate, StoreError> {
        let allowed = change.allowed_from();
        if allowed.is_empty() {
            return self.classify_miss(change.queue_id, Some(change.resubmission)).await;
        }

        let row = self
            .bounded(
                "update_job_status",
                sqlx::query(
                    r#"
                    WITH updated AS (
                        UPDATE queue q
                        SET status = $3
                        FROM (SELECT queue_id, status FROM queue WHERE queue_id = $1 FOR UPDATE) old
                        WHERE q.queue_id = old.queue_id
                          AND q.resubmission = $2
                          AND q.status = ANY($4)
                        RETURNING q.queue_id, old.status AS previous
                    ),
                    heartbeat AS (
                        INSERT INTO queue_heartbeat (queue_id, last_update)
                        SELECT queue_id, NOW() FROM updated
                        ON CONFLICT (queue_id) DO UPDATE SET last_update = EXCLUDED.last_update
                    )
                    SELECT previous FROM updated
                    "#,
                )
                .bind(change.queue_id)
                .bind(change.resubmission)
                .bind(change.status.as_str())
                .bind(status_names(&allowed))
                .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(r) => Ok(StatusUpdate::Applied {
                previous: parse_status(r.get("previous"))?,
            }),
            None => self.classify_miss(change.queue_id, Some(change.resubmission)).await,
        }
    }

    async fn touch_heartbeat(&self, queue_id: i64, resubmission: i32) -> Result<bool, StoreError> {
        let mut accepting = JobStatus::IN_FLIGHT.to_vec();
        accepting.push(JobStatus::Zombie);

        // One statement: revive a zombie to RUNNING, then upsert the heartbeat
        // for whichever row qualified.
        let result = self
            .bounded(
                "touch_heartbeat",
                sqlx::query(
                    r#"
                    WITH alive AS (
                        UPDATE queue
                        SET status = CASE WHEN status = $4 THEN $5 ELSE status END
                        WHERE queue_id = $1 AND resubmission = $2 AND status = ANY($3)
                        RETURNING queue_id
                    )
                    INSERT INTO queue_heartbeat (queue_id, last_update)
                    SELECT queue_id, NOW() FROM alive
                    ON CONFLICT (queue_id) DO UPDATE SET last_update = EXCLUDED.last_update
                    "#,
                )
                .bind(queue_id)
                .bind(resubmission)
                .bind(status_names(&accepting))
                .bind(JobStatus::Zombie.as_str())
                .bind(JobStatus::Running.as_str())
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn force_job_status(
        &self,
        queue_id: i64,
        status: JobStatus,
    ) -> Result<StatusUpdate, StoreError> {
        if !status.is_failure() {
            return self.classify_miss(queue_id, None).await;
        }

        let row = self
            .bounded(
                "force_job_status",
                sqlx::query(
                    r#"
                    UPDATE queue q
                    SET status = $2
                    FROM (SELECT queue_id, status FROM queue WHERE queue_id = $1 FOR UPDATE) old
                    WHERE q.queue_id = old.queue_id AND q.status <> $2
                    RETURNING old.status AS previous
                    "#,
                )
                .bind(queue_id)
                .bind(status.as_str())
                .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(r) => Ok(StatusUpdate::Applied {
                previous: parse_status(r.get("previous"))?,
            }),
            None => self.classify_miss(queue_id, None).await,
        }
    }

    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        older_than: DateTime<Utc>,
    ) -> Result<Vec<StaleJob>, StoreError> {
        let rows = self
            .bounded(
                "stale_jobs",
                sqlx::query(
                    r#"
                    SELECT q.queue_id, q.status, h.last_update
                    FROM queue q
                    LEFT JOIN queue_heartbeat h ON h.queue_id = q.queue_id
                    WHERE q.status = ANY($1)
                      AND COALESCE(h.last_update, q.assigned_at, q.submitted_at) < $2
                    ORDER BY q.queue_id
                    "#,
                )
                .bind(status_names(statuses))
                .bind(older_than)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.iter()
            .map(|r| {
                Ok(StaleJob {
                    queue_id: r.get("queue_id"),
                    status: parse_status(r.get("status"))?,
                    last_heartbeat: r.get("last_update"),
                })
            })
            .collect()
    }

    async fn transition_if_stale(
        &self,
        queue_id: i64,
        from: &[JobStatus],
        to: JobStatus,
        older_than: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .bounded(
                "transition_if_stale",
                sqlx::query(
                    r#"
                    UPDATE queue q
                    SET status = $3
                    WHERE q.queue_id = $1
                      AND q.status = ANY($2)
                      AND COALESCE(
                            (SELECT h.last_update FROM queue_heartbeat h WHERE h.queue_id = q.queue_id),
                            q.assigned_at,
                            q.submitted_at
                          ) < $4
                    "#,
                )
                .bind(queue_id)
                .bind(status_names(from))
                .bind(to.as_str())
                .bind(older_than)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() == 1)
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

        let result = self
            .bounded(
                "try_acquire_marker",
                sqlx::query(
                    r#"
                    INSERT INTO task_markers (name, owner, last_executed)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (name) DO UPDATE
                    SET owner = EXCLUDED.owner, last_executed = EXCLUDED.last_executed
                    WHERE task_markers.last_executed <= $4
                    "#,
                )
                .bind(name)
                .bind(owner)
                .bind(now)
                .bind(now - interval)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn priority_records(&self, scope: PriorityScope) -> Result<Vec<PriorityRecord>, StoreError> {
        let rows = self
            .bounded(
                "priority_records",
                sqlx::query(
                    r#"
                    SELECT user_name, priority, running, max_parallel_jobs,
                           total_running_time_last24h, max_total_running_time,
                           userload, computed_priority
                    FROM priority_quota
                    WHERE $1 = FALSE OR running > 0 OR total_running_time_last24h > 0
                    ORDER BY user_name
                    "#,
                )
                .bind(scope == PriorityScope::ActiveOnly)
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(rows.iter().map(priority_from_row).collect())
    }

    async fn update_computed_priority(
        &self,
        user: &str,
        userload: f64,
        computed_priority: f64,
    ) -> Result<(), StoreError> {
        let result = self
            .bounded(
                "update_computed_priority",
                sqlx::query(
                    "UPDATE priority_quota SET userload = $2, computed_priority = $3 WHERE user_name = $1",
                )
                .bind(user)
                .bind(userload)
                .bind(computed_priority)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Priority record {}", user)));
        }

        Ok(())
    }

    async fn site_queue(&self, ce: &str) -> Result<Option<SiteQueue>, StoreError> {
        let row = self
            .bounded(
                "site_queue",
                sqlx::query(
                    r#"
                    SELECT ce, site, status, blocked, assigned, waiting, status_changed_at
                    FROM site_queue
                    WHERE ce = $1
                    "#,
                )
                .bind(ce)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(|r| SiteQueue {
            ce: r.get("ce"),
            site: r.get("site"),
            status: r.get("status"),
            blocked: r.get("blocked"),
            assigned: r.get("assigned"),
            waiting: r.get("waiting"),
            status_changed_at: r.get("status_changed_at"),
        }))
    }

    async fn adjust_site_counters(
        &self,
        ce: &str,
        site: &str,
        assigned_delta: i64,
        waiting_delta: i64,
    ) -> Result<(), StoreError> {
        self.bounded(
            "adjust_site_counters",
            sqlx::query(
                r#"
                INSERT INTO site_queue (ce, site, assigned, waiting)
                VALUES ($1, $2, GREATEST($3, 0), GREATEST($4, 0))
                ON CONFLICT (ce) DO UPDATE
                SET site = EXCLUDED.site,
                    assigned = GREATEST(site_queue.assigned + $3, 0),
                    waiting = GREATEST(site_queue.waiting + $4, 0)
                "#,
            )
            .bind(ce)
            .bind(site)
            .bind(assigned_delta)
            .bind(waiting_delta)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn set_site_queue_status(&self, ce: &str, site: &str, status: &str) -> Result<(), StoreError> {
        self.bounded(
            "set_site_queue_status",
            sqlx::query(
                r#"
                INSERT INTO site_queue (ce, site, status)
                VALUES ($1, $2, $3)
                ON CONFLICT (ce) DO UPDATE
                SET status = EXCLUDED.status,
                    status_changed_at = CASE
                        WHEN site_queue.status <> EXCLUDED.status THEN NOW()
                        ELSE site_queue.status_changed_at
                    END
                "#,
            )
            .bind(ce)
            .bind(site)
            .bind(status)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn set_site_queue_blocked(&self, ce: &str, blocked: bool) -> Result<(), StoreError> {
        self.bounded(
            "set_site_queue_blocked",
            sqlx::query(
                r#"
                INSERT INTO site_queue (ce, site, blocked, status)
                VALUES ($1, '', $2, CASE WHEN $2 THEN 'blocked' ELSE 'open' END)
                ON CONFLICT (ce) DO UPDATE
                SET blocked = EXCLUDED.blocked,
                    status = EXCLUDED.status,
                    status_changed_at = NOW()
                "#,
            )
            .bind(ce)
            .bind(blocked)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TraceSink for PgTaskQueueStore {
    async fn append_trace(&self, queue_id: i64, tag: &str, message: &str) -> Result<(), StoreError> {
        self.bounded(
            "append_trace",
            sqlx::query("INSERT INTO job_trace (queue_id, tag, message) VALUES ($1, $2, $3)")
                .bind(queue_id)
                .bind(tag)
                .bind(message)
                .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn job_trace(&self, queue_id: i64) -> Result<Vec<TraceEntry>, StoreError> {
        let rows = self
            .bounded(
                "job_trace",
                sqlx::query(
                    "SELECT queue_id, recorded_at, tag, message FROM job_trace WHERE queue_id = $1 ORDER BY id",
                )
                .bind(queue_id)
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| TraceEntry {
                queue_id: r.get("queue_id"),
                recorded_at: r.get("recorded_at"),
                tag: r.get("tag"),
                message: r.get("message"),
            })
            .collect())
    }
}
