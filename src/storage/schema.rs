//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the PostgreSQL task
//! queue backend. The submission and aggregation pipeline writes the same
//! tables; the broker only reads and mutates the columns it owns.

/// SQL schema for creating the queue table.
pub const CREATE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue (
    queue_id BIGSERIAL PRIMARY KEY,
    status VARCHAR(32) NOT NULL,
    user_name VARCHAR(255) NOT NULL,
    submit_host VARCHAR(255) NOT NULL,
    site VARCHAR(255),
    ce VARCHAR(255),
    exec_host VARCHAR(255),
    jdl TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    price DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    resubmission INTEGER NOT NULL DEFAULT 0,
    aggregate_id BIGINT,
    split BIGINT,
    master_job BOOLEAN NOT NULL DEFAULT FALSE,
    submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    assigned_at TIMESTAMPTZ
)
"#;

/// SQL schema for creating the queue_heartbeat table.
pub const CREATE_QUEUE_HEARTBEAT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_heartbeat (
    queue_id BIGINT PRIMARY KEY REFERENCES queue(queue_id) ON DELETE CASCADE,
    last_update TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the waiting_aggregate table.
pub const CREATE_WAITING_AGGREGATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS waiting_aggregate (
    entry_id BIGSERIAL PRIMARY KEY,
    counter BIGINT NOT NULL DEFAULT 0,
    user_name VARCHAR(255) NOT NULL,
    sites TEXT[] NOT NULL DEFAULT '{}',
    ces TEXT[] NOT NULL DEFAULT '{}',
    excluded_ces TEXT[] NOT NULL DEFAULT '{}',
    packages TEXT[] NOT NULL DEFAULT '{}',
    partitions TEXT[] NOT NULL DEFAULT '{}',
    excluded_partitions TEXT[] NOT NULL DEFAULT '{}',
    ttl BIGINT NOT NULL DEFAULT 0,
    disk BIGINT NOT NULL DEFAULT 0,
    priority DOUBLE PRECISION NOT NULL DEFAULT 0,
    price DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    oldest_queue_id BIGINT NOT NULL,
    remote_allowed BOOLEAN NOT NULL DEFAULT FALSE,
    remote_timeout_secs BIGINT,
    idle_since TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the priority_quota table.
pub const CREATE_PRIORITY_QUOTA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS priority_quota (
    user_name VARCHAR(255) PRIMARY KEY,
    priority DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    running BIGINT NOT NULL DEFAULT 0,
    max_parallel_jobs BIGINT NOT NULL DEFAULT 100,
    total_running_time_last24h BIGINT NOT NULL DEFAULT 0,
    max_total_running_time BIGINT NOT NULL DEFAULT 1000000,
    userload DOUBLE PRECISION NOT NULL DEFAULT 0,
    computed_priority DOUBLE PRECISION NOT NULL DEFAULT 1.0
)
"#;

/// SQL schema for creating the site_queue table.
pub const CREATE_SITE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS site_queue (
    ce VARCHAR(255) PRIMARY KEY,
    site VARCHAR(255) NOT NULL,
    status VARCHAR(64) NOT NULL DEFAULT 'open',
    blocked BOOLEAN NOT NULL DEFAULT FALSE,
    assigned BIGINT NOT NULL DEFAULT 0,
    waiting BIGINT NOT NULL DEFAULT 0,
    status_changed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the job_trace table.
pub const CREATE_JOB_TRACE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_trace (
    id BIGSERIAL PRIMARY KEY,
    queue_id BIGINT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    tag VARCHAR(64) NOT NULL,
    message TEXT NOT NULL
)
"#;

/// SQL schema for creating the task_markers table.
pub const CREATE_TASK_MARKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_markers (
    name VARCHAR(128) PRIMARY KEY,
    owner VARCHAR(255) NOT NULL,
    last_executed TIMESTAMPTZ NOT NULL
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_status ON queue(status);
CREATE INDEX IF NOT EXISTS idx_queue_aggregate_waiting ON queue(aggregate_id, queue_id) WHERE status = 'WAITING';
CREATE INDEX IF NOT EXISTS idx_queue_heartbeat_last_update ON queue_heartbeat(last_update);
CREATE INDEX IF NOT EXISTS idx_waiting_aggregate_counter ON waiting_aggregate(counter) WHERE counter > 0;
CREATE INDEX IF NOT EXISTS idx_waiting_aggregate_user ON waiting_aggregate(user_name);
CREATE INDEX IF NOT EXISTS idx_job_trace_queue_id ON job_trace(queue_id)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_QUEUE_TABLE,
        CREATE_QUEUE_HEARTBEAT_TABLE,
        CREATE_WAITING_AGGREGATE_TABLE,
        CREATE_PRIORITY_QUOTA_TABLE,
        CREATE_SITE_QUEUE_TABLE,
        CREATE_JOB_TRACE_TABLE,
        CREATE_TASK_MARKERS_TABLE,
        CREATE_INDEXES,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const QUEUE: &str = "queue";
    pub const QUEUE_HEARTBEAT: &str = "queue_heartbeat";
    pub const WAITING_AGGREGATE: &str = "waiting_aggregate";
    pub const PRIORITY_QUOTA: &str = "priority_quota";
    pub const SITE_QUEUE: &str = "site_queue";
    pub const JOB_TRACE: &str = "job_trace";
    pub const TASK_MARKERS: &str = "task_markers";

    /// All tables, in creation order.
    pub const ALL: [&str; 7] = [
        QUEUE,
        QUEUE_HEARTBEAT,
        WAITING_AGGREGATE,
        PRIORITY_QUOTA,
        SITE_QUEUE,
        JOB_TRACE,
        TASK_MARKERS,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 8);
        // Queue must come first (queue_heartbeat references it)
        assert!(statements[0].contains("TABLE IF NOT EXISTS queue ("));
        assert!(statements[1].contains("REFERENCES queue(queue_id)"));
        // Indexes should be last
        assert!(statements[7].contains("CREATE INDEX"));
    }

    #[test]
    fn test_every_table_has_a_create_statement() {
        let statements = all_schema_statements().join("\n");
        for table in tables::ALL {
            assert!(
                statements.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing {}",
                table
            );
        }
    }
}
