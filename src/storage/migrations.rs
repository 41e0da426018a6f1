//! Schema migrations for the PostgreSQL task queue.
//!
//! Each schema part is applied once, inside its own transaction, and
//! recorded by name in `_migrations`. Broker instances starting together
//! serialize on a transaction-scoped advisory lock, so a part is never
//! applied twice.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use super::schema;

/// Advisory lock key held while a part is applied.
const MIGRATION_LOCK_KEY: i64 = 0x6772_6964_6272_6b72;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration '{name}' failed: {reason}")]
    Failed { name: &'static str, reason: String },
}

/// One named schema part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    /// Statements in this part; the index part holds several.
    fn statements(&self) -> impl Iterator<Item = &'static str> {
        self.sql.split(';').map(str::trim).filter(|s| !s.is_empty())
    }
}

/// All parts in the order they must be applied.
pub fn migrations() -> Vec<Migration> {
    let names = [
        "0001_queue",
        "0002_queue_heartbeat",
        "0003_waiting_aggregate",
        "0004_priority_quota",
        "0005_site_queue",
        "0006_job_trace",
        "0007_task_markers",
        "0008_indexes",
    ];

    names
        .into_iter()
        .zip(schema::all_schema_statements())
        .map(|(name, sql)| Migration { name, sql })
        .collect()
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every pending part and returns the names applied by this call.
    pub async fn run_migrations(&self) -> Result<Vec<&'static str>, MigrationError> {
        self.ensure_migrations_table().await?;

        let mut applied = Vec::new();
        for migration in migrations() {
            if self.apply(&migration).await? {
                tracing::info!(migration = migration.name, "Applied migration");
                applied.push(migration.name);
            }
        }

        Ok(applied)
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                name VARCHAR(255) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Applies one part unless it is already recorded. Returns whether it ran.
    async fn apply(&self, migration: &Migration) -> Result<bool, MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let recorded: Option<(String,)> = sqlx::query_as("SELECT name FROM _migrations WHERE name = $1")
            .bind(migration.name)
            .fetch_optional(&mut *tx)
            .await?;

        if recorded.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }

        for statement in migration.statements() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| MigrationError::Failed {
                    name: migration.name,
                    reason: e.to_string(),
                })?;
        }

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_migrations_table().await?;

        let applied = sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_schema_part_is_named() {
        let all = migrations();
        assert_eq!(all.len(), schema::all_schema_statements().len());
        assert_eq!(all[0].name, "0001_queue");
        assert!(all[0].sql.contains("TABLE IF NOT EXISTS queue ("));
        assert_eq!(all[7].name, "0008_indexes");
    }

    #[test]
    fn test_index_part_splits_into_statements() {
        let indexes = migrations()[7];
        let statements: Vec<_> = indexes.statements().collect();
        assert_eq!(statements.len(), 6);
        assert!(statements.iter().all(|s| s.starts_with("CREATE INDEX IF NOT EXISTS")));
    }

    #[test]
    fn test_failure_names_the_part() {
        let err = MigrationError::Failed {
            name: "0005_site_queue",
            reason: "syntax error".to_string(),
        };
        assert_eq!(err.to_string(), "Migration '0005_site_queue' failed: syntax error");
    }
}
