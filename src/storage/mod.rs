//! Task queue storage.
//!
//! This module provides the durable state the broker works against: jobs,
//! heartbeats, waiting aggregates, priority quotas, site queues, job traces
//! and task markers.
//!
//! # Overview
//!
//! - **Store**: the `TaskQueueStore` and `TraceSink` traits
//! - **Database**: PostgreSQL implementation with time-bounded statements
//! - **Memory**: in-process implementation with identical semantics
//! - **Migrations**: schema management and versioning
//!
//! # Usage
//!
//! ```rust,ignore
//! use grid_broker::storage::{PgTaskQueueStore, StoreTimeouts, TaskQueueStore};
//!
//! let store = PgTaskQueueStore::connect(&database_url, 10, StoreTimeouts::default()).await?;
//! store.run_migrations().await?;
//!
//! let jobs = store.get_jobs(&[42, 43]).await?;
//! ```

pub mod database;
pub mod filter;
pub mod memory;
pub mod migrations;
pub mod schema;
pub mod store;

pub use database::{PgTaskQueueStore, StoreTimeouts};
pub use filter::{effective_priority, rank, AggregateFilter, PackageCheck, RemoteCriteria};
pub use memory::MemoryTaskQueueStore;
pub use migrations::{migrations, AppliedMigration, Migration, MigrationError, MigrationRunner};
pub use store::{
    marker_min_age, ClaimTarget, ClaimedJob, PriorityScope, SiteQueue, StaleJob, StatusChange, StatusUpdate,
    TaskQueueStore, TraceEntry, TraceSink,
};
