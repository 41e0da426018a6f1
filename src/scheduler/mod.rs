//! Request handling and background work.
//!
//! - **Dispatcher**: maps each front-door `Command` to the broker core
//! - **WorkerPool**: fixed set of workers serving commands from a bounded queue
//! - **PeriodicTask**: interval loops for the liveness sweep and priority batch
//!
//! # Architecture
//!
//! ```text
//!     agents / operators
//!            │
//!     ┌──────▼───────┐
//!     │ BrokerHandle │  submit(Command)
//!     └──────┬───────┘
//!            │ bounded mpsc
//!    ┌───────┼────────────────┐
//!    ▼       ▼                ▼
//! ┌──────┐ ┌──────┐       ┌──────┐
//! │ W 1  │ │ W 2  │  ...  │ W N  │ ── Dispatcher ── JobBroker / TaskQueueStore
//! └──────┘ └──────┘       └──────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use grid_broker::scheduler::{Command, WorkerPool, WorkerPoolConfig};
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(8), dispatcher)?;
//! pool.start()?;
//!
//! let handle = pool.handle();
//! let response = handle.submit(Command::GetJobs { queue_ids: vec![42] }).await?;
//!
//! pool.shutdown().await?;
//! ```

pub mod dispatch;
pub mod periodic;
pub mod worker_pool;

pub use dispatch::{Command, Dispatcher, Response, StatusResult, MAX_JOBS_PER_REQUEST};
pub use periodic::PeriodicTask;
pub use worker_pool::{BrokerHandle, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
