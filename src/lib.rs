//! grid_broker: job matching core of a grid-computing scheduler.
//!
//! Remote agents ask for work on behalf of a computing element (CE). The
//! broker matches them against waiting jobs through up to four fallback
//! tiers, claims at most one job per request atomically, keeps per-user
//! fair-share priorities current and reclaims jobs whose agents stopped
//! sending heartbeats.

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod liveness;
pub mod metrics;
pub mod priority;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use broker::{JobBroker, MatchOutcome, MatchRequest, MatchTier};
pub use config::{ConfigError, SchedulerConfig};
pub use context::{ContextError, SchedulerContext};
pub use error::{BrokerError, CredentialError, DirectoryError, DispatchError, StoreError};
pub use job::{Job, JobStatus};
pub use liveness::{LivenessMonitor, LivenessSettings, SweepReport};
pub use priority::{PriorityEngine, PriorityRecord};
pub use storage::{MemoryTaskQueueStore, PgTaskQueueStore, TaskQueueStore, TraceSink};
