//! Job entities shared by every scheduler component.
//!
//! This module defines the records the broker reads and mutates:
//!
//! - `Job`: one row of the task queue, keyed by its queue identifier
//! - `JobStatus`: the lifecycle state machine and its classification predicates
//! - `WaitingAggregate`: a pre-grouped matching signature over waiting jobs
//!
//! # Lifecycle
//!
//! ```text
//!   INSERTING ──► WAITING ──► ASSIGNED ──► STARTED ──► RUNNING ──► SAVING ──► DONE*
//!                                │            │           │          │
//!                                │            └───────────┴──────────┴──► ERROR* / FAILED
//!                                │                        │
//!                                └──► ERROR_A             └──► ZOMBIE ──► EXPIRED
//! ```
//!
//! `WAITING → ASSIGNED` belongs to the broker's atomic claim, the `ZOMBIE`
//! transitions belong to the liveness monitor, and the remaining in-flight
//! transitions are reported by the running agent.

pub mod aggregate;
pub mod record;
pub mod status;

pub use aggregate::WaitingAggregate;
pub use record::{Job, JobOwner};
pub use status::{JobStatus, StatusCategory, TransitionActor};
