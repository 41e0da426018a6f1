//! Fair-share priority.
//!
//! `compute_priority` turns a user's quota row into a ranking weight;
//! `PriorityEngine` applies it to the whole quota table on a schedule. The
//! broker reads the stored result and never computes priorities itself.

pub mod compute;
pub mod engine;
pub mod record;

pub use compute::{compute_priority, ComputedPriority, PriorityVerdict};
pub use engine::{PriorityBatchReport, PriorityEngine, PRIORITY_MARKER};
pub use record::{PriorityInputs, PriorityRecord, QUOTA_EXCEEDED};
