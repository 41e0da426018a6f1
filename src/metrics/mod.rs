//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for broker operations:
//! matching, liveness sweeps, priority batches and command dispatch.
//!
//! # Example
//!
//! ```ignore
//! use grid_broker::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_match("assigned", "full", 0.01);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CLAIM_CONFLICTS, COMMANDS_TOTAL, COMMAND_QUEUE_DEPTH, CREDENTIAL_FAILURES,
    LIVENESS_SWEEP_DURATION, LIVENESS_TRANSITIONS, MATCH_LATENCY, MATCH_REQUESTS_TOTAL,
    PRIORITY_BATCH_DURATION, PRIORITY_UPDATES, PRIORITY_WRITE_DURATION, REGISTRY,
};
