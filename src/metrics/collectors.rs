//! High-level metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so that call sites
//! record with consistent labels. Every method is a no-op until
//! `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_WORKERS, CLAIM_CONFLICTS, COMMANDS_TOTAL, COMMAND_QUEUE_DEPTH, CREDENTIAL_FAILURES,
    LIVENESS_SWEEP_DURATION, LIVENESS_TRANSITIONS, MATCH_LATENCY, MATCH_REQUESTS_TOTAL,
    PRIORITY_BATCH_DURATION, PRIORITY_UPDATES, PRIORITY_WRITE_DURATION,
};

/// Metrics collector for recording broker operational metrics.
///
/// # Example
///
/// ```ignore
/// use grid_broker::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_match("assigned", "full", 0.012);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one finished match request.
    ///
    /// # Arguments
    ///
    /// * `outcome` - "assigned", "install_packages", "nothing_to_run" or "error"
    /// * `tier` - Tier that produced the outcome, or "none"
    /// * `latency_secs` - Time from request to response
    pub fn record_match(&self, outcome: &str, tier: &str, latency_secs: f64) {
        if let Some(requests) = MATCH_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[outcome, tier]).inc();
        }

        if let Some(latency) = MATCH_LATENCY.get() {
            latency.observe(latency_secs);
        }

        tracing::trace!(
            outcome = outcome,
            tier = tier,
            latency_secs = latency_secs,
            "Recorded match metric"
        );
    }

    pub fn record_claim_conflict(&self) {
        if let Some(conflicts) = CLAIM_CONFLICTS.get() {
            conflicts.inc();
        }
    }

    pub fn record_credential_failure(&self) {
        if let Some(failures) = CREDENTIAL_FAILURES.get() {
            failures.inc();
        }
    }

    /// Record one attempted liveness transition.
    ///
    /// # Arguments
    ///
    /// * `to` - Target status name
    /// * `applied` - False when the job changed underneath the sweep
    pub fn record_liveness_transition(&self, to: &str, applied: bool) {
        let result = if applied { "applied" } else { "skipped" };

        if let Some(transitions) = LIVENESS_TRANSITIONS.get() {
            transitions.with_label_values(&[to, result]).inc();
        }

        tracing::trace!(to = to, result = result, "Recorded liveness metric");
    }

    pub fn record_sweep(&self, duration_secs: f64) {
        if let Some(sweep) = LIVENESS_SWEEP_DURATION.get() {
            sweep.observe(duration_secs);
        }
    }

    /// Record one computed priority write.
    pub fn record_priority_update(&self, success: bool, write_secs: f64) {
        let result = if success { "success" } else { "failure" };

        if let Some(updates) = PRIORITY_UPDATES.get() {
            updates.with_label_values(&[result]).inc();
        }

        if let Some(write) = PRIORITY_WRITE_DURATION.get() {
            write.observe(write_secs);
        }
    }

    pub fn record_priority_batch(&self, duration_secs: f64) {
        if let Some(batch) = PRIORITY_BATCH_DURATION.get() {
            batch.observe(duration_secs);
        }

        tracing::trace!(duration_secs = duration_secs, "Recorded priority batch metric");
    }

    /// Record one dispatched command.
    pub fn record_command(&self, command: &str, success: bool) {
        let result = if success { "success" } else { "failure" };

        if let Some(commands) = COMMANDS_TOTAL.get() {
            commands.with_label_values(&[command, result]).inc();
        }
    }

    pub fn update_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = COMMAND_QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }

        tracing::trace!(depth = depth, "Updated command queue depth metric");
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }
}
