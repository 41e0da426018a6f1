//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by grid_broker and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all grid_broker metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Match requests, labeled by outcome and the tier that produced it.
pub static MATCH_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end match latency in seconds.
pub static MATCH_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Claims lost to a concurrent matcher.
pub static CLAIM_CONFLICTS: OnceLock<Counter> = OnceLock::new();

/// Credential issuance failures that rolled a claim back.
pub static CREDENTIAL_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Liveness transitions, labeled by target status and result.
pub static LIVENESS_TRANSITIONS: OnceLock<CounterVec> = OnceLock::new();

/// Liveness sweep duration in seconds.
pub static LIVENESS_SWEEP_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Priority row writes, labeled by result.
pub static PRIORITY_UPDATES: OnceLock<CounterVec> = OnceLock::new();

/// Whole priority batch duration in seconds.
pub static PRIORITY_BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Single priority row write duration in seconds.
pub static PRIORITY_WRITE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Dispatched commands, labeled by command and result.
pub static COMMANDS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Commands waiting for a worker.
pub static COMMAND_QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Repeated
/// calls are harmless: the first set of metrics stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Matching
    let match_requests_total = CounterVec::new(
        Opts::new("grid_broker_match_requests_total", "Total match requests"),
        &["outcome", "tier"],
    )?;

    let match_latency = Histogram::with_opts(
        HistogramOpts::new(
            "grid_broker_match_latency_seconds",
            "Match request latency in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )?;

    let claim_conflicts = Counter::new(
        "grid_broker_claim_conflicts_total",
        "Claims lost to a concurrent matcher",
    )?;

    let credential_failures = Counter::new(
        "grid_broker_credential_failures_total",
        "Credential issuance failures",
    )?;

    // Liveness
    let liveness_transitions = CounterVec::new(
        Opts::new(
            "grid_broker_liveness_transitions_total",
            "Jobs moved by the liveness monitor",
        ),
        &["to", "result"],
    )?;

    let liveness_sweep_duration = Histogram::with_opts(
        HistogramOpts::new(
            "grid_broker_liveness_sweep_seconds",
            "Liveness sweep duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
    )?;

    // Priority
    let priority_updates = CounterVec::new(
        Opts::new(
            "grid_broker_priority_updates_total",
            "Computed priority writes",
        ),
        &["result"],
    )?;

    let priority_batch_duration = Histogram::with_opts(
        HistogramOpts::new(
            "grid_broker_priority_batch_seconds",
            "Priority batch duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
    )?;

    let priority_write_duration = Histogram::with_opts(
        HistogramOpts::new(
            "grid_broker_priority_write_seconds",
            "Single priority row write duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    )?;

    // Dispatch
    let commands_total = CounterVec::new(
        Opts::new("grid_broker_commands_total", "Dispatched commands"),
        &["command", "result"],
    )?;

    let command_queue_depth = Gauge::new(
        "grid_broker_command_queue_depth",
        "Commands waiting for a worker",
    )?;

    let active_workers = Gauge::new("grid_broker_active_workers", "Number of active workers")?;

    registry.register(Box::new(match_requests_total.clone()))?;
    registry.register(Box::new(match_latency.clone()))?;
    registry.register(Box::new(claim_conflicts.clone()))?;
    registry.register(Box::new(credential_failures.clone()))?;
    registry.register(Box::new(liveness_transitions.clone()))?;
    registry.register(Box::new(liveness_sweep_duration.clone()))?;
    registry.register(Box::new(priority_updates.clone()))?;
    registry.register(Box::new(priority_batch_duration.clone()))?;
    registry.register(Box::new(priority_write_duration.clone()))?;
    registry.register(Box::new(commands_total.clone()))?;
    registry.register(Box::new(command_queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = MATCH_REQUESTS_TOTAL.set(match_requests_total);
    let _ = MATCH_LATENCY.set(match_latency);
    let _ = CLAIM_CONFLICTS.set(claim_conflicts);
    let _ = CREDENTIAL_FAILURES.set(credential_failures);
    let _ = LIVENESS_TRANSITIONS.set(liveness_transitions);
    let _ = LIVENESS_SWEEP_DURATION.set(liveness_sweep_duration);
    let _ = PRIORITY_UPDATES.set(priority_updates);
    let _ = PRIORITY_BATCH_DURATION.set(priority_batch_duration);
    let _ = PRIORITY_WRITE_DURATION.set(priority_write_duration);
    let _ = COMMANDS_TOTAL.set(commands_total);
    let _ = COMMAND_QUEUE_DEPTH.set(command_queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_is_never_empty() {
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = MATCH_REQUESTS_TOTAL.get() {
            counter.with_label_values(&["assigned", "full"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("grid_broker_match_latency_seconds"));
    }
}
