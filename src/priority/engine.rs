//! Batch recomputation of computed priorities.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::storage::{marker_min_age, PriorityScope, TaskQueueStore};

use super::compute::{compute_priority, PriorityVerdict};

/// Marker serializing scheduled batches across broker instances.
pub const PRIORITY_MARKER: &str = "priority";

/// Summary of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriorityBatchReport {
    /// Rows read from the quota table.
    pub rows: usize,
    pub updated: usize,
    /// Writes that failed; the batch continued past them.
    pub failed: usize,
    /// Users whose new computed priority excludes them from matching.
    pub quota_exceeded: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u128(duration.as_millis())
    }
}

/// Recomputes every user's `userload` and `computed_priority`.
///
/// Each row is written on its own; a failed write is logged, counted and
/// skipped. Only a failure to read the table aborts a run.
pub struct PriorityEngine {
    store: Arc<dyn TaskQueueStore>,
    metrics: MetricsCollector,
}

impl PriorityEngine {
    pub fn new(store: Arc<dyn TaskQueueStore>) -> Self {
        Self {
            store,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one batch over the rows selected by `scope`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the quota table cannot be read.
    pub async fn run_batch(&self, scope: PriorityScope) -> Result<PriorityBatchReport, StoreError> {
        let started = Instant::now();
        let records = self.store.priority_records(scope).await?;

        let mut report = PriorityBatchReport {
            rows: records.len(),
            ..Default::default()
        };

        for record in &records {
            let computed = compute_priority(&record.inputs());

            let write_started = Instant::now();
            let result = self
                .store
                .update_computed_priority(&record.user, computed.userload, computed.computed_priority)
                .await;
            let write_secs = write_started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    report.updated += 1;
                    if matches!(
                        computed.verdict,
                        PriorityVerdict::RunningTimeQuotaExceeded | PriorityVerdict::ParallelQuotaExceeded
                    ) {
                        report.quota_exceeded += 1;
                    }
                    self.metrics.record_priority_update(true, write_secs);
                    tracing::debug!(
                        user = %record.user,
                        userload = computed.userload,
                        computed_priority = computed.computed_priority,
                        verdict = computed.verdict.as_str(),
                        write_ms = write_secs * 1000.0,
                        "Updated computed priority"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.record_priority_update(false, write_secs);
                    tracing::warn!(
                        user = %record.user,
                        error = %e,
                        "Failed to update computed priority"
                    );
                }
            }
        }

        report.duration = started.elapsed();
        self.metrics.record_priority_batch(report.duration.as_secs_f64());

        tracing::info!(
            scope = ?scope,
            rows = report.rows,
            updated = report.updated,
            failed = report.failed,
            quota_exceeded = report.quota_exceeded,
            duration_ms = report.duration.as_millis() as u64,
            "Priority batch finished"
        );

        Ok(report)
    }

    /// Runs a batch unless another instance ran one within `interval`.
    ///
    /// Returns `None` when the shared marker was not acquired.
    pub async fn run_if_due(
        &self,
        scope: PriorityScope,
        owner: &str,
        interval: Duration,
    ) -> Result<Option<PriorityBatchReport>, StoreError> {
        let acquired = self
            .store
            .try_acquire_marker(PRIORITY_MARKER, owner, marker_min_age(interval), Utc::now())
            .await?;

        if !acquired {
            tracing::debug!(owner = owner, "Priority batch ran elsewhere, skipping");
            return Ok(None);
        }

        self.run_batch(scope).await.map(Some)
    }
}
