//! Heartbeat-based reclaiming of jobs whose agents went away.
//!
//! In-flight jobs without a heartbeat for `zombie_after` become `ZOMBIE`;
//! zombies silent for a further `expire_after` become `EXPIRED`. Only one
//! broker instance sweeps per interval: the shared `liveness` marker is
//! acquired before any work starts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::job::JobStatus;
use crate::metrics::MetricsCollector;
use crate::storage::{marker_min_age, TaskQueueStore};

/// Marker name shared by all instances.
pub const LIVENESS_MARKER: &str = "liveness";

/// Thresholds and cadence of the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSettings {
    pub interval: Duration,
    pub zombie_after: Duration,
    /// Measured from the zombie threshold, not from the last heartbeat.
    pub expire_after: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            zombie_after: Duration::from_secs(3600),
            expire_after: Duration::from_secs(7200),
        }
    }
}

/// Counts of one transition pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassCounts {
    pub candidates: usize,
    pub moved: usize,
    /// Rows that changed underneath the sweep (heartbeat or status).
    pub skipped: usize,
    pub failed: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SweepReport {
    /// Another instance swept within the interval.
    Skipped,
    Completed {
        zombie: PassCounts,
        expired: PassCounts,
        duration_ms: u64,
    },
}

impl SweepReport {
    pub fn moved(&self) -> usize {
        match self {
            SweepReport::Skipped => 0,
            SweepReport::Completed { zombie, expired, .. } => zombie.moved + expired.moved,
        }
    }
}

pub struct LivenessMonitor {
    store: Arc<dyn TaskQueueStore>,
    settings: LivenessSettings,
    instance: String,
    metrics: MetricsCollector,
}

impl LivenessMonitor {
    pub fn new(store: Arc<dyn TaskQueueStore>, settings: LivenessSettings, instance: impl Into<String>) -> Self {
        Self {
            store,
            settings,
            instance: instance.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &LivenessSettings {
        &self.settings
    }

    pub async fn run_cycle(&self) -> Result<SweepReport, StoreError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs one cycle as if the clock read `now`.
    ///
    /// # Errors
    ///
    /// Fails only if the marker or a candidate query fails. Individual
    /// transition failures are counted and logged.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let acquired = self
            .store
            .try_acquire_marker(
                LIVENESS_MARKER,
                &self.instance,
                marker_min_age(self.settings.interval),
                now,
            )
            .await?;

        if !acquired {
            tracing::debug!(instance = %self.instance, "Liveness sweep ran elsewhere, skipping");
            return Ok(SweepReport::Skipped);
        }

        self.sweep(now).await
    }

    /// Runs both passes without consulting the marker.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let started = Instant::now();

        let zombie_cutoff = now - to_chrono(self.settings.zombie_after)?;
        let expire_cutoff =
            now - to_chrono(self.settings.zombie_after + self.settings.expire_after)?;

        let zombie = self
            .pass(&JobStatus::IN_FLIGHT, JobStatus::Zombie, zombie_cutoff)
            .await?;
        let expired = self
            .pass(&[JobStatus::Zombie], JobStatus::Expired, expire_cutoff)
            .await?;

        let duration = started.elapsed();
        self.metrics.record_sweep(duration.as_secs_f64());

        tracing::info!(
            instance = %self.instance,
            zombie_candidates = zombie.candidates,
            zombie_moved = zombie.moved,
            zombie_failed = zombie.failed,
            expired_candidates = expired.candidates,
            expired_moved = expired.moved,
            expired_failed = expired.failed,
            duration_ms = duration.as_millis() as u64,
            "Liveness sweep finished"
        );

        Ok(SweepReport::Completed {
            zombie,
            expired,
            duration_ms: duration.as_millis() as u64,
        })
    }

    async fn pass(
        &self,
        from: &[JobStatus],
        to: JobStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<PassCounts, StoreError> {
        let candidates = self.store.stale_jobs(from, cutoff).await?;
        let mut counts = PassCounts {
            candidates: candidates.len(),
            ..Default::default()
        };

        for job in candidates {
            match self
                .store
                .transition_if_stale(job.queue_id, from, to, cutoff)
                .await
            {
                Ok(true) => {
                    counts.moved += 1;
                    self.metrics.record_liveness_transition(to.as_str(), true);
                    tracing::debug!(
                        queue_id = job.queue_id,
                        from = job.status.as_str(),
                        to = to.as_str(),
                        last_heartbeat = ?job.last_heartbeat,
                        "Reclaimed job"
                    );
                }
                Ok(false) => {
                    counts.skipped += 1;
                    self.metrics.record_liveness_transition(to.as_str(), false);
                }
                Err(e) => {
                    counts.failed += 1;
                    tracing::warn!(
                        queue_id = job.queue_id,
                        to = to.as_str(),
                        error = %e,
                        "Liveness transition failed"
                    );
                }
            }
        }

        Ok(counts)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| StoreError::Corrupt(format!("liveness threshold: {}", e)))
}
