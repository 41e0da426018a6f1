//! The front-door command table.
//!
//! Each request kind the transport understands is one `Command` variant,
//! resolved to its handler by a `match` in `Dispatcher::dispatch`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::{JobBroker, MatchOutcome, MatchRequest};
use crate::error::DispatchError;
use crate::job::{Job, JobStatus, TransitionActor};
use crate::metrics::MetricsCollector;
use crate::storage::{StatusChange, StatusUpdate, TaskQueueStore, TraceSink};

/// Most jobs a single `GetJobs` may ask for.
pub const MAX_JOBS_PER_REQUEST: usize = 1000;

/// A validated request from the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    GetJobs {
        queue_ids: Vec<i64>,
    },
    /// Agent-reported status change, guarded by the resubmission counter.
    SetJobStatus {
        queue_id: i64,
        resubmission: i32,
        status: JobStatus,
    },
    Heartbeat {
        queue_id: i64,
        resubmission: i32,
    },
    AppendTrace {
        queue_id: i64,
        tag: String,
        message: String,
    },
    MatchJob(MatchRequest),
    /// Operator override into a failure status.
    ForceJobStatus {
        queue_id: i64,
        status: JobStatus,
    },
}

impl Command {
    /// Metric label.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetJobs { .. } => "get_jobs",
            Command::SetJobStatus { .. } => "set_job_status",
            Command::Heartbeat { .. } => "heartbeat",
            Command::AppendTrace { .. } => "append_trace",
            Command::MatchJob(_) => "match_job",
            Command::ForceJobStatus { .. } => "force_job_status",
        }
    }
}

/// Result of a status change as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusResult {
    Applied,
    /// Outdated resubmission counter; ignored.
    Stale,
    Rejected,
    NotFound,
}

impl From<&StatusUpdate> for StatusResult {
    fn from(update: &StatusUpdate) -> Self {
        match update {
            StatusUpdate::Applied { .. } => StatusResult::Applied,
            StatusUpdate::Stale { .. } => StatusResult::Stale,
            StatusUpdate::Rejected { .. } => StatusResult::Rejected,
            StatusUpdate::NotFound => StatusResult::NotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Jobs {
        jobs: Vec<Job>,
    },
    Status {
        queue_id: i64,
        result: StatusResult,
    },
    Heartbeat {
        queue_id: i64,
        accepted: bool,
    },
    TraceAppended {
        queue_id: i64,
    },
    Match {
        code: i32,
        message: String,
        outcome: MatchOutcome,
    },
}

/// Runs commands against the broker core.
pub struct Dispatcher {
    store: Arc<dyn TaskQueueStore>,
    traces: Arc<dyn TraceSink>,
    broker: Arc<JobBroker>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskQueueStore>,
        traces: Arc<dyn TraceSink>,
        broker: Arc<JobBroker>,
    ) -> Self {
        Self {
            store,
            traces,
            broker,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn dispatch(&self, command: Command) -> Result<Response, DispatchError> {
        let name = command.name();
        let result = self.execute(command).await;

        self.metrics.record_command(name, result.is_ok());
        if let Err(ref e) = result {
            tracing::warn!(command = name, code = e.code(), error = %e, "Command failed");
        }

        result
    }

    async fn execute(&self, command: Command) -> Result<Response, DispatchError> {
        match command {
            Command::GetJobs { queue_ids } => {
                if queue_ids.is_empty() || queue_ids.len() > MAX_JOBS_PER_REQUEST {
                    return Err(DispatchError::InvalidCommand(format!(
                        "get_jobs takes 1 to {} identifiers, got {}",
                        MAX_JOBS_PER_REQUEST,
                        queue_ids.len()
                    )));
                }
                let jobs = self.store.get_jobs(&queue_ids).await?;
                Ok(Response::Jobs { jobs })
            }

            Command::SetJobStatus {
                queue_id,
                resubmission,
                status,
            } => {
                let change = StatusChange::new(queue_id, resubmission, status, TransitionActor::Agent);
                let update = self.store.update_job_status(&change).await?;

                match &update {
                    StatusUpdate::Applied { previous } => tracing::debug!(
                        queue_id = queue_id,
                        from = previous.as_str(),
                        to = status.as_str(),
                        "Job status updated"
                    ),
                    StatusUpdate::Stale {
                        current_resubmission,
                    } => tracing::debug!(
                        queue_id = queue_id,
                        resubmission = resubmission,
                        current_resubmission = current_resubmission,
                        "Ignoring status update from superseded agent"
                    ),
                    other => tracing::info!(
                        queue_id = queue_id,
                        to = status.as_str(),
                        update = ?other,
                        "Status update not applied"
                    ),
                }

                Ok(Response::Status {
                    queue_id,
                    result: StatusResult::from(&update),
                })
            }

            Command::Heartbeat {
                queue_id,
                resubmission,
            } => {
                let accepted = self.store.touch_heartbeat(queue_id, resubmission).await?;
                Ok(Response::Heartbeat { queue_id, accepted })
            }

            Command::AppendTrace {
                queue_id,
                tag,
                message,
            } => {
                if tag.trim().is_empty() || message.is_empty() {
                    return Err(DispatchError::InvalidCommand(
                        "trace tag and message must not be empty".to_string(),
                    ));
                }
                self.traces.append_trace(queue_id, &tag, &message).await?;
                Ok(Response::TraceAppended { queue_id })
            }

            Command::MatchJob(request) => {
                let outcome = self.broker.match_job(&request).await?;
                Ok(Response::Match {
                    code: outcome.code(),
                    message: outcome.message(),
                    outcome,
                })
            }

            Command::ForceJobStatus { queue_id, status } => {
                if !status.is_failure() {
                    return Err(DispatchError::InvalidCommand(format!(
                        "{} is not a failure status",
                        status
                    )));
                }
                let update = self.store.force_job_status(queue_id, status).await?;
                if update.is_applied() {
                    let message = format!("status forced to {}", status);
                    if let Err(e) = self.traces.append_trace(queue_id, "admin", &message).await {
                        tracing::warn!(queue_id = queue_id, error = %e, "Failed to append job trace");
                    }
                }
                tracing::info!(queue_id = queue_id, to = status.as_str(), update = ?update, "Forced job status");
                Ok(Response::Status {
                    queue_id,
                    result: StatusResult::from(&update),
                })
            }
        }
    }
}
