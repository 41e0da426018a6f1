//! Job status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse grouping of statuses used by callers that do not care about the
/// exact state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCategory {
    /// Not yet eligible for, or waiting on, matching.
    Pending,
    /// Handed to an agent; heartbeats are expected.
    InFlight,
    /// Master job bookkeeping states.
    Master,
    /// Stale heartbeat detected, not yet terminal.
    FailureDetected,
    /// Finished successfully.
    Success,
    /// Finished unsuccessfully.
    Failure,
}

/// Component allowed to drive a given transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionActor {
    /// The job broker (claim and claim rollback).
    Broker,
    /// The agent running the job, via the RPC front door.
    Agent,
    /// The liveness monitor.
    Monitor,
    /// The external submission path.
    Submission,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Inserting,
    Waiting,
    Splitting,
    Split,
    Assigned,
    Started,
    Running,
    Saving,
    Zombie,
    Done,
    DoneWarn,
    /// Assignment failed after the claim (credential issuance).
    ErrorA,
    /// Execution error reported by the agent.
    ErrorE,
    /// Input staging error.
    ErrorI,
    /// Input download error inside the sandbox.
    ErrorIb,
    /// Output saving error.
    ErrorS,
    /// Validation error.
    ErrorV,
    /// Splitting error on a master job.
    ErrorSplt,
    Failed,
    Expired,
    Killed,
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl JobStatus {
    /// Every status, in declaration order.
    pub const ALL: [JobStatus; 21] = [
        JobStatus::Inserting,
        JobStatus::Waiting,
        JobStatus::Splitting,
        JobStatus::Split,
        JobStatus::Assigned,
        JobStatus::Started,
        JobStatus::Running,
        JobStatus::Saving,
        JobStatus::Zombie,
        JobStatus::Done,
        JobStatus::DoneWarn,
        JobStatus::ErrorA,
        JobStatus::ErrorE,
        JobStatus::ErrorI,
        JobStatus::ErrorIb,
        JobStatus::ErrorS,
        JobStatus::ErrorV,
        JobStatus::ErrorSplt,
        JobStatus::Failed,
        JobStatus::Expired,
        JobStatus::Killed,
    ];

    /// Statuses in which the agent must keep heartbeating.
    pub const IN_FLIGHT: [JobStatus; 4] = [
        JobStatus::Assigned,
        JobStatus::Started,
        JobStatus::Running,
        JobStatus::Saving,
    ];

    /// Canonical upper-case name, as stored in the task queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Inserting => "INSERTING",
            JobStatus::Waiting => "WAITING",
            JobStatus::Splitting => "SPLITTING",
            JobStatus::Split => "SPLIT",
            JobStatus::Assigned => "ASSIGNED",
            JobStatus::Started => "STARTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Saving => "SAVING",
            JobStatus::Zombie => "ZOMBIE",
            JobStatus::Done => "DONE",
            JobStatus::DoneWarn => "DONE_WARN",
            JobStatus::ErrorA => "ERROR_A",
            JobStatus::ErrorE => "ERROR_E",
            JobStatus::ErrorI => "ERROR_I",
            JobStatus::ErrorIb => "ERROR_IB",
            JobStatus::ErrorS => "ERROR_S",
            JobStatus::ErrorV => "ERROR_V",
            JobStatus::ErrorSplt => "ERROR_SPLT",
            JobStatus::Failed => "FAILED",
            JobStatus::Expired => "EXPIRED",
            JobStatus::Killed => "KILLED",
        }
    }

    pub fn category(&self) -> StatusCategory {
        match self {
            JobStatus::Inserting | JobStatus::Waiting => StatusCategory::Pending,
            JobStatus::Splitting | JobStatus::Split => StatusCategory::Master,
            JobStatus::Assigned | JobStatus::Started | JobStatus::Running | JobStatus::Saving => {
                StatusCategory::InFlight
            }
            JobStatus::Zombie => StatusCategory::FailureDetected,
            JobStatus::Done | JobStatus::DoneWarn => StatusCategory::Success,
            JobStatus::ErrorA
            | JobStatus::ErrorE
            | JobStatus::ErrorI
            | JobStatus::ErrorIb
            | JobStatus::ErrorS
            | JobStatus::ErrorV
            | JobStatus::ErrorSplt
            | JobStatus::Failed
            | JobStatus::Expired
            | JobStatus::Killed => StatusCategory::Failure,
        }
    }

    /// True for success and failure end states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.category(),
            StatusCategory::Success | StatusCategory::Failure
        )
    }

    /// True for every status that can still change without an administrator.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_in_flight(&self) -> bool {
        self.category() == StatusCategory::InFlight
    }

    pub fn is_failure(&self) -> bool {
        self.category() == StatusCategory::Failure
    }

    /// Statuses only a master job can be in.
    pub fn is_master_status(&self) -> bool {
        self.category() == StatusCategory::Master
    }

    /// Returns which component may move a job from `self` to `next`, or
    /// `None` when the transition is not part of the state machine.
    ///
    /// Administrative force-fail is not in this table (see `can_force`).
    pub fn transition_actor(&self, next: JobStatus) -> Option<TransitionActor> {
        use JobStatus::*;

        match (*self, next) {
            (Inserting, Waiting) | (Inserting, Splitting) | (Splitting, Split) => {
                Some(TransitionActor::Submission)
            }
            (Splitting, ErrorSplt) => Some(TransitionActor::Submission),
            (Waiting, Assigned) | (Assigned, ErrorA) => Some(TransitionActor::Broker),
            (Assigned, Started) | (Started, Running) | (Running, Saving) => {
                Some(TransitionActor::Agent)
            }
            (Running | Saving, Done | DoneWarn) => Some(TransitionActor::Agent),
            // An agent heard from again revives its zombie.
            (Zombie, Running | Saving) => Some(TransitionActor::Agent),
            (Assigned | Started | Running | Saving, ErrorE | ErrorI | ErrorIb | ErrorS | ErrorV | Failed) => {
                Some(TransitionActor::Agent)
            }
            (Assigned | Started | Running | Saving, Zombie) | (Zombie, Expired) => {
                Some(TransitionActor::Monitor)
            }
            _ => None,
        }
    }

    /// Whether `actor` may move a job from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus, actor: TransitionActor) -> bool {
        self.transition_actor(next) == Some(actor)
    }

    /// All statuses from which `actor` may move a job into `target`.
    ///
    /// Stores use this set as the guard of their single conditional update.
    pub fn predecessors(target: JobStatus, actor: TransitionActor) -> Vec<JobStatus> {
        JobStatus::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(target, actor))
            .collect()
    }

    /// Administrative override: any job may be forced into a failure state.
    pub fn can_force(&self, target: JobStatus) -> bool {
        target.is_failure() && *self != target
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_active_are_complementary() {
        for status in JobStatus::ALL {
            assert_ne!(status.is_terminal(), status.is_active(), "{}", status);
        }
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Expired.is_terminal());
        assert!(JobStatus::Zombie.is_active());
        assert!(JobStatus::Waiting.is_active());
    }

    #[test]
    fn test_parse_round_trips_every_name() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!("done_warn".parse::<JobStatus>(), Ok(JobStatus::DoneWarn));
        assert!("BOGUS".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_only_broker_assigns() {
        assert!(JobStatus::Waiting.can_transition_to(JobStatus::Assigned, TransitionActor::Broker));
        assert!(!JobStatus::Waiting.can_transition_to(JobStatus::Assigned, TransitionActor::Agent));
        assert_eq!(
            JobStatus::predecessors(JobStatus::Assigned, TransitionActor::Broker),
            vec![JobStatus::Waiting]
        );
    }

    #[test]
    fn test_zombie_transitions_belong_to_monitor() {
        let preds = JobStatus::predecessors(JobStatus::Zombie, TransitionActor::Monitor);
        assert_eq!(preds, JobStatus::IN_FLIGHT.to_vec());
        assert!(JobStatus::Zombie.can_transition_to(JobStatus::Expired, TransitionActor::Monitor));
        assert!(!JobStatus::Zombie.can_transition_to(JobStatus::Expired, TransitionActor::Agent));
    }

    #[test]
    fn test_agent_can_revive_zombie() {
        assert!(JobStatus::Zombie.can_transition_to(JobStatus::Running, TransitionActor::Agent));
        assert!(JobStatus::Zombie.can_transition_to(JobStatus::Saving, TransitionActor::Agent));
        assert!(!JobStatus::Zombie.can_transition_to(JobStatus::Done, TransitionActor::Agent));
        assert!(!JobStatus::Zombie.can_transition_to(JobStatus::Started, TransitionActor::Agent));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_transitions() {
        let actors = [
            TransitionActor::Broker,
            TransitionActor::Agent,
            TransitionActor::Monitor,
            TransitionActor::Submission,
        ];
        for from in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                for actor in actors {
                    assert!(!from.can_transition_to(to, actor), "{} -> {}", from, to);
                }
            }
        }
    }

    #[test]
    fn test_force_only_targets_failures() {
        assert!(JobStatus::Done.can_force(JobStatus::Killed));
        assert!(JobStatus::Running.can_force(JobStatus::Failed));
        assert!(!JobStatus::Running.can_force(JobStatus::Done));
        assert!(!JobStatus::Killed.can_force(JobStatus::Killed));
    }

    #[test]
    fn test_serde_uses_queue_names() {
        let json = serde_json::to_string(&JobStatus::ErrorIb).expect("serialize");
        assert_eq!(json, "\"ERROR_IB\"");
    }
}
