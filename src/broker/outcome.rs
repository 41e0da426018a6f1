//! Match results.

use serde::{Deserialize, Serialize};

use crate::job::JobOwner;

use super::token::JobToken;

/// Which relaxation of the constraints produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Full,
    PackageFallback,
    Remote,
    RemotePackageFallback,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::Full => "full",
            MatchTier::PackageFallback => "package_fallback",
            MatchTier::Remote => "remote",
            MatchTier::RemotePackageFallback => "remote_package_fallback",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, MatchTier::Remote | MatchTier::RemotePackageFallback)
    }
}

/// Why nothing was handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// No tier found a matching aggregate.
    NoCandidate,
    /// A candidate was found but a concurrent matcher claimed its last job.
    ClaimConflict,
    /// The CE's queue is administratively blocked.
    QueueBlocked,
}

impl NoMatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoMatchReason::NoCandidate => "no_candidate",
            NoMatchReason::ClaimConflict => "claim_conflict",
            NoMatchReason::QueueBlocked => "queue_blocked",
        }
    }
}

/// A job handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedJob {
    pub queue_id: i64,
    /// The counter the agent must echo on every status update.
    pub resubmission: i32,
    pub jdl: String,
    pub owner: JobOwner,
    pub token: JobToken,
    pub tier: MatchTier,
}

/// Result of one match request. None of these is an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Assigned(AssignedJob),
    /// Work exists but the agent lacks these packages.
    InstallPackages {
        packages: Vec<String>,
        tier: MatchTier,
    },
    NothingToRun {
        reason: NoMatchReason,
    },
}

impl MatchOutcome {
    /// Numeric result code sent to the agent.
    pub fn code(&self) -> i32 {
        match self {
            MatchOutcome::Assigned(_) => 1,
            MatchOutcome::NothingToRun { .. } => -2,
            MatchOutcome::InstallPackages { .. } => -3,
        }
    }

    /// Human-readable companion of `code()`.
    pub fn message(&self) -> String {
        match self {
            MatchOutcome::Assigned(job) => format!("Job {} assigned", job.queue_id),
            MatchOutcome::InstallPackages { packages, .. } => {
                format!("Packages required: {}", packages.join(","))
            }
            MatchOutcome::NothingToRun { reason } => match reason {
                NoMatchReason::QueueBlocked => "Queue is blocked".to_string(),
                _ => "Nothing to run".to_string(),
            },
        }
    }

    pub fn tier(&self) -> Option<MatchTier> {
        match self {
            MatchOutcome::Assigned(job) => Some(job.tier),
            MatchOutcome::InstallPackages { tier, .. } => Some(*tier),
            MatchOutcome::NothingToRun { .. } => None,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            MatchOutcome::Assigned(_) => "assigned",
            MatchOutcome::InstallPackages { .. } => "install_packages",
            MatchOutcome::NothingToRun { .. } => "nothing_to_run",
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, MatchOutcome::Assigned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let nothing = MatchOutcome::NothingToRun {
            reason: NoMatchReason::NoCandidate,
        };
        assert_eq!(nothing.code(), -2);
        assert_eq!(nothing.tier(), None);

        let install = MatchOutcome::InstallPackages {
            packages: vec!["VO_ALICE@ROOT::v6".to_string()],
            tier: MatchTier::PackageFallback,
        };
        assert_eq!(install.code(), -3);
        assert!(install.message().contains("VO_ALICE@ROOT::v6"));
        assert_eq!(install.tier(), Some(MatchTier::PackageFallback));
    }

    #[test]
    fn test_blocked_message() {
        let blocked = MatchOutcome::NothingToRun {
            reason: NoMatchReason::QueueBlocked,
        };
        assert_eq!(blocked.message(), "Queue is blocked");
    }

    #[test]
    fn test_remote_tiers() {
        assert!(MatchTier::Remote.is_remote());
        assert!(MatchTier::RemotePackageFallback.is_remote());
        assert!(!MatchTier::PackageFallback.is_remote());
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = MatchOutcome::NothingToRun {
            reason: NoMatchReason::ClaimConflict,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"nothing_to_run\""));
        assert!(json.contains("\"reason\":\"claim_conflict\""));
    }
}
