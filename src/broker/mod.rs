//! Job broker: hands waiting jobs to polling agents.
//!
//! A match request walks up to four tiers, each a different constraint set
//! over the waiting aggregates:
//!
//! 1. **Full**: this CE, this site, its partitions, installed packages.
//! 2. **Package fallback**: as 1 without the package check; answers with
//!    the packages to install instead of a job.
//! 3. **Remote**: no locality, only remote-allowed groups idle past their
//!    remote timeout.
//! 4. **Remote package fallback**: as 3 without the package check.
//!
//! Tiers 1 and 3 claim through `TaskQueueStore::claim_waiting_job`. A claim
//! only sticks once the token service issued a credential for it.

pub mod matcher;
pub mod outcome;
pub mod packages;
pub mod request;
pub mod site;
pub mod token;

pub use matcher::{BrokerSettings, JobBroker, NO_MATCH_STATUS};
pub use outcome::{AssignedJob, MatchOutcome, MatchTier, NoMatchReason};
pub use packages::PackageInventory;
pub use request::{parse_partitions, MatchRequest, ResolvedRequest};
pub use site::{SiteDirectory, SiteRequirements, StaticSiteDirectory};
pub use token::{HttpTokenIssuer, JobToken, JobTokenRequest, TokenIssuer, TokenKind};
