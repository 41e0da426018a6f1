//! Agent match requests and their per-call normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::storage::{AggregateFilter, PackageCheck, RemoteCriteria};

use super::packages::PackageInventory;
use super::site::SiteRequirements;

fn default_true() -> bool {
    true
}

/// What an agent reports when it asks for work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub ce: String,
    pub site: String,
    /// Worker node host name.
    pub host: String,
    /// Further sites whose jobs this agent may run.
    #[serde(default)]
    pub extra_sites: Vec<String>,
    /// Seconds the agent can still run for.
    pub ttl: i64,
    /// Scratch disk offered, in kilobytes.
    #[serde(default)]
    pub disk: i64,
    /// Partition string reported by the agent; the site directory wins.
    #[serde(default)]
    pub partition: Option<String>,
    /// Installed packages, comma or whitespace separated.
    #[serde(default)]
    pub installed_packages: Option<String>,
    /// Packages come from a shared software area.
    #[serde(default)]
    pub packages_out_of_band: bool,
    /// Whether the agent takes jobs from other sites as a last resort.
    #[serde(default = "default_true")]
    pub accepts_remote: bool,
}

impl MatchRequest {
    pub fn new(ce: impl Into<String>, site: impl Into<String>, host: impl Into<String>, ttl: i64) -> Self {
        Self {
            ce: ce.into(),
            site: site.into(),
            host: host.into(),
            extra_sites: Vec::new(),
            ttl,
            disk: 0,
            partition: None,
            installed_packages: None,
            packages_out_of_band: false,
            accepts_remote: true,
        }
    }

    pub fn with_disk(mut self, disk: i64) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_packages(mut self, installed: impl Into<String>) -> Self {
        self.installed_packages = Some(installed.into());
        self.packages_out_of_band = false;
        self
    }

    pub fn with_shared_packages(mut self) -> Self {
        self.packages_out_of_band = true;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_extra_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_sites = sites.into_iter().map(Into::into).collect();
        self
    }

    pub fn local_only(mut self) -> Self {
        self.accepts_remote = false;
        self
    }

    /// Rejects requests no tier could serve meaningfully.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.ce.trim().is_empty() {
            return Err(BrokerError::InvalidRequest("ce is empty".to_string()));
        }
        if self.site.trim().is_empty() {
            return Err(BrokerError::InvalidRequest("site is empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(BrokerError::InvalidRequest("host is empty".to_string()));
        }
        if self.ttl <= 0 {
            return Err(BrokerError::InvalidRequest(format!(
                "ttl must be positive, got {}",
                self.ttl
            )));
        }
        if self.disk < 0 {
            return Err(BrokerError::InvalidRequest(format!(
                "disk must not be negative, got {}",
                self.disk
            )));
        }
        Ok(())
    }
}

/// Splits a partition string on commas and colons.
pub fn parse_partitions(raw: &str) -> Vec<String> {
    raw.split([',', ':'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// A request after the site directory has been consulted.
///
/// Built once per match call and shared by every tier.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub request: MatchRequest,
    pub requirements: SiteRequirements,
    pub partitions: Vec<String>,
    pub inventory: PackageInventory,
}

impl ResolvedRequest {
    pub fn new(request: MatchRequest, requirements: SiteRequirements) -> Self {
        let partitions = requirements
            .partition
            .as_deref()
            .or(request.partition.as_deref())
            .map(parse_partitions)
            .unwrap_or_default();

        let inventory = PackageInventory::parse(
            request.installed_packages.as_deref(),
            request.packages_out_of_band,
        );

        Self {
            request,
            requirements,
            partitions,
            inventory,
        }
    }

    fn base_filter(&self, packages: PackageCheck) -> AggregateFilter {
        let mut filter = AggregateFilter::new(self.request.ttl, self.request.disk);
        filter.allowed_users = self.requirements.allowed_users.clone();
        filter.denied_users = self.requirements.denied_users.clone();
        filter.packages = packages;
        filter
    }

    /// Constraints for the local tiers: this CE, this site, its partitions.
    pub fn local_filter(&self, packages: PackageCheck) -> AggregateFilter {
        let mut filter = self.base_filter(packages);
        filter.ce = Some(self.request.ce.clone());
        filter.site = Some(self.request.site.clone());
        filter.extra_sites = self.request.extra_sites.clone();
        filter.partitions = Some(self.partitions.clone());
        filter
    }

    /// Constraints for the remote tiers: no locality, but only groups that
    /// allow remote execution and have idled long enough.
    pub fn remote_filter(
        &self,
        packages: PackageCheck,
        now: DateTime<Utc>,
        default_timeout_secs: i64,
    ) -> AggregateFilter {
        let mut filter = self.base_filter(packages);
        filter.remote = Some(RemoteCriteria {
            now,
            default_timeout_secs,
        });
        filter
    }
}
