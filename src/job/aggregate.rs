//! Waiting-job aggregates.
//!
//! The submission pipeline groups waiting jobs by everything that decides
//! where they may run. Matching then walks a handful of aggregate rows
//! instead of every waiting job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One matching signature over a group of waiting jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingAggregate {
    /// Aggregate identifier; waiting jobs reference it.
    pub entry_id: i64,
    /// Number of waiting jobs still represented by this row.
    pub counter: i64,
    /// Owner of every job in the group.
    pub user: String,
    /// Sites the jobs may run at; empty means anywhere.
    pub sites: Vec<String>,
    /// CEs the jobs may run through; empty means any.
    pub ces: Vec<String>,
    /// CEs the jobs must never run through.
    pub excluded_ces: Vec<String>,
    /// Packages the jobs need installed on the worker node.
    pub packages: Vec<String>,
    /// Partitions the jobs are restricted to; empty means any.
    pub partitions: Vec<String>,
    /// Partitions the jobs must not run in.
    pub excluded_partitions: Vec<String>,
    /// Required time-to-live in seconds.
    pub ttl: i64,
    /// Required scratch disk in kilobytes.
    pub disk: i64,
    pub priority: f64,
    pub price: f64,
    /// Identifier of the oldest waiting job in the group.
    pub oldest_queue_id: i64,
    /// Whether the jobs may be handed to agents at other sites.
    pub remote_allowed: bool,
    /// How long the group must sit unmatched before remote agents may take it.
    /// `None` uses the broker's default.
    pub remote_timeout_secs: Option<i64>,
    /// Last time a local agent matched this group (or its creation time).
    pub idle_since: DateTime<Utc>,
}

impl WaitingAggregate {
    /// Creates an unconstrained aggregate for `user`.
    pub fn new(entry_id: i64, user: impl Into<String>, oldest_queue_id: i64) -> Self {
        Self {
            entry_id,
            counter: 1,
            user: user.into(),
            sites: Vec::new(),
            ces: Vec::new(),
            excluded_ces: Vec::new(),
            packages: Vec::new(),
            partitions: Vec::new(),
            excluded_partitions: Vec::new(),
            ttl: 3600,
            disk: 0,
            priority: 0.0,
            price: 1.0,
            oldest_queue_id,
            remote_allowed: false,
            remote_timeout_secs: None,
            idle_since: Utc::now(),
        }
    }

    pub fn with_counter(mut self, counter: i64) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sites = sites.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ces<I, S>(mut self, ces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ces = ces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_excluded_ces<I, S>(mut self, ces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_ces = ces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_excluded_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_partitions = partitions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_disk(mut self, disk: i64) -> Self {
        self.disk = disk;
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    /// Allows remote agents to take the group after it idled for `timeout_secs`
    /// (or the broker default when `None`).
    pub fn remote(mut self, timeout_secs: Option<i64>) -> Self {
        self.remote_allowed = true;
        self.remote_timeout_secs = timeout_secs;
        self
    }

    pub fn with_idle_since(mut self, idle_since: DateTime<Utc>) -> Self {
        self.idle_since = idle_since;
        self
    }

    /// The requested site, or one of the agent's extra sites, is acceptable.
    pub fn accepts_site(&self, site: &str, extra_sites: &[String]) -> bool {
        self.sites.is_empty()
            || self
                .sites
                .iter()
                .any(|s| s == site || extra_sites.contains(s))
    }

    pub fn accepts_ce(&self, ce: &str) -> bool {
        let listed = self.ces.is_empty() || self.ces.iter().any(|c| c == ce);
        listed && !self.excluded_ces.iter().any(|c| c == ce)
    }

    /// `partitions` are the partitions the requesting site exposes.
    pub fn accepts_partitions(&self, partitions: &[String]) -> bool {
        let restricted = self.partitions.is_empty()
            || partitions.iter().any(|p| self.partitions.contains(p));
        restricted && !partitions.iter().any(|p| self.excluded_partitions.contains(p))
    }

    /// True once the group has been unmatched for at least its remote timeout.
    pub fn idle_long_enough(&self, now: DateTime<Utc>, default_timeout_secs: i64) -> bool {
        let timeout = self.remote_timeout_secs.unwrap_or(default_timeout_secs);
        (now - self.idle_since).num_seconds() >= timeout
    }
}
