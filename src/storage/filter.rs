//! Constraint sets used to look up waiting aggregates.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;

use crate::job::WaitingAggregate;
use crate::priority::PriorityRecord;

/// How required packages are checked against the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageCheck {
    /// Packages are not a constraint.
    Ignore,
    /// Every required package must be in the set.
    Installed(BTreeSet<String>),
}

/// Remote-tier constraint: the group must allow remote execution and have
/// idled locally for at least its remote timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCriteria {
    pub now: DateTime<Utc>,
    pub default_timeout_secs: i64,
}

/// One tier's constraint set. `None` fields are not constrained.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFilter {
    pub ce: Option<String>,
    pub site: Option<String>,
    pub extra_sites: Vec<String>,
    pub partitions: Option<Vec<String>>,
    /// Users the site accepts; empty accepts everyone not denied.
    pub allowed_users: Vec<String>,
    pub denied_users: Vec<String>,
    /// Time-to-live the agent still has, in seconds.
    pub ttl: i64,
    /// Scratch disk the agent offers, in kilobytes.
    pub disk: i64,
    pub packages: PackageCheck,
    pub remote: Option<RemoteCriteria>,
}

impl AggregateFilter {
    /// A filter constrained only by the agent's TTL and disk.
    pub fn new(ttl: i64, disk: i64) -> Self {
        Self {
            ce: None,
            site: None,
            extra_sites: Vec::new(),
            partitions: None,
            allowed_users: Vec::new(),
            denied_users: Vec::new(),
            ttl,
            disk,
            packages: PackageCheck::Ignore,
            remote: None,
        }
    }

    /// Whether `aggregate` satisfies every constraint of this filter.
    pub fn matches(&self, aggregate: &WaitingAggregate) -> bool {
        if aggregate.counter <= 0 || aggregate.ttl > self.ttl || aggregate.disk > self.disk {
            return false;
        }

        if let Some(ce) = &self.ce {
            if !aggregate.accepts_ce(ce) {
                return false;
            }
        }

        if let Some(site) = &self.site {
            if !aggregate.accepts_site(site, &self.extra_sites) {
                return false;
            }
        }

        if let Some(partitions) = &self.partitions {
            if !aggregate.accepts_partitions(partitions) {
                return false;
            }
        }

        if !self.allowed_users.is_empty() && !self.allowed_users.contains(&aggregate.user) {
            return false;
        }
        if self.denied_users.contains(&aggregate.user) {
            return false;
        }

        if let PackageCheck::Installed(installed) = &self.packages {
            if !aggregate.packages.iter().all(|p| installed.contains(p)) {
                return false;
            }
        }

        if let Some(remote) = &self.remote {
            if !aggregate.remote_allowed
                || !aggregate.idle_long_enough(remote.now, remote.default_timeout_secs)
            {
                return false;
            }
        }

        true
    }
}

/// Ranking weight of an aggregate: the owner's computed priority when the
/// priority engine has a row for them, the aggregate's own priority otherwise.
///
/// `None` means the owner is over quota and must not be matched.
pub fn effective_priority(
    aggregate: &WaitingAggregate,
    owner: Option<&PriorityRecord>,
) -> Option<f64> {
    match owner {
        Some(record) if record.is_excluded() => None,
        Some(record) => Some(record.computed_priority),
        None => Some(aggregate.priority),
    }
}

/// Orders ranked candidates best first.
pub fn rank(a: (f64, &WaitingAggregate), b: (f64, &WaitingAggregate)) -> Ordering {
    OrderedFloat(b.0)
        .cmp(&OrderedFloat(a.0))
        .then_with(|| OrderedFloat(b.1.price).cmp(&OrderedFloat(a.1.price)))
        .then_with(|| a.1.oldest_queue_id.cmp(&b.1.oldest_queue_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_filter() -> AggregateFilter {
        let mut filter = AggregateFilter::new(86_400, 10_000_000);
        filter.ce = Some("ALICE::CERN::LCG".to_string());
        filter.site = Some("CERN".to_string());
        filter.partitions = Some(vec!["cpu".to_string()]);
        filter.packages = PackageCheck::Installed(
            ["VO_ALICE@ROOT::v6".to_string()].into_iter().collect(),
        );
        filter
    }

    #[test]
    fn test_matches_unconstrained_aggregate() {
        let agg = WaitingAggregate::new(1, "alice", 100);
        assert!(full_filter().matches(&agg));
    }

    #[test]
    fn test_empty_counter_never_matches() {
        let agg = WaitingAggregate::new(1, "alice", 100).with_counter(0);
        assert!(!AggregateFilter::new(86_400, 10_000_000).matches(&agg));
    }

    #[test]
    fn test_ttl_and_disk_ceilings() {
        let agg = WaitingAggregate::new(1, "alice", 100).with_ttl(7200).with_disk(500);
        assert!(AggregateFilter::new(7200, 500).matches(&agg));
        assert!(!AggregateFilter::new(3600, 500).matches(&agg));
        assert!(!AggregateFilter::new(7200, 499).matches(&agg));
    }

    #[test]
    fn test_missing_package_fails_only_when_checked() {
        let agg = WaitingAggregate::new(1, "alice", 100).with_packages(["VO_ALICE@AliPhysics::v1"]);
        let mut filter = full_filter();
        assert!(!filter.matches(&agg));

        filter.packages = PackageCheck::Ignore;
        assert!(filter.matches(&agg));
    }

    #[test]
    fn test_user_lists() {
        let agg = WaitingAggregate::new(1, "alice", 100);

        let mut filter = full_filter();
        filter.allowed_users = vec!["bob".to_string()];
        assert!(!filter.matches(&agg));

        filter.allowed_users = vec!["alice".to_string()];
        assert!(filter.matches(&agg));

        filter.denied_users = vec!["alice".to_string()];
        assert!(!filter.matches(&agg));
    }

    #[test]
    fn test_remote_criteria() {
        let now = Utc::now();
        let mut filter = AggregateFilter::new(86_400, 10_000_000);
        filter.remote = Some(RemoteCriteria {
            now,
            default_timeout_secs: 12 * 3600,
        });

        let local_only = WaitingAggregate::new(1, "alice", 100)
            .with_idle_since(now - chrono::Duration::hours(24));
        assert!(!filter.matches(&local_only));

        let fresh = WaitingAggregate::new(2, "alice", 100).remote(None);
        assert!(!filter.matches(&fresh));

        let idle = WaitingAggregate::new(3, "alice", 100)
            .remote(None)
            .with_idle_since(now - chrono::Duration::hours(12));
        assert!(filter.matches(&idle));
    }

    #[test]
    fn test_effective_priority() {
        let agg = WaitingAggregate::new(1, "alice", 100).with_priority(5.0);
        assert_eq!(effective_priority(&agg, None), Some(5.0));

        let mut record = PriorityRecord::new("alice", 10.0);
        record.computed_priority = 450.0;
        assert_eq!(effective_priority(&agg, Some(&record)), Some(450.0));

        record.computed_priority = -1.0;
        assert_eq!(effective_priority(&agg, Some(&record)), None);
    }

    #[test]
    fn test_rank_order() {
        let old_cheap = WaitingAggregate::new(1, "a", 10).with_price(1.0);
        let new_cheap = WaitingAggregate::new(2, "b", 20).with_price(1.0);
        let new_pricey = WaitingAggregate::new(3, "c", 30).with_price(2.0);

        let mut ranked = vec![(5.0, &new_cheap), (5.0, &new_pricey), (5.0, &old_cheap), (9.0, &new_cheap)];
        ranked.sort_by(|a, b| rank(*a, *b));

        assert_eq!(ranked[0].0, 9.0);
        assert_eq!(ranked[1].1.entry_id, 3);
        assert_eq!(ranked[2].1.entry_id, 1);
        assert_eq!(ranked[3].1.entry_id, 2);
    }
}
