//! The tiered job broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::BrokerError;
use crate::job::{JobStatus, TransitionActor, WaitingAggregate};
use crate::metrics::MetricsCollector;
use crate::storage::{
    AggregateFilter, ClaimTarget, ClaimedJob, PackageCheck, StatusChange, TaskQueueStore, TraceSink,
};

use super::outcome::{AssignedJob, MatchOutcome, MatchTier, NoMatchReason};
use super::request::{MatchRequest, ResolvedRequest};
use super::site::SiteDirectory;
use super::token::{JobTokenRequest, TokenIssuer};

/// Site queue status recorded when a CE's request exhausts every tier.
pub const NO_MATCH_STATUS: &str = "jobagent-no-match";

/// Trace tag for broker entries.
const TRACE_TAG: &str = "state";

/// Broker tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Identity used when requesting job tokens.
    pub principal: String,
    pub token_validity: Duration,
    /// Remote timeout for aggregates that do not carry their own.
    pub remote_timeout_secs: i64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            principal: "grid-broker".to_string(),
            token_validity: Duration::from_secs(86_400),
            remote_timeout_secs: 12 * 3600,
        }
    }
}

/// Matches agents to waiting jobs.
///
/// Stateless: every call reads the store afresh, so any number of brokers
/// may serve the same queue. The store's claim statement is the only point
/// of mutual exclusion.
pub struct JobBroker {
    store: Arc<dyn TaskQueueStore>,
    traces: Arc<dyn TraceSink>,
    directory: Arc<dyn SiteDirectory>,
    tokens: Arc<dyn TokenIssuer>,
    settings: BrokerSettings,
    metrics: MetricsCollector,
}

impl JobBroker {
    pub fn new(
        store: Arc<dyn TaskQueueStore>,
        traces: Arc<dyn TraceSink>,
        directory: Arc<dyn SiteDirectory>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            store,
            traces,
            directory,
            tokens,
            settings: BrokerSettings::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_settings(mut self, settings: BrokerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Finds work for an agent.
    ///
    /// "Nothing to run" and "install packages" are outcomes, not errors.
    ///
    /// # Errors
    ///
    /// Store and directory failures propagate unchanged. A claimed job whose
    /// credential could not be issued is moved to `ERROR_A` and reported as
    /// `BrokerError::CredentialIssuance`.
    pub async fn match_job(&self, request: &MatchRequest) -> Result<MatchOutcome, BrokerError> {
        let started = Instant::now();
        let result = self.run_tiers(request).await;
        let latency = started.elapsed().as_secs_f64();

        match &result {
            Ok(outcome) => {
                let tier = outcome.tier().map(|t| t.as_str()).unwrap_or("none");
                self.metrics.record_match(outcome.label(), tier, latency);
                tracing::info!(
                    ce = %request.ce,
                    host = %request.host,
                    outcome = outcome.label(),
                    tier = tier,
                    code = outcome.code(),
                    latency_ms = latency * 1000.0,
                    "Match request served"
                );
            }
            Err(e) => {
                self.metrics.record_match("error", "none", latency);
                tracing::warn!(
                    ce = %request.ce,
                    host = %request.host,
                    error = %e,
                    transient = e.is_transient(),
                    "Match request failed"
                );
            }
        }

        result
    }

    async fn run_tiers(&self, request: &MatchRequest) -> Result<MatchOutcome, BrokerError> {
        request.validate()?;

        if let Some(queue) = self.store.site_queue(&request.ce).await? {
            if queue.blocked {
                return Ok(MatchOutcome::NothingToRun {
                    reason: NoMatchReason::QueueBlocked,
                });
            }
        }

        let requirements = self.directory.lookup(&request.ce, &request.site).await?;
        let resolved = ResolvedRequest::new(request.clone(), requirements);
        let packages = resolved.inventory.check();

        if let Some(outcome) = self
            .try_tier(
                &resolved,
                resolved.local_filter(packages.clone()),
                resolved.local_filter(PackageCheck::Ignore),
                MatchTier::Full,
                MatchTier::PackageFallback,
            )
            .await?
        {
            return Ok(outcome);
        }

        if request.accepts_remote {
            let now = Utc::now();
            let timeout = self.settings.remote_timeout_secs;

            if let Some(outcome) = self
                .try_tier(
                    &resolved,
                    resolved.remote_filter(packages.clone(), now, timeout),
                    resolved.remote_filter(PackageCheck::Ignore, now, timeout),
                    MatchTier::Remote,
                    MatchTier::RemotePackageFallback,
                )
                .await?
            {
                return Ok(outcome);
            }
        }

        self.store
            .set_site_queue_status(&request.ce, &request.site, NO_MATCH_STATUS)
            .await?;

        Ok(MatchOutcome::NothingToRun {
            reason: NoMatchReason::NoCandidate,
        })
    }

    /// One claim tier followed by its package-fallback tier.
    async fn try_tier(
        &self,
        resolved: &ResolvedRequest,
        strict: AggregateFilter,
        relaxed: AggregateFilter,
        claim_tier: MatchTier,
        fallback_tier: MatchTier,
    ) -> Result<Option<MatchOutcome>, BrokerError> {
        if let Some(aggregate) = self.store.find_waiting_aggregate(&strict).await? {
            return self.claim(resolved, &aggregate, claim_tier).await.map(Some);
        }

        if !resolved.inventory.constrains() {
            return Ok(None);
        }

        let Some(aggregate) = self.store.find_waiting_aggregate(&relaxed).await? else {
            return Ok(None);
        };

        let missing = resolved.inventory.missing(&aggregate.packages);
        if missing.is_empty() {
            // Became satisfiable between the two lookups.
            return self.claim(resolved, &aggregate, claim_tier).await.map(Some);
        }

        tracing::debug!(
            ce = %resolved.request.ce,
            aggregate = aggregate.entry_id,
            missing = ?missing,
            tier = fallback_tier.as_str(),
            "Matching work needs packages"
        );

        Ok(Some(MatchOutcome::InstallPackages {
            packages: missing,
            tier: fallback_tier,
        }))
    }

    async fn claim(
        &self,
        resolved: &ResolvedRequest,
        aggregate: &WaitingAggregate,
        tier: MatchTier,
    ) -> Result<MatchOutcome, BrokerError> {
        let request = &resolved.request;
        let target = ClaimTarget {
            site: request.site.clone(),
            ce: request.ce.clone(),
            host: request.host.clone(),
        };

        let Some(claimed) = self.store.claim_waiting_job(aggregate, &target).await? else {
            self.metrics.record_claim_conflict();
            tracing::debug!(
                ce = %request.ce,
                aggregate = aggregate.entry_id,
                "Lost claim to a concurrent matcher"
            );
            return Ok(MatchOutcome::NothingToRun {
                reason: NoMatchReason::ClaimConflict,
            });
        };

        if let Err(e) = self
            .store
            .decrement_aggregate(aggregate.entry_id, !tier.is_remote())
            .await
        {
            tracing::warn!(
                aggregate = aggregate.entry_id,
                error = %e,
                "Failed to decrement waiting aggregate"
            );
        }

        let token_request = JobTokenRequest::for_job(
            &self.settings.principal,
            &claimed.owner.user,
            claimed.queue_id,
            claimed.resubmission,
            self.settings.token_validity,
        );

        let token = match self.tokens.issue(&token_request).await {
            Ok(token) => token,
            Err(source) => {
                self.metrics.record_credential_failure();
                self.roll_back(&claimed, &token_request, &source.to_string()).await;
                return Err(BrokerError::CredentialIssuance {
                    queue_id: claimed.queue_id,
                    source,
                });
            }
        };

        self.record_assignment(&claimed, &target).await;

        tracing::info!(
            queue_id = claimed.queue_id,
            resubmission = claimed.resubmission,
            user = %claimed.owner.user,
            ce = %target.ce,
            host = %target.host,
            tier = tier.as_str(),
            "Job assigned"
        );

        Ok(MatchOutcome::Assigned(AssignedJob {
            queue_id: claimed.queue_id,
            resubmission: claimed.resubmission,
            jdl: claimed.jdl,
            owner: claimed.owner,
            token,
            tier,
        }))
    }

    /// Audit entry and site counters. The job is already the agent's, so
    /// failures here are logged only.
    async fn record_assignment(&self, claimed: &ClaimedJob, target: &ClaimTarget) {
        let message = format!("job assigned to {}", target.ce);
        if let Err(e) = self
            .traces
            .append_trace(claimed.queue_id, TRACE_TAG, &message)
            .await
        {
            tracing::warn!(queue_id = claimed.queue_id, error = %e, "Failed to append job trace");
        }

        if let Err(e) = self
            .store
            .adjust_site_counters(&target.ce, &target.site, 1, -1)
            .await
        {
            tracing::warn!(ce = %target.ce, error = %e, "Failed to adjust site counters");
        }
    }

    /// Pushes a claimed job to `ERROR_A` and revokes whatever was issued.
    async fn roll_back(&self, claimed: &ClaimedJob, token_request: &JobTokenRequest, reason: &str) {
        let change = StatusChange::new(
            claimed.queue_id,
            claimed.resubmission,
            JobStatus::ErrorA,
            TransitionActor::Broker,
        );

        match self.store.update_job_status(&change).await {
            Ok(update) if update.is_applied() => {}
            Ok(update) => tracing::error!(
                queue_id = claimed.queue_id,
                update = ?update,
                "Rollback of unusable claim did not apply"
            ),
            Err(e) => tracing::error!(
                queue_id = claimed.queue_id,
                error = %e,
                "Rollback of unusable claim failed"
            ),
        }

        if let Err(e) = self.tokens.revoke(token_request).await {
            tracing::warn!(
                queue_id = claimed.queue_id,
                error = %e,
                "Failed to revoke job token"
            );
        }

        let message = format!("credential issuance failed: {}", reason);
        if let Err(e) = self
            .traces
            .append_trace(claimed.queue_id, TRACE_TAG, &message)
            .await
        {
            tracing::warn!(queue_id = claimed.queue_id, error = %e, "Failed to append job trace");
        }

        tracing::warn!(
            queue_id = claimed.queue_id,
            reason = reason,
            "Claim rolled back to ERROR_A"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::site::StaticSiteDirectory;
    use crate::broker::token::JobToken;
    use crate::error::CredentialError;
    use crate::job::{Job, JobOwner};
    use crate::storage::MemoryTaskQueueStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedIssuer {
        fail: bool,
        revoked: AtomicUsize,
    }

    impl FixedIssuer {
        fn ok() -> Self {
            Self {
                fail: false,
                revoked: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                revoked: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenIssuer for FixedIssuer {
        async fn issue(&self, request: &JobTokenRequest) -> Result<JobToken, CredentialError> {
            if self.fail {
                return Err(CredentialError::Unreachable("down".to_string()));
            }
            Ok(JobToken {
                certificate: format!("cert-{}", request.extension),
                private_key: "key".to_string(),
                serial: None,
            })
        }

        async fn revoke(&self, _request: &JobTokenRequest) -> Result<(), CredentialError> {
            self.revoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn broker(store: Arc<MemoryTaskQueueStore>, issuer: Arc<FixedIssuer>) -> JobBroker {
        JobBroker::new(
            store.clone(),
            store,
            Arc::new(StaticSiteDirectory::empty()),
            issuer,
        )
    }

    async fn store_with_job(aggregate: WaitingAggregate) -> Arc<MemoryTaskQueueStore> {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let entry_id = aggregate.entry_id;
        store.insert_aggregate(aggregate).await;
        store
            .insert_job(Job::new(100, JobOwner::new("alice", "submit"), "jdl").with_aggregate(entry_id))
            .await;
        store
    }

    fn request() -> MatchRequest {
        MatchRequest::new("ALICE::CERN::LCG", "CERN", "wn001", 86_400).with_disk(1_000_000)
    }

    #[tokio::test]
    async fn test_full_tier_assigns_and_records() {
        let store = store_with_job(WaitingAggregate::new(1, "alice", 100)).await;
        let broker = broker(store.clone(), Arc::new(FixedIssuer::ok()));

        let outcome = broker.match_job(&request()).await.unwrap();
        match outcome {
            MatchOutcome::Assigned(job) => {
                assert_eq!(job.queue_id, 100);
                assert_eq!(job.resubmission, 1);
                assert_eq!(job.tier, MatchTier::Full);
                assert_eq!(job.token.certificate, "cert-100/1");
            }
            other => panic!("unexpected {:?}", other),
        }

        let trace = store.job_trace(100).await.unwrap();
        assert_eq!(trace[0].message, "job assigned to ALICE::CERN::LCG");

        let queue = store.site_queue("ALICE::CERN::LCG").await.unwrap().unwrap();
        assert_eq!(queue.assigned, 1);
        assert_eq!(store.aggregate(1).await.unwrap().counter, 0);
    }

    #[tokio::test]
    async fn test_missing_packages_returns_install_instruction() {
        let store = store_with_job(
            WaitingAggregate::new(1, "alice", 100).with_packages(["VO_ALICE@ROOT::v6"]),
        )
        .await;
        let broker = broker(store.clone(), Arc::new(FixedIssuer::ok()));

        let outcome = broker
            .match_job(&request().with_packages("VO_ALICE@Other::v1"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MatchOutcome::InstallPackages {
                packages: vec!["VO_ALICE@ROOT::v6".to_string()],
                tier: MatchTier::PackageFallback,
            }
        );
        assert_eq!(store.job(100).await.unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_shared_packages_skip_package_check() {
        let store = store_with_job(
            WaitingAggregate::new(1, "alice", 100).with_packages(["VO_ALICE@ROOT::v6"]),
        )
        .await;
        let broker = broker(store, Arc::new(FixedIssuer::ok()));

        let outcome = broker
            .match_job(&request().with_shared_packages())
            .await
            .unwrap();
        assert!(outcome.is_assigned());
    }

    #[tokio::test]
    async fn test_exhausted_marks_site_queue() {
        let store = store_with_job(WaitingAggregate::new(1, "alice", 100).with_ces(["OTHER::CE"])).await;
        let broker = broker(store.clone(), Arc::new(FixedIssuer::ok()));

        let outcome = broker.match_job(&request()).await.unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::NothingToRun {
                reason: NoMatchReason::NoCandidate
            }
        );

        let queue = store.site_queue("ALICE::CERN::LCG").await.unwrap().unwrap();
        assert_eq!(queue.status, NO_MATCH_STATUS);
    }

    #[tokio::test]
    async fn test_blocked_queue_short_circuits() {
        let store = store_with_job(WaitingAggregate::new(1, "alice", 100)).await;
        store.set_site_queue_blocked("ALICE::CERN::LCG", true).await.unwrap();
        let broker = broker(store.clone(), Arc::new(FixedIssuer::ok()));

        let outcome = broker.match_job(&request()).await.unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::NothingToRun {
                reason: NoMatchReason::QueueBlocked
            }
        );
        assert_eq!(store.job(100).await.unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_credential_failure_rolls_back() {
        let store = store_with_job(WaitingAggregate::new(1, "alice", 100)).await;
        let issuer = Arc::new(FixedIssuer::failing());
        let broker = broker(store.clone(), issuer.clone());

        let result = broker.match_job(&request()).await;
        assert!(matches!(
            result,
            Err(BrokerError::CredentialIssuance { queue_id: 100, .. })
        ));

        assert_eq!(store.job(100).await.unwrap().status, JobStatus::ErrorA);
        assert_eq!(issuer.revoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_is_an_error() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let broker = broker(store, Arc::new(FixedIssuer::ok()));

        let result = broker
            .match_job(&MatchRequest::new("CE", "SITE", "host", 0))
            .await;
        assert!(matches!(result, Err(BrokerError::InvalidRequest(_))));
    }
}
