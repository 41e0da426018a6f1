//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use grid_broker::broker::{JobBroker, JobToken, JobTokenRequest, StaticSiteDirectory, TokenIssuer};
use grid_broker::error::CredentialError;
use grid_broker::job::{Job, JobOwner, WaitingAggregate};
use grid_broker::storage::MemoryTaskQueueStore;

/// Issues `cert-<queueId>/<resubmission>` certificates, or always fails.
pub struct MockIssuer {
    fail: bool,
    pub issued: AtomicUsize,
    pub revoked: AtomicUsize,
}

impl MockIssuer {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            issued: AtomicUsize::new(0),
            revoked: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            issued: AtomicUsize::new(0),
            revoked: AtomicUsize::new(0),
        })
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for MockIssuer {
    async fn issue(&self, request: &JobTokenRequest) -> Result<JobToken, CredentialError> {
        if self.fail {
            return Err(CredentialError::Rejected {
                code: 503,
                message: "signing disabled".to_string(),
            });
        }
        self.issued.fetch_add(1, Ordering::SeqCst);
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

pub fn broker(store: &Arc<MemoryTaskQueueStore>, issuer: Arc<MockIssuer>) -> Arc<JobBroker> {
    Arc::new(JobBroker::new(
        store.clone(),
        store.clone(),
        Arc::new(StaticSiteDirectory::empty()),
        issuer,
    ))
}

/// Inserts `aggregate` and `jobs` waiting jobs under it, starting at `first_qid`.
pub async fn seed(store: &MemoryTaskQueueStore, aggregate: WaitingAggregate, first_qid: i64, jobs: i64) {
    let entry_id = aggregate.entry_id;
    let user = aggregate.user.clone();
    store.insert_aggregate(aggregate.with_counter(jobs)).await;
    for qid in first_qid..first_qid + jobs {
        store
            .insert_job(
                Job::new(qid, JobOwner::new(user.clone(), "submit01"), format!("Executable = \"job{}\";", qid))
                    .with_aggregate(entry_id),
            )
            .await;
    }
}
