//! The scheduler context: everything a component needs, built once.
//!
//! Components never reach for globals. They are constructed from a
//! `SchedulerContext`, which owns the store handles, the external
//! collaborators and the configuration.

use std::sync::Arc;

use thiserror::Error;

use crate::broker::{HttpTokenIssuer, JobBroker, SiteDirectory, StaticSiteDirectory, TokenIssuer};
use crate::config::{ConfigError, SchedulerConfig};
use crate::error::{CredentialError, DirectoryError, StoreError};
use crate::liveness::LivenessMonitor;
use crate::priority::PriorityEngine;
use crate::scheduler::{Dispatcher, PoolError, WorkerPool};
use crate::storage::{PgTaskQueueStore, TaskQueueStore, TraceSink};

/// Errors raised while wiring a context from configuration.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[derive(Clone)]
pub struct SchedulerContext {
    config: SchedulerConfig,
    store: Arc<dyn TaskQueueStore>,
    traces: Arc<dyn TraceSink>,
    directory: Arc<dyn SiteDirectory>,
    tokens: Arc<dyn TokenIssuer>,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskQueueStore>,
        traces: Arc<dyn TraceSink>,
        directory: Arc<dyn SiteDirectory>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            config,
            store,
            traces,
            directory,
            tokens,
        }
    }

    /// Builds a context over one store that also keeps the traces.
    pub fn with_store<S>(
        config: SchedulerConfig,
        store: Arc<S>,
        directory: Arc<dyn SiteDirectory>,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self
    where
        S: TaskQueueStore + TraceSink + 'static,
    {
        Self::new(config, store.clone(), store, directory, tokens)
    }

    /// Connects to PostgreSQL, loads the site directory and creates the
    /// HTTP token issuer.
    ///
    /// # Errors
    ///
    /// Fails if the token service URL is not configured, the database is
    /// unreachable, or the site directory file cannot be read.
    pub async fn connect(config: SchedulerConfig) -> Result<Self, ContextError> {
        let url = config
            .token_service_url
            .clone()
            .ok_or_else(|| ConfigError::MissingEnvVar("BROKER_TOKEN_SERVICE_URL".to_string()))?;
        let tokens = Arc::new(HttpTokenIssuer::new(url)?);

        let directory = Arc::new(match &config.site_directory {
            Some(path) => StaticSiteDirectory::load(path)?,
            None => {
                tracing::warn!("No site directory configured, matching without site requirements");
                StaticSiteDirectory::empty()
            }
        });

        let store = Arc::new(
            PgTaskQueueStore::connect(
                &config.database_url,
                config.max_connections,
                config.store_timeouts(),
            )
            .await?,
        );

        tracing::info!(instance = %config.instance, "Scheduler context ready");

        Ok(Self::with_store(config, store, directory, tokens))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskQueueStore> {
        self.store.clone()
    }

    pub fn traces(&self) -> Arc<dyn TraceSink> {
        self.traces.clone()
    }

    pub fn broker(&self) -> Arc<JobBroker> {
        Arc::new(
            JobBroker::new(
                self.store.clone(),
                self.traces.clone(),
                self.directory.clone(),
                self.tokens.clone(),
            )
            .with_settings(self.config.broker_settings()),
        )
    }

    pub fn liveness_monitor(&self) -> LivenessMonitor {
        LivenessMonitor::new(
            self.store.clone(),
            self.config.liveness_settings(),
            self.config.instance.clone(),
        )
    }

    pub fn priority_engine(&self) -> PriorityEngine {
        PriorityEngine::new(self.store.clone())
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.store.clone(),
            self.traces.clone(),
            self.broker(),
        ))
    }

    /// A stopped worker pool serving this context's dispatcher.
    pub fn worker_pool(&self) -> Result<WorkerPool, PoolError> {
        WorkerPool::new(self.config.pool_config(), self.dispatcher())
    }
}
