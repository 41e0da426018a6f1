//! Worker pool serving front-door commands.
//!
//! Commands are submitted through a `BrokerHandle` into a bounded channel.
//! A fixed number of workers pull from that channel and run each command
//! through the `Dispatcher`, replying on a oneshot channel. Shutdown is a
//! broadcast: workers finish the command in hand, then stop; commands still
//! queued are answered with `DispatchError::ShuttingDown`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::metrics::MetricsCollector;

use super::dispatch::{Command, Dispatcher, Response};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// The command channel was closed by an earlier shutdown.
    #[error("Pool has been shut down and cannot be restarted")]
    Closed,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Commands that may wait for a worker before `submit` blocks.
    pub queue_capacity: usize,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 8,
            queue_capacity: 256,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running a command.
    pub active_workers: usize,
    pub commands_completed: u64,
    /// Commands that returned an error.
    pub commands_failed: u64,
    pub average_command_duration: Duration,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.commands_completed + self.commands_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.commands_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    commands_completed: AtomicU64,
    commands_failed: AtomicU64,
    total_duration_us: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            commands_completed: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.commands_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.commands_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.commands_completed.load(Ordering::SeqCst);
        let failed = self.commands_failed.load(Ordering::SeqCst);
        let total_duration_us = self.total_duration_us.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_micros(total_duration_us / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            commands_completed: completed,
            commands_failed: failed,
            average_command_duration: average,
        }
    }
}

/// A queued command and where to send its answer.
struct Envelope {
    request_id: Uuid,
    command: Command,
    reply: oneshot::Sender<Result<Response, DispatchError>>,
    enqueued_at: Instant,
}

type CommandReceiver = Arc<Mutex<mpsc::Receiver<Envelope>>>;

/// Cloneable submission side of the pool.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Envelope>,
    metrics: MetricsCollector,
}

impl BrokerHandle {
    /// Queues `command` and waits for its response.
    ///
    /// Waits for room when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShuttingDown` once the pool stopped accepting
    /// commands, or the command's own error.
    pub async fn submit(&self, command: Command) -> Result<Response, DispatchError> {
        let (reply, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            request_id: Uuid::new_v4(),
            command,
            reply,
            enqueued_at: Instant::now(),
        };

        self.tx
            .send(envelope)
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;
        self.metrics.update_queue_depth(self.queue_depth());

        reply_rx.await.map_err(|_| DispatchError::ShuttingDown)?
    }

    /// Commands waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Worker pool that runs front-door commands concurrently.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    dispatcher: Arc<Dispatcher>,
    handle: BrokerHandle,
    commands: CommandReceiver,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    closed: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a stopped pool; call `start` to spawn the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for zero workers or capacity.
    pub fn new(config: WorkerPoolConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, PoolError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let metrics = MetricsCollector::new();

        Ok(Self {
            config,
            dispatcher,
            handle: BrokerHandle {
                tx,
                metrics: metrics.clone(),
            },
            commands: Arc::new(Mutex::new(rx)),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Handle for submitting commands. Valid before `start`; commands queue
    /// until workers exist.
    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running and
    /// `PoolError::Closed` after a shutdown.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.commands),
                Arc::clone(&self.dispatcher),
                self.shutdown_tx.subscribe(),
                Arc::clone(&self.stats),
                self.handle.clone(),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });
            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(
            num_workers = self.config.num_workers,
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the command in hand. Commands still queued afterwards
    /// are answered with `DispatchError::ShuttingDown`, and further submits
    /// fail the same way.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let joined = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;

        self.is_running.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        let rejected = self.reject_pending().await;
        self.metrics.update_workers(0);
        self.metrics.update_queue_depth(0);

        match joined {
            Ok(()) => {
                info!(rejected = rejected, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Closes the channel and answers everything still queued.
    async fn reject_pending(&self) -> usize {
        let mut rx = self.commands.lock().await;
        rx.close();

        let mut rejected = 0;
        while let Ok(envelope) = rx.try_recv() {
            let _ = envelope.reply.send(Err(DispatchError::ShuttingDown));
            rejected += 1;
        }
        rejected
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker pulling commands from the shared channel.
struct Worker {
    id: String,
    commands: CommandReceiver,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
    /// Used only to report queue depth.
    handle: BrokerHandle,
}

impl Worker {
    fn new(
        id: String,
        commands: CommandReceiver,
        dispatcher: Arc<Dispatcher>,
        shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<SharedPoolStats>,
        handle: BrokerHandle,
    ) -> Self {
        Self {
            id,
            commands,
            dispatcher,
            shutdown_rx,
            stats,
            handle,
        }
    }

    /// Main worker loop.
    ///
    /// Takes commands until a shutdown signal arrives or the channel closes.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    debug!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                next = recv(&self.commands) => next,
            };

            match next {
                Some(envelope) => {
                    self.handle
                        .metrics
                        .update_queue_depth(self.handle.queue_depth());
                    self.process(envelope).await;
                }
                None => {
                    debug!(worker_id = %self.id, "Command channel closed");
                    break;
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, envelope: Envelope) {
        let Envelope {
            request_id,
            command,
            reply,
            enqueued_at,
        } = envelope;

        let name = command.name();
        let waited = enqueued_at.elapsed();

        self.stats.increment_active();
        let start = Instant::now();
        let result = self.dispatcher.dispatch(command).await;
        let duration = start.elapsed();
        self.stats.decrement_active();

        if result.is_ok() {
            self.stats.record_completion(duration);
        } else {
            self.stats.record_failure(duration);
        }

        debug!(
            worker_id = %self.id,
            request_id = %request_id,
            command = name,
            waited_ms = waited.as_millis() as u64,
            duration_ms = duration.as_millis() as u64,
            "Command processed"
        );

        if let Err(unsent) = reply.send(result) {
            let assigned = matches!(
                unsent,
                Ok(Response::Match { ref outcome, .. }) if outcome.is_assigned()
            );
            if assigned {
                // The job stays ASSIGNED until the liveness sweep reclaims it.
                warn!(
                    worker_id = %self.id,
                    request_id = %request_id,
                    "Caller went away after a job was assigned"
                );
            } else {
                debug!(worker_id = %self.id, request_id = %request_id, "Caller went away");
            }
        }
    }
}

async fn recv(commands: &Mutex<mpsc::Receiver<Envelope>>) -> Option<Envelope> {
    commands.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobBroker, JobToken, JobTokenRequest, StaticSiteDirectory, TokenIssuer};
    use crate::error::CredentialError;
    use crate::job::{Job, JobOwner};
    use crate::storage::MemoryTaskQueueStore;
    use async_trait::async_trait;

    struct NullIssuer;

    #[async_trait]
    impl TokenIssuer for NullIssuer {
        async fn issue(&self, _request: &JobTokenRequest) -> Result<JobToken, CredentialError> {
            Err(CredentialError::Unreachable("unused".to_string()))
        }

        async fn revoke(&self, _request: &JobTokenRequest) -> Result<(), CredentialError> {
            Ok(())
        }
    }

    async fn dispatcher() -> Arc<Dispatcher> {
        let store = Arc::new(MemoryTaskQueueStore::new());
        store
            .insert_job(Job::new(1, JobOwner::new("alice", "submit"), "jdl"))
            .await;
        let broker = Arc::new(JobBroker::new(
            store.clone(),
            store.clone(),
            Arc::new(StaticSiteDirectory::empty()),
            Arc::new(NullIssuer),
        ));
        Arc::new(Dispatcher::new(store.clone(), store, broker))
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(2)
            .with_queue_capacity(16)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.num_workers, 2);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));

        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::new(1).with_queue_capacity(0).validate().is_err());
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_millis(10));
        stats.record_completion(Duration::from_millis(20));
        stats.record_failure(Duration::from_millis(30));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.commands_completed, 2);
        assert_eq!(pool_stats.commands_failed, 1);
        assert_eq!(pool_stats.average_command_duration, Duration::from_millis(20));
        assert_eq!(pool_stats.total_processed(), 3);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let mut pool = WorkerPool::new(WorkerPoolConfig::new(2), dispatcher().await).unwrap();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        let handle = pool.handle();
        let response = handle
            .submit(Command::GetJobs { queue_ids: vec![1] })
            .await
            .unwrap();
        match response {
            Response::Jobs { jobs } => assert_eq!(jobs[0].queue_id, 1),
            other => panic!("unexpected {:?}", other),
        }

        let err = handle
            .submit(Command::GetJobs { queue_ids: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidCommand(_)));

        let stats = pool.stats();
        assert_eq!(stats.commands_completed, 1);
        assert_eq!(stats.commands_failed, 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let mut pool = WorkerPool::new(WorkerPoolConfig::new(1), dispatcher().await).unwrap();
        pool.start().unwrap();
        let handle = pool.handle();

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert!(handle.is_closed());
        assert!(matches!(pool.start(), Err(PoolError::Closed)));
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));

        let err = handle
            .submit(Command::GetJobs { queue_ids: vec![1] })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_commands_queued_before_start_are_served() {
        let mut pool = WorkerPool::new(WorkerPoolConfig::new(1), dispatcher().await).unwrap();
        let handle = pool.handle();

        let pending = tokio::spawn(async move {
            handle.submit(Command::GetJobs { queue_ids: vec![1] }).await
        });
        tokio::task::yield_now().await;

        pool.start().unwrap();
        assert!(pending.await.unwrap().is_ok());
        pool.shutdown().await.unwrap();
    }
}
