//! Long-running broker process.
//!
//! Starts the command worker pool, the liveness and priority loops and,
//! optionally, a JSON-lines front door on stdin/stdout for a transport
//! sidecar. Runs until Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::context::SchedulerContext;
use crate::metrics::export_metrics;
use crate::scheduler::{BrokerHandle, Command, PeriodicTask, Response};

/// How often the metrics textfile is rewritten.
const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

/// One line read by the front door.
#[derive(Debug, Deserialize)]
pub struct FrontDoorRequest {
    /// Echoed back so the caller can pair replies with requests.
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub command: Command,
}

/// One line written by the front door.
#[derive(Debug, Serialize)]
pub struct FrontDoorReply {
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Ok(Response),
    Error { code: String, message: String },
}

impl FrontDoorReply {
    fn error(id: Option<serde_json::Value>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ReplyBody::Error {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

/// Runs one front-door line through the pool.
pub async fn handle_line(handle: &BrokerHandle, line: &str) -> FrontDoorReply {
    let request: FrontDoorRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return FrontDoorReply::error(None, "invalid", format!("unparseable command: {}", e)),
    };

    match handle.submit(request.command).await {
        Ok(response) => FrontDoorReply {
            id: request.id,
            body: ReplyBody::Ok(response),
        },
        Err(e) => FrontDoorReply::error(request.id, e.code(), e.to_string()),
    }
}

pub async fn run_serve(context: SchedulerContext, front_door: bool) -> anyhow::Result<()> {
    let config = context.config().clone();

    let mut pool = context.worker_pool()?;
    pool.start()?;
    let handle = pool.handle();

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let monitor = Arc::new(context.liveness_monitor());
    tasks.push(
        PeriodicTask::new("liveness", config.liveness_interval).spawn(shutdown_tx.subscribe(), move || {
            let monitor = monitor.clone();
            async move { monitor.run_cycle().await }
        }),
    );

    let engine = Arc::new(context.priority_engine());
    let scope = config.priority_scope();
    let instance = config.instance.clone();
    let priority_interval = config.priority_interval;
    tasks.push(
        PeriodicTask::new("priority", priority_interval).spawn(shutdown_tx.subscribe(), move || {
            let engine = engine.clone();
            let instance = instance.clone();
            async move { engine.run_if_due(scope, &instance, priority_interval).await }
        }),
    );

    if let Some(path) = config.metrics_file.clone() {
        tasks.push(
            PeriodicTask::new("metrics-export", METRICS_EXPORT_INTERVAL)
                .delay_first()
                .spawn(shutdown_tx.subscribe(), move || {
                    let path = path.clone();
                    async move { write_metrics_file(&path).await }
                }),
        );
    }

    if front_door {
        tasks.push(spawn_front_door(handle.clone(), shutdown_tx.subscribe()));
    }

    info!(
        instance = %config.instance,
        workers = config.workers,
        front_door = front_door,
        "Broker serving"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let _ = shutdown_tx.send(());
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        completed = stats.commands_completed,
        failed = stats.commands_failed,
        average_ms = stats.average_command_duration.as_millis() as u64,
        "Broker stopped"
    );

    Ok(())
}

/// Reads commands from stdin and writes replies to stdout, one JSON object
/// per line. Commands run concurrently, so replies may come out of order.
fn spawn_front_door(handle: BrokerHandle, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (reply_tx, mut reply_rx) = mpsc::channel::<FrontDoorReply>(256);

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(reply) = reply_rx.recv().await {
                let line = match serde_json::to_string(&reply) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode reply");
                        continue;
                    }
                };
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    warn!("Front door output closed");
                    break;
                }
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown_rx.recv() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let handle = handle.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let reply = handle_line(&handle, &line).await;
                        let _ = reply_tx.send(reply).await;
                    });
                }
                Ok(None) => {
                    info!("Front door input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read front door input");
                    break;
                }
            }
        }

        drop(reply_tx);
        let _ = writer.await;
    })
}

/// Writes the Prometheus text exposition to `path` via a rename, so a
/// textfile collector never reads a partial file.
pub async fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let mut tmp = PathBuf::from(path);
    tmp.set_extension("prom.tmp");

    tokio::fs::write(&tmp, export_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobToken, JobTokenRequest, StaticSiteDirectory, TokenIssuer};
    use crate::config::SchedulerConfig;
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

    #[tokio::test]
    async fn test_front_door_line_round_trip() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        store
            .insert_job(Job::new(5, JobOwner::new("alice", "submit"), "jdl"))
            .await;
        let context = SchedulerContext::with_store(
            SchedulerConfig::default().with_workers(1),
            store,
            Arc::new(StaticSiteDirectory::empty()),
            Arc::new(NullIssuer),
        );
        let mut pool = context.worker_pool().unwrap();
        pool.start().unwrap();
        let handle = pool.handle();

        let reply = handle_line(&handle, r#"{"id":"r1","command":"get_jobs","queue_ids":[5]}"#).await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["id"], "r1");
        assert_eq!(json["ok"]["response"], "jobs");
        assert_eq!(json["ok"]["jobs"][0]["queue_id"], 5);

        let reply = handle_line(&handle, "not json").await;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["error"]["code"], "invalid");

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_metrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.prom");

        write_metrics_file(&path).await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("broker.prom.tmp").exists());
    }
}
