//! Interval-driven background tasks.
//!
//! The liveness sweep and the priority batch each run on their own
//! `PeriodicTask`. A failed cycle is logged and the next tick tries again.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A named task run every `interval` until shutdown.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    /// Skip the tick that fires immediately on spawn.
    delay_first: bool,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            delay_first: false,
        }
    }

    pub fn delay_first(mut self) -> Self {
        self.delay_first = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawns the loop. `cycle` is called once per tick; overlapping runs
    /// never happen because the next tick waits for the previous cycle.
    pub fn spawn<F, Fut, T, E>(
        self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut cycle: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: Display + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if self.delay_first {
                ticker.tick().await;
            }

            tracing::info!(
                task = self.name,
                interval_secs = self.interval.as_secs(),
                "Periodic task started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = self.name, "Periodic task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cycle().await {
                            tracing::error!(task = self.name, error = %e, "Periodic cycle failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_each_tick_until_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = PeriodicTask::new("test", Duration::from_secs(10)).spawn(shutdown_rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // Ticks at 0s, 10s and 20s.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_the_loop() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let handle = PeriodicTask::new("failing", Duration::from_secs(1))
            .delay_first()
            .spawn(shutdown_rx, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("store unavailable")
                }
            });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
