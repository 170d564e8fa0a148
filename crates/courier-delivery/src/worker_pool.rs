//! Background task supervision with structured concurrency.
//!
//! Runs the retry poller and the stale-batch sweeper until cancelled and
//! shuts them down within a timeout, letting in-flight attempts finish.
//! The poller only dispatches attempts; they run on the orchestrator's
//! task tracker so one slow subscriber never stalls the poll loop.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    batch::BatchBuffer,
    engine::DeliveryConfig,
    error::{DeliveryError, Result},
    orchestrator::DeliveryOrchestrator,
    stats::EngineStats,
};

/// Pause after a failed poll before trying again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Supervises the engine's periodic tasks.
pub struct WorkerPool {
    orchestrator: Arc<DeliveryOrchestrator>,
    batches: Arc<BatchBuffer>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Creates a pool; nothing runs until [`WorkerPool::spawn_workers`].
    pub fn new(
        orchestrator: Arc<DeliveryOrchestrator>,
        batches: Arc<BatchBuffer>,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { orchestrator, batches, config, stats, cancellation_token, clock, handles: Vec::new() }
    }

    /// Spawns the retry poller and the batch sweeper.
    pub async fn spawn_workers(&mut self) {
        let poller = RetryPoller {
            orchestrator: self.orchestrator.clone(),
            poll_interval: self.config.poll_interval,
            token: self.cancellation_token.clone(),
            clock: self.clock.clone(),
        };
        self.handles.push(("retry-poller", tokio::spawn(async move { poller.run().await })));

        let sweeper = BatchSweeper {
            batches: self.batches.clone(),
            interval: self.config.batch_sweep_interval,
            token: self.cancellation_token.clone(),
            clock: self.clock.clone(),
        };
        self.handles.push(("batch-sweeper", tokio::spawn(async move { sweeper.run().await })));

        self.stats.write().await.active_workers = self.handles.len();
        info!(tasks = self.handles.len(), "background tasks spawned");
    }

    /// Cancels the tasks and waits for them, including in-flight attempts.
    ///
    /// # Errors
    ///
    /// - `ShutdownTimeout` if the tasks outlive `timeout`
    /// - `WorkerPanic` if a task panicked
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            tasks = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.handles);

        let orchestrator = self.orchestrator.clone();
        let joined = tokio::time::timeout(timeout, async {
            let mut panicked = None;
            for (name, handle) in handles {
                if let Err(join_error) = handle.await {
                    error!(task = name, error = %join_error, "background task panicked during shutdown");
                    panicked.get_or_insert(DeliveryError::WorkerPanic {
                        worker_id: name.to_string(),
                        error: join_error.to_string(),
                    });
                }
            }

            let running = orchestrator.running_attempts();
            if running > 0 {
                info!(running, "waiting for in-flight attempts");
            }
            orchestrator.wait_for_attempts().await;
            panicked
        })
        .await;

        self.stats.write().await.active_workers = 0;

        match joined {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "shutdown timed out, some tasks may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|(_, handle)| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|(_, handle)| !handle.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_tasks = active, "worker pool dropped without shutdown, cancelling tasks");
            self.cancellation_token.cancel();
        }
    }
}

/// Claims due deliveries on every tick or wake-up.
struct RetryPoller {
    orchestrator: Arc<DeliveryOrchestrator>,
    poll_interval: Duration,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl RetryPoller {
    async fn run(&self) {
        info!(poll_interval_ms = self.poll_interval.as_millis(), "retry poller starting");

        loop {
            if self.token.is_cancelled() {
                break;
            }

            match self.orchestrator.dispatch_due().await {
                // A full batch means more is probably due.
                Ok(claimed) if claimed >= self.orchestrator.claim_batch_size() => continue,
                Ok(_) => {
                    tokio::select! {
                        () = self.clock.sleep(self.poll_interval) => {}
                        () = self.orchestrator.notified() => {}
                        () = self.token.cancelled() => break,
                    }
                },
                Err(e) => {
                    error!(error = %e, "claiming due deliveries failed");
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.token.cancelled() => break,
                    }
                },
            }
        }

        info!("retry poller stopped");
    }
}

/// Flushes batches that waited past their maximum.
struct BatchSweeper {
    batches: Arc<BatchBuffer>,
    interval: Duration,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl BatchSweeper {
    async fn run(&self) {
        loop {
            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.token.cancelled() => break,
            }

            match self.batches.flush_stale().await {
                Ok(0) => {},
                Ok(flushed) => debug!(flushed, "stale batches flushed"),
                Err(e) => warn!(target: "courier::degraded", error = %e, "stale batch sweep failed"),
            }
        }

        debug!("batch sweeper stopped");
    }
}
