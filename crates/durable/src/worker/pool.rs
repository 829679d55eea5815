//! Worker pool for driving workflow runs
//!
//! Manages concurrent run execution with a semaphore and graceful shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, WakePoller};
use crate::engine::{Orchestrator, OrchestratorError};
use crate::persistence::Pagination;
use crate::reliability::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Worker identity used in logs
    pub worker_id: String,

    /// Maximum runs driven at once
    pub max_concurrency: usize,

    /// Capacity of the queue between the event bus and the pool
    pub dispatch_capacity: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// How often failed runs are reported
    #[serde(with = "duration_millis")]
    pub failed_report_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: 10,
            dispatch_capacity: 1024,
            poller: PollerConfig::default(),
            failed_report_interval: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_failed_report_interval(mut self, interval: Duration) -> Self {
        self.failed_report_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Not started, or fully stopped
    Stopped,
    /// Driving runs
    Running,
    /// Finishing in-flight runs, not starting new ones
    Draining,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Orchestrator error
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {remaining} runs in flight")]
    ShutdownTimeout { remaining: usize },
}

/// Drives one run per permit, never the same run twice at once
#[derive(Clone)]
struct RunLauncher {
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl RunLauncher {
    /// Spawn a drive of `run_id` once a permit is free
    ///
    /// Returns `false` if shutdown was signaled while waiting.
    async fn launch(&self, run_id: Uuid, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        if !self.in_flight.lock().insert(run_id) {
            debug!(%run_id, "run already in flight");
            return true;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = shutdown_rx.changed() => None,
        };
        let Some(permit) = permit else {
            self.in_flight.lock().remove(&run_id);
            return false;
        };

        let launcher = self.clone();
        tokio::spawn(async move {
            match launcher.orchestrator.drive_run(run_id).await {
                Ok(outcome) => debug!(%run_id, ?outcome, "run driven"),
                Err(e) => error!(%run_id, error = %e, "failed to drive run"),
            }
            launcher.in_flight.lock().remove(&run_id);
            drop(permit);
        });
        true
    }
}

/// Worker pool for driving runs
///
/// Runs reach the pool two ways: pushed by the event bus through the
/// dispatch queue right after they are created, and found by the
/// [`WakePoller`] once they are due. Both paths share one semaphore.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(orchestrator, WorkerPoolConfig::new().with_max_concurrency(20));
/// bus.attach_dispatcher(pool.dispatcher());
///
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    config: WorkerPoolConfig,
    launcher: RunLauncher,
    dispatch_tx: mpsc::Sender<Uuid>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<Uuid>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_capacity.max(1));
        let launcher = RunLauncher {
            orchestrator: Arc::clone(&orchestrator),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        };

        Self {
            orchestrator,
            config,
            launcher,
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Sender for newly created run ids
    pub fn dispatcher(&self) -> mpsc::Sender<Uuid> {
        self.dispatch_tx.clone()
    }

    /// Start the dispatch, poll and report loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        let Some(dispatch_rx) = self.dispatch_rx.lock().take() else {
            return Err(WorkerPoolError::AlreadyRunning);
        };

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        *self.status.write() = WorkerPoolStatus::Running;

        let handles = vec![
            self.spawn_dispatch_loop(dispatch_rx),
            self.spawn_poll_loop(),
            self.spawn_failed_report_loop(),
        ];
        self.handles.lock().extend(handles);

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// In-flight runs are given `shutdown_timeout` to reach their next
    /// checkpoint. A run cut off mid-step is recovered later as stale.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if *self.status.read() != WorkerPoolStatus::Running {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");

        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                debug!("All runs drained");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_runs = in_flight, "Shutdown timeout reached");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout {
                    remaining: in_flight,
                });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Runs currently being driven
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.launcher.permits.available_permits()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn spawn_dispatch_loop(&self, mut dispatch_rx: mpsc::Receiver<Uuid>) -> JoinHandle<()> {
        let launcher = self.launcher.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                let run_id = tokio::select! {
                    run_id = dispatch_rx.recv() => run_id,
                    _ = shutdown_rx.changed() => None,
                };
                let Some(run_id) = run_id else {
                    break;
                };
                if !launcher.launch(run_id, &mut shutdown_rx).await {
                    break;
                }
            }

            debug!("Dispatch loop exited");
        })
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let launcher = self.launcher.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut poller = WakePoller::new(
            Arc::clone(&self.orchestrator),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );

        tokio::spawn(async move {
            'poll: loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                match poller.poll().await {
                    Ok(run_ids) => {
                        for run_id in run_ids {
                            if !launcher.launch(run_id, &mut shutdown_rx).await {
                                break 'poll;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        })
    }

    fn spawn_failed_report_loop(&self) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let interval = self.config.failed_report_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match orchestrator.failed_runs(Pagination::default()).await {
                            Ok(runs) if !runs.is_empty() => {
                                let run_ids: Vec<String> =
                                    runs.iter().map(|r| r.id.to_string()).collect();
                                warn!(
                                    count = runs.len(),
                                    run_ids = %run_ids.join(","),
                                    "failed runs awaiting operator attention"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("Failed-run report failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Report loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Report loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new()
            .with_worker_id("test-worker")
            .with_max_concurrency(0)
            .with_dispatch_capacity(16)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.dispatch_capacity, 16);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_serializes_durations_as_millis() {
        let config = WorkerPoolConfig::new().with_shutdown_timeout(Duration::from_secs(2));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["shutdown_timeout"], 2000);
    }
}
