//! Wake polling with exponential backoff
//!
//! Finds runs that are ready to make progress: pending runs, sleeping runs
//! whose wake time has passed, and (less often) runs left `Running` by a
//! crashed worker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::engine::{Orchestrator, OrchestratorError};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when runs are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing is due
    pub backoff_multiplier: f64,

    /// How often to look for runs stranded in `Running`
    #[serde(with = "duration_millis")]
    pub stale_scan_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            stale_scan_interval: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_stale_scan_interval(mut self, interval: Duration) -> Self {
        self.stale_scan_interval = interval;
        self
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Wake poller with adaptive backoff
///
/// Backs off exponentially while nothing is due and resets to the minimum
/// interval as soon as a poll finds work.
pub struct WakePoller {
    orchestrator: Arc<Orchestrator>,
    config: PollerConfig,
    current_interval: Duration,
    last_stale_scan: Option<Instant>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WakePoller {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            orchestrator,
            current_interval: config.min_interval,
            config,
            last_stale_scan: None,
            shutdown_rx,
        }
    }

    /// Ids of runs ready to be driven
    ///
    /// The first poll always includes a stale-run scan, so a restarted worker
    /// picks up runs its predecessor left behind.
    pub async fn poll(&mut self) -> Result<Vec<Uuid>, PollerError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let mut run_ids = Vec::new();

        if self.stale_scan_due() {
            self.last_stale_scan = Some(Instant::now());
            let stale = self.orchestrator.stale_run_ids().await?;
            if !stale.is_empty() {
                info!(count = stale.len(), "found stale runs");
            }
            run_ids.extend(stale);
        }

        run_ids.extend(self.orchestrator.due_run_ids().await?);

        let mut seen = HashSet::new();
        run_ids.retain(|id| seen.insert(*id));

        if run_ids.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No runs due, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = run_ids.len(), "Found runs to drive");
        }

        Ok(run_ids)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn stale_scan_due(&self) -> bool {
        self.last_stale_scan
            .map_or(true, |at| at.elapsed() >= self.config.stale_scan_interval)
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::engine::WorkflowRegistry;
    use crate::persistence::{InMemoryRunStore, RunStore, WorkflowRun};
    use crate::workflow::Event;

    fn poller(store: Arc<InMemoryRunStore>, clock: Arc<ManualClock>) -> (WakePoller, watch::Sender<bool>) {
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            Arc::new(WorkflowRegistry::new()),
            clock,
        ));
        let (tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(400))
            .with_backoff_multiplier(2.0);
        (WakePoller::new(orchestrator, config, rx), tx)
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier, 1.5);
    }

    #[test]
    fn test_backoff_multiplier_floor() {
        let config = PollerConfig::new().with_backoff_multiplier(0.5);
        assert_eq!(config.backoff_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_backs_off_when_idle_and_resets_on_work() {
        let store = Arc::new(InMemoryRunStore::new());
        let clock = Arc::new(ManualClock::default());
        let (mut poller, _tx) = poller(store.clone(), clock.clone());

        assert!(poller.poll().await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        assert!(poller.poll().await.unwrap().is_empty());
        assert!(poller.poll().await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(400));

        let event = Event::at("app/cart.updated", serde_json::json!({}), clock.now());
        let run = WorkflowRun::new("abandoned-cart-recovery", event, clock.now());
        store.create_runs(&[run.clone()]).await.unwrap();

        assert_eq!(poller.poll().await.unwrap(), vec![run.id]);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_poll_returns_nothing_after_shutdown() {
        let store = Arc::new(InMemoryRunStore::new());
        let clock = Arc::new(ManualClock::default());
        let event = Event::at("app/cart.updated", serde_json::json!({}), clock.now());
        store
            .create_runs(&[WorkflowRun::new("abandoned-cart-recovery", event, clock.now())])
            .await
            .unwrap();
        let (mut poller, tx) = poller(store, clock);

        tx.send(true).unwrap();

        assert!(poller.is_shutdown());
        assert!(poller.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_returns_early_on_shutdown() {
        let store = Arc::new(InMemoryRunStore::new());
        let (mut poller, tx) = poller(store, Arc::new(ManualClock::default()));
        for _ in 0..3 {
            poller.increase_backoff();
        }

        let waiter = tokio::spawn(async move { poller.wait().await });
        tx.send(true).unwrap();

        assert!(waiter.await.unwrap());
    }
}
