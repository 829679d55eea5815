//! Run orchestrator: the step state machine
//!
//! The `Orchestrator` is responsible for:
//! - Claiming runs (version compare-and-swap) so only one worker drives a run
//! - Executing steps in order, with a checkpoint after each
//! - Skipping steps that already succeeded (memoization)
//! - Suspending runs at sleep steps and on retry backoff
//! - Failing runs whose step exhausted its retries
//! - Operator actions: inspect, cancel, retry failed runs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::registry::{RegistryError, WorkflowRegistry};
use crate::clock::Clock;
use crate::persistence::{
    Pagination, RunFilter, RunState, RunStore, RunUpdate, StepRecord, StepStatus, StoreError,
    WorkflowRun,
};
use crate::reliability::duration_millis;
use crate::workflow::{StepContext, StepError, StepSpec, WorkflowDefinition};

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// A `Running` run not updated for this long is presumed crashed
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Maximum runs fetched per scheduling query
    pub batch_size: usize,

    /// How often a run's `updated_at` is refreshed while a step executes;
    /// must stay well under `stale_threshold`
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(300),
            batch_size: 50,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Errors from orchestrator operations
///
/// Step failures are not errors here: they are recorded on the run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// What happened when a run was driven
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    /// Reached the end of its steps
    Completed,

    /// A step failed permanently or exhausted its retries
    Failed,

    /// Suspended at a sleep step
    Sleeping { wake_at: DateTime<Utc> },

    /// A step failed and will be retried at `wake_at`
    Retrying { attempt: u32, wake_at: DateTime<Utc> },

    /// The run was cancelled before its next step
    Cancelled,

    /// Nothing to do: terminal, not yet due, or owned by another worker
    Skipped,
}

/// Totals from a scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub driven: usize,
    pub completed: usize,
    pub failed: usize,
    pub suspended: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn record(&mut self, outcome: &Result<DriveOutcome, OrchestratorError>) {
        self.driven += 1;
        match outcome {
            Ok(DriveOutcome::Completed) => self.completed += 1,
            Ok(DriveOutcome::Failed) => self.failed += 1,
            Ok(DriveOutcome::Sleeping { .. }) | Ok(DriveOutcome::Retrying { .. }) => {
                self.suspended += 1
            }
            Ok(DriveOutcome::Cancelled) | Ok(DriveOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Drives workflow runs through their steps
///
/// A run only ever moves forward: `current_step_index` grows by one per
/// checkpoint, or stays put while the same step is retried. Every checkpoint
/// is conditional on the version the orchestrator claimed, so a run that was
/// cancelled, or picked up by another worker, is abandoned at the next step
/// boundary.
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(store, registry, Arc::new(SystemClock));
///
/// // Drive a freshly published run
/// orchestrator.drive_run(run_id).await?;
///
/// // Resume whatever has woken up since
/// orchestrator.resume_due().await?;
/// ```
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_config(store, registry, clock, OrchestratorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RunStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // =========================================================================
    // Driving runs
    // =========================================================================

    /// Drive one run as far as it can go right now
    #[instrument(skip(self))]
    pub async fn drive_run(&self, run_id: Uuid) -> Result<DriveOutcome, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        let now = self.clock.now();

        if !self.is_claimable(&run, now) {
            debug!(%run_id, state = %run.state, "run not claimable");
            return Ok(DriveOutcome::Skipped);
        }

        let run = match self.store.claim_run(run_id, run.version, now).await {
            Ok(run) => run,
            Err(e) if e.is_conflict() => {
                debug!(%run_id, "run claimed by another worker");
                return Ok(DriveOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(definition) = self.registry.get(&run.definition_id).cloned() else {
            error!(%run_id, definition_id = %run.definition_id, "run refers to unknown definition");
            let message = RegistryError::UnknownDefinition(run.definition_id.clone()).to_string();
            let mut update = RunUpdate::from_run(&run, self.clock.now());
            update.state = RunState::Failed;
            update.last_error = Some(message);
            return Ok(match self.checkpoint(&run, update, None).await? {
                Some(_) => DriveOutcome::Failed,
                None => DriveOutcome::Skipped,
            });
        };

        self.execute_steps(run, &definition).await
    }

    fn is_claimable(&self, run: &WorkflowRun, now: DateTime<Utc>) -> bool {
        match run.state {
            RunState::Pending | RunState::Sleeping => run.is_due(now),
            RunState::Running => run.updated_at < self.stale_cutoff(now),
            RunState::Completed | RunState::Failed | RunState::Cancelled => false,
        }
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now - threshold
    }

    async fn execute_steps(
        &self,
        mut run: WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Result<DriveOutcome, OrchestratorError> {
        let mut succeeded: HashMap<String, serde_json::Value> = self
            .store
            .step_records(run.id)
            .await?
            .into_iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| (r.step_name, r.result.unwrap_or(serde_json::Value::Null)))
            .collect();

        loop {
            let index = run.current_step_index as usize;

            let Some(step) = definition.step(index) else {
                let mut update = RunUpdate::from_run(&run, self.clock.now());
                update.state = RunState::Completed;
                update.wake_at = None;
                update.last_error = None;
                return Ok(match self.checkpoint(&run, update, None).await? {
                    Some(_) => {
                        info!(run_id = %run.id, definition_id = %definition.id(), "run completed");
                        DriveOutcome::Completed
                    }
                    None => DriveOutcome::Skipped,
                });
            };

            if succeeded.contains_key(step.name()) {
                debug!(run_id = %run.id, step = step.name(), "step already succeeded, skipping");
                let update = advance(&run, self.clock.now());
                match self.checkpoint(&run, update, None).await? {
                    Some(next) => {
                        run = next;
                        continue;
                    }
                    None => return Ok(DriveOutcome::Skipped),
                }
            }

            let next = match step {
                StepSpec::Run {
                    name,
                    executor,
                    retry,
                } => {
                    // Last look before a side effect: cancelled or reclaimed runs stop here
                    let current = self.store.get_run(run.id).await?;
                    if current.version != run.version || current.state != RunState::Running {
                        info!(
                            run_id = %run.id,
                            step = %name,
                            state = %current.state,
                            "run changed before step, stopping"
                        );
                        return Ok(if current.state == RunState::Cancelled {
                            DriveOutcome::Cancelled
                        } else {
                            DriveOutcome::Skipped
                        });
                    }

                    let attempt = run.attempt + 1;
                    let ctx = StepContext::new(
                        run.id,
                        definition.id(),
                        name.as_str(),
                        run.trigger_event.clone(),
                    )
                    .with_attempt(attempt, retry.max_attempts)
                    .with_started_at(self.clock.now())
                    .with_prior_results(succeeded.clone());

                    debug!(run_id = %run.id, step = %name, attempt, "executing step");
                    let heartbeat = StepHeartbeat::start(
                        Arc::clone(&self.store),
                        Arc::clone(&self.clock),
                        &run,
                        self.config.heartbeat_interval,
                    );
                    let executed = executor.execute(&ctx).await;
                    drop(heartbeat);

                    match executed {
                        Ok(result) => {
                            let now = self.clock.now();
                            let record =
                                StepRecord::succeeded(run.id, name, result.clone(), attempt, now);
                            let Some(next) = self
                                .checkpoint(&run, advance(&run, now), Some(record))
                                .await?
                            else {
                                warn!(run_id = %run.id, step = %name, "run changed during step, result dropped");
                                return Ok(DriveOutcome::Skipped);
                            };
                            debug!(run_id = %run.id, step = %name, "step succeeded");
                            succeeded.insert(name.clone(), result);
                            next
                        }
                        Err(step_error) => {
                            if step_error.retryable && retry.allows_retry_after(attempt) {
                                return self
                                    .schedule_retry(&run, name, attempt, step_error, retry)
                                    .await;
                            }
                            return self.fail_run(&run, name, attempt, step_error).await;
                        }
                    }
                }

                StepSpec::SleepFor { name, duration } => {
                    let now = self.clock.now();
                    let wake_at = now
                        + chrono::Duration::from_std(*duration)
                            .unwrap_or_else(|_| chrono::Duration::days(36_500));
                    match self.sleep(&run, name, wake_at).await? {
                        SleepResult::Continue(next) => next,
                        SleepResult::Stop(outcome) => return Ok(outcome),
                    }
                }

                StepSpec::SleepUntil { name, wake_at } => match wake_at(&run.trigger_event) {
                    Ok(wake_at) => match self.sleep(&run, name, wake_at).await? {
                        SleepResult::Continue(next) => next,
                        SleepResult::Stop(outcome) => return Ok(outcome),
                    },
                    Err(step_error) => return self.fail_run(&run, name, 1, step_error).await,
                },
            };

            if next.current_step_index <= run.current_step_index {
                // Store returned a run that did not advance; never loop on it
                error!(run_id = %run.id, "checkpoint did not advance run");
                return Ok(DriveOutcome::Skipped);
            }
            run = next;
        }
    }

    async fn sleep(
        &self,
        run: &WorkflowRun,
        step_name: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<SleepResult, OrchestratorError> {
        let now = self.clock.now();
        let record = StepRecord::succeeded(
            run.id,
            step_name,
            serde_json::json!({ "wake_at": wake_at }),
            1,
            now,
        );
        let mut update = advance(run, now);

        if wake_at > now {
            update.state = RunState::Sleeping;
            update.wake_at = Some(wake_at);
        }

        let Some(next) = self.checkpoint(run, update, Some(record)).await? else {
            return Ok(SleepResult::Stop(DriveOutcome::Skipped));
        };

        if wake_at > now {
            info!(run_id = %run.id, step = step_name, %wake_at, "run sleeping");
            Ok(SleepResult::Stop(DriveOutcome::Sleeping { wake_at }))
        } else {
            debug!(run_id = %run.id, step = step_name, "wake time already passed");
            Ok(SleepResult::Continue(next))
        }
    }

    async fn schedule_retry(
        &self,
        run: &WorkflowRun,
        step_name: &str,
        attempt: u32,
        step_error: StepError,
        retry: &crate::reliability::RetryPolicy,
    ) -> Result<DriveOutcome, OrchestratorError> {
        let now = self.clock.now();
        let delay = chrono::Duration::from_std(retry.delay_after_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let wake_at = now + delay;

        let mut update = RunUpdate::from_run(run, now);
        update.state = RunState::Sleeping;
        update.attempt = attempt;
        update.wake_at = Some(wake_at);
        update.last_error = Some(step_error.to_string());

        warn!(
            run_id = %run.id,
            step = step_name,
            attempt,
            max_attempts = retry.max_attempts,
            error = %step_error,
            %wake_at,
            "step failed, will retry"
        );

        Ok(match self.checkpoint(run, update, None).await? {
            Some(_) => DriveOutcome::Retrying { attempt, wake_at },
            None => DriveOutcome::Skipped,
        })
    }

    async fn fail_run(
        &self,
        run: &WorkflowRun,
        step_name: &str,
        attempts: u32,
        step_error: StepError,
    ) -> Result<DriveOutcome, OrchestratorError> {
        let now = self.clock.now();
        let mut update = RunUpdate::from_run(run, now);
        update.state = RunState::Failed;
        update.attempt = attempts;
        update.wake_at = None;
        update.last_error = Some(step_error.to_string());

        error!(
            run_id = %run.id,
            definition_id = %run.definition_id,
            step = step_name,
            attempts,
            error = %step_error,
            "step failed permanently, run failed"
        );

        let record = StepRecord::failed(run.id, step_name, step_error, attempts, now);
        Ok(match self.checkpoint(run, update, Some(record)).await? {
            Some(_) => DriveOutcome::Failed,
            None => DriveOutcome::Skipped,
        })
    }

    /// Conditional write; `None` when the run moved under us
    async fn checkpoint(
        &self,
        run: &WorkflowRun,
        update: RunUpdate,
        record: Option<StepRecord>,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        match self
            .store
            .checkpoint(run.id, run.version, update, record)
            .await
        {
            Ok(next) => Ok(Some(next)),
            Err(e) if e.is_conflict() => {
                debug!(run_id = %run.id, "checkpoint lost to a concurrent change");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Scheduling passes
    // =========================================================================

    /// Ids of runs that are pending or whose wake time has passed
    pub async fn due_run_ids(&self) -> Result<Vec<Uuid>, OrchestratorError> {
        let runs = self
            .store
            .due_runs(self.clock.now(), self.config.batch_size)
            .await?;
        Ok(runs.into_iter().map(|r| r.id).collect())
    }

    /// Ids of runs stuck in `Running` past the staleness threshold
    pub async fn stale_run_ids(&self) -> Result<Vec<Uuid>, OrchestratorError> {
        let cutoff = self.stale_cutoff(self.clock.now());
        let runs = self
            .store
            .stale_runs(cutoff, self.config.batch_size)
            .await?;
        Ok(runs.into_iter().map(|r| r.id).collect())
    }

    /// Drive every due run, one after another
    pub async fn resume_due(&self) -> Result<TickReport, OrchestratorError> {
        let ids = self.due_run_ids().await?;
        Ok(self.drive_all(ids).await)
    }

    /// Drive every run presumed crashed mid-step
    pub async fn recover_stale(&self) -> Result<TickReport, OrchestratorError> {
        let ids = self.stale_run_ids().await?;
        if !ids.is_empty() {
            info!(count = ids.len(), "recovering stale runs");
        }
        Ok(self.drive_all(ids).await)
    }

    async fn drive_all(&self, ids: Vec<Uuid>) -> TickReport {
        let mut report = TickReport::default();
        for run_id in ids {
            let outcome = self.drive_run(run_id).await;
            if let Err(e) = &outcome {
                error!(%run_id, error = %e, "failed to drive run");
            }
            report.record(&outcome);
        }
        report
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, OrchestratorError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowRun>, OrchestratorError> {
        Ok(self.store.list_runs(filter, pagination).await?)
    }

    /// Runs that need operator attention
    pub async fn failed_runs(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowRun>, OrchestratorError> {
        self.list_runs(RunFilter::state(RunState::Failed), pagination)
            .await
    }

    pub async fn step_history(&self, run_id: Uuid) -> Result<Vec<StepRecord>, OrchestratorError> {
        Ok(self.store.step_records(run_id).await?)
    }

    /// Cancel a run; it will not execute another step
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<WorkflowRun, OrchestratorError> {
        let run = self.store.cancel_run(run_id, self.clock.now()).await?;
        info!(%run_id, "run cancelled");
        Ok(run)
    }

    /// Put a failed run back in the queue at the step that failed
    ///
    /// Steps that already succeeded are not repeated.
    #[instrument(skip(self))]
    pub async fn retry_failed_run(&self, run_id: Uuid) -> Result<WorkflowRun, OrchestratorError> {
        let run = self.store.reset_failed_run(run_id, self.clock.now()).await?;
        info!(%run_id, step_index = run.current_step_index, "failed run re-queued");
        Ok(run)
    }
}

/// Keeps a running step's run fresh so stale recovery leaves it alone
///
/// The loop stops on its own once the run leaves `Running` at the held
/// version, and is aborted when dropped.
struct StepHeartbeat {
    handle: JoinHandle<()>,
}

impl StepHeartbeat {
    fn start(
        store: Arc<dyn RunStore>,
        clock: Arc<dyn Clock>,
        run: &WorkflowRun,
        every: Duration,
    ) -> Option<Self> {
        if every.is_zero() {
            return None;
        }
        let run_id = run.id;
        let version = run.version;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match store.heartbeat_run(run_id, version, clock.now()).await {
                    Ok(true) => debug!(%run_id, "run heartbeat"),
                    Ok(false) => {
                        warn!(%run_id, version, "run no longer held, stopping heartbeat");
                        break;
                    }
                    Err(e) => error!(%run_id, error = %e, "run heartbeat failed"),
                }
            }
        });

        Some(Self { handle })
    }
}

impl Drop for StepHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum SleepResult {
    Continue(WorkflowRun),
    Stop(DriveOutcome),
}

fn advance(run: &WorkflowRun, now: DateTime<Utc>) -> RunUpdate {
    let mut update = RunUpdate::from_run(run, now);
    update.current_step_index = run.current_step_index + 1;
    update.attempt = 0;
    update.wake_at = None;
    update.last_error = None;
    update
}
