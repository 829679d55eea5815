//! RunStore trait definition

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{Event, StepError};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on run {run_id}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        run_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// The run's current state does not allow the transition
    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunState,
        to: RunState,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Another worker changed the run first
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::InvalidTransition { .. }
        )
    }
}

/// Run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created by the event bus, not yet picked up
    Pending,

    /// A worker is executing steps
    Running,

    /// Suspended until `wake_at`
    Sleeping,

    /// Reached the end of its step list
    Completed,

    /// A step exhausted its retries
    Failed,

    /// Cancelled by an operator
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "sleeping" => Ok(Self::Sleeping),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!("unknown run state: {other}"))),
        }
    }
}

/// One instance of a workflow definition triggered by one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition_id: String,

    /// Snapshot of the trigger event, kept for the run's lifetime
    pub trigger_event: Event,

    pub state: RunState,

    /// Index of the next step to execute
    pub current_step_index: u32,

    /// Failed attempts of the step at `current_step_index`
    pub attempt: u32,

    /// Resumption key while `Sleeping`
    pub wake_at: Option<DateTime<Utc>>,

    /// Most recent step error, kept for operators
    pub last_error: Option<String>,

    /// Optimistic concurrency version, bumped on every write
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A fresh `Pending` run
    pub fn new(definition_id: impl Into<String>, trigger_event: Event, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            trigger_event,
            state: RunState::Pending,
            current_step_index: 0,
            attempt: 0,
            wake_at: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the wake poller should pick this run up
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            RunState::Pending => true,
            RunState::Sleeping => self.wake_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

/// The mutable part of a run, written by [`RunStore::checkpoint`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub state: RunState,
    pub current_step_index: u32,
    pub attempt: u32,
    pub wake_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunUpdate {
    /// Start from the run's current values
    pub fn from_run(run: &WorkflowRun, now: DateTime<Utc>) -> Self {
        Self {
            state: run.state,
            current_step_index: run.current_step_index,
            attempt: run.attempt,
            wake_at: run.wake_at,
            last_error: run.last_error.clone(),
            updated_at: now,
        }
    }

    pub(crate) fn apply(&self, run: &mut WorkflowRun) {
        run.state = self.state;
        run.current_step_index = self.current_step_index;
        run.attempt = self.attempt;
        run.wake_at = self.wake_at;
        run.last_error = self.last_error.clone();
        run.updated_at = self.updated_at;
        run.version += 1;
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!("unknown step status: {other}"))),
        }
    }
}

/// History entry for a (run, step) pair that was attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    pub step_name: String,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<StepError>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn succeeded(
        run_id: Uuid,
        step_name: impl Into<String>,
        result: serde_json::Value,
        attempts: u32,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            status: StepStatus::Succeeded,
            result: Some(result),
            error: None,
            attempts,
            completed_at,
        }
    }

    pub fn failed(
        run_id: Uuid,
        step_name: impl Into<String>,
        error: StepError,
        attempts: u32,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            status: StepStatus::Failed,
            result: None,
            error: Some(error),
            attempts,
            completed_at,
        }
    }
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub definition_id: Option<String>,
}

impl RunFilter {
    pub fn state(state: RunState) -> Self {
        Self {
            state: Some(state),
            definition_id: None,
        }
    }

    pub fn matches(&self, run: &WorkflowRun) -> bool {
        self.state.map_or(true, |s| run.state == s)
            && self
                .definition_id
                .as_deref()
                .map_or(true, |d| run.definition_id == d)
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Durable record of workflow runs and their step history
///
/// Implementations must be thread-safe and make every method atomic on its
/// own; the orchestrator relies on `version` compare-and-swap rather than
/// locks to keep two workers from driving the same run.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    // =========================================================================
    // Ingress
    // =========================================================================

    /// Persist new runs, all or nothing
    async fn create_runs(&self, runs: &[WorkflowRun]) -> Result<(), StoreError>;

    // =========================================================================
    // Inspection
    // =========================================================================

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;

    /// Runs matching the filter, oldest first
    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Step history of a run, in completion order
    async fn step_records(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Move a `Pending`, `Sleeping` or `Running` run into `Running`
    ///
    /// Fails with `ConcurrencyConflict` if the run's version is no longer
    /// `expected_version`.
    async fn claim_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Refresh a `Running` run's `updated_at`, leaving its version alone
    ///
    /// Returns `false` once the run is no longer `Running` at
    /// `expected_version` (cancelled, or reclaimed by another worker).
    async fn heartbeat_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Apply `update` and optionally upsert a step record, atomically
    async fn checkpoint(
        &self,
        run_id: Uuid,
        expected_version: i64,
        update: RunUpdate,
        record: Option<StepRecord>,
    ) -> Result<WorkflowRun, StoreError>;

    /// Move any non-terminal run to `Cancelled`
    async fn cancel_run(&self, run_id: Uuid, now: DateTime<Utc>)
        -> Result<WorkflowRun, StoreError>;

    /// Move a `Failed` run back to `Pending` at the same step
    async fn reset_failed_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError>;

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// `Pending` runs and `Sleeping` runs whose wake time has passed
    async fn due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError>;

    /// `Running` runs not updated since `stale_before`
    async fn stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError>;
}
