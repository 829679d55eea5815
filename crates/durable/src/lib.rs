//! # Durable Workflow Engine
//!
//! An event-driven workflow engine for background jobs that must survive
//! restarts: syncing records, waiting a day before a reminder, acting when a
//! deadline passes.
//!
//! ## Features
//!
//! - **Durable runs**: every run is persisted after each step, so a crashed
//!   worker's runs resume where they left off
//! - **Step memoization**: a step that succeeded is never executed again for
//!   the same run
//! - **Durable sleeps**: a sleeping run is a row with a wake time, not a task
//! - **Automatic retries**: per-step retry policies with exponential backoff
//!   and jitter
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EventBus                              │
//! │  (validates payloads, creates one run per matching workflow) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RunStore                              │
//! │  (PostgreSQL: workflow_runs, workflow_step_records)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                WorkerPool  →  Orchestrator                   │
//! │  (claims runs, executes steps, checkpoints, sleeps, retries) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use storefront_durable::prelude::*;
//!
//! struct SendReminder;
//!
//! #[async_trait]
//! impl StepExecutor for SendReminder {
//!     async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError> {
//!         let payload: ReminderPayload = ctx.payload()?;
//!         // ... check current state, then act
//!         Ok(json!({ "sent": true }))
//!     }
//! }
//!
//! let definition = WorkflowDefinition::builder("reminder", "app/cart.updated")
//!     .payload::<ReminderPayload>()
//!     .sleep_for("wait", Duration::from_secs(86_400))
//!     .run("send-reminder", SendReminder)
//!     .build()?;
//! ```

pub mod clock;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod runtime;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::engine::{
        DriveOutcome, EventBus, IngressError, Orchestrator, OrchestratorConfig,
        OrchestratorError, WorkflowRegistry,
    };
    pub use crate::persistence::{
        InMemoryRunStore, Pagination, PostgresRunStore, RunFilter, RunState, RunStore,
        StepRecord, StepStatus, StoreError, WorkflowRun,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{EngineConfig, WorkflowEngine};
    pub use crate::worker::{PollerConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        Event, StepContext, StepError, StepExecutor, WorkflowDefinition,
    };
}

// Re-export key types at crate root
pub use engine::{
    DriveOutcome, EventBus, IngressError, Orchestrator, OrchestratorConfig, OrchestratorError,
    RegistryError, WorkflowRegistry,
};
pub use persistence::{
    InMemoryRunStore, PostgresRunStore, RunState, RunStore, StepRecord, StoreError, WorkflowRun,
};
pub use reliability::RetryPolicy;
pub use runtime::{EngineConfig, WorkflowEngine};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{Event, StepContext, StepError, StepExecutor, WorkflowDefinition};
