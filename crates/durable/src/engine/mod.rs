//! Workflow execution engine
//!
//! - [`WorkflowRegistry`] maps event types to workflow definitions
//! - [`EventBus`] turns published events into persisted runs
//! - [`Orchestrator`] drives runs through their steps

mod bus;
mod orchestrator;
mod registry;

pub use bus::{EventBus, IngressError};
pub use orchestrator::{
    DriveOutcome, Orchestrator, OrchestratorConfig, OrchestratorError, TickReport,
};
pub use registry::{RegistryError, WorkflowRegistry};
