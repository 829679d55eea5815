//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Event`] - immutable domain events that trigger runs
//! - [`WorkflowDefinition`] - an ordered list of [`StepSpec`]s
//! - [`StepExecutor`] - business logic bound to a `Run` step

mod definition;
mod event;
mod step;

pub use definition::{
    DefinitionError, PayloadValidator, StepSpec, WakeAtFn, WorkflowDefinition,
    WorkflowDefinitionBuilder,
};
pub use event::Event;
pub use step::{StepContext, StepError, StepExecutor};
