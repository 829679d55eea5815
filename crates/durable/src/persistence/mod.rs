//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`RunStore`] trait for run state and step history
//! - [`InMemoryRunStore`] for testing
//! - [`PostgresRunStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;
pub use store::{
    Pagination, RunFilter, RunState, RunStore, RunUpdate, StepRecord, StepStatus, StoreError,
    WorkflowRun,
};
