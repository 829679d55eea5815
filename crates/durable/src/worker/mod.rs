//! Worker pool for run execution
//!
//! This module provides:
//! - [`WorkerPool`] - drives runs concurrently, bounded by a semaphore
//! - [`WakePoller`] - finds due and stale runs with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  Dispatch   │  │ WakePoller  │  │  Failed-run report  │  │
//! │  │ (event bus) │  │ (due/stale) │  │     (5 min)         │  │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────────────────┘  │
//! │         │                │                                   │
//! │         ▼                ▼                                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │       Orchestrator::drive_run (Semaphore-limited)    │    │
//! │  │  [Run 1] [Run 2] [Run 3] ... [Run N]                 │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, PollerError, WakePoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
