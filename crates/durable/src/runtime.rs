//! Process-wide engine wiring
//!
//! [`WorkflowEngine`] owns the event bus, the orchestrator and the worker
//! pool, and sequences their startup and shutdown.

use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::engine::{EventBus, Orchestrator, OrchestratorConfig, WorkflowRegistry};
use crate::persistence::RunStore;
use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub pool: WorkerPoolConfig,
}

/// A running workflow engine
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::new(store, registry, Arc::new(SystemClock), EngineConfig::default());
/// engine.start().await?;
///
/// engine.bus().publish("app/cart.updated", payload).await?;
///
/// engine.shutdown().await?;
/// ```
pub struct WorkflowEngine {
    bus: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
    pool: WorkerPool,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::with_config(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.orchestrator,
        ));
        let bus = Arc::new(EventBus::new(store, registry, clock));
        let pool = WorkerPool::new(Arc::clone(&orchestrator), config.pool);

        Self {
            bus,
            orchestrator,
            pool,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Recover stale runs, then start driving new and due runs
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        let report = self.orchestrator.recover_stale().await?;
        if report.driven > 0 {
            info!(
                recovered = report.driven,
                completed = report.completed,
                failed = report.failed,
                "stale runs recovered at startup"
            );
        }

        self.bus.attach_dispatcher(self.pool.dispatcher());
        self.pool.start().await?;
        info!(worker_id = %self.pool.worker_id(), "workflow engine started");
        Ok(())
    }

    /// Stop accepting events and drain in-flight runs
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        self.bus.stop_accepting();
        self.bus.detach_dispatcher();
        self.pool.shutdown().await?;
        info!("workflow engine stopped");
        Ok(())
    }
}
