//! Event bus: domain events in, workflow runs out
//!
//! Publishing validates the payload against every matching definition,
//! persists one `Pending` run per match in a single write, then hands the
//! new run ids to the worker pool. Nothing is dispatched unless the write
//! succeeded, and nothing is written if any definition rejects the payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::registry::WorkflowRegistry;
use crate::clock::Clock;
use crate::persistence::{RunStore, StoreError, WorkflowRun};
use crate::workflow::Event;

/// Errors returned to the publisher
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// Event is not well formed, or its payload does not have the shape a
    /// matching workflow requires
    #[error("malformed {event_type:?} event: {reason}")]
    Malformed { event_type: String, reason: String },

    /// Shutdown has begun; no new runs are accepted
    #[error("event bus is shutting down")]
    ShuttingDown,

    /// Runs could not be persisted
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Entry point for domain events
pub struct EventBus {
    store: Arc<dyn RunStore>,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    accepting: AtomicBool,
    dispatcher: Mutex<Option<mpsc::Sender<Uuid>>>,
}

impl EventBus {
    pub fn new(
        store: Arc<dyn RunStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            accepting: AtomicBool::new(true),
            dispatcher: Mutex::new(None),
        }
    }

    /// Send new run ids to `tx` for immediate execution
    ///
    /// Without a dispatcher (or when its queue is full) runs wait for the
    /// wake poller instead.
    pub fn attach_dispatcher(&self, tx: mpsc::Sender<Uuid>) {
        *self.dispatcher.lock() = Some(tx);
    }

    pub fn detach_dispatcher(&self) {
        self.dispatcher.lock().take();
    }

    /// Publish a new event of `event_type`, stamped with the current time
    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Vec<Uuid>, IngressError> {
        let event = Event::at(event_type, payload, self.clock.now());
        self.publish_event(event).await
    }

    /// Publish a fully formed event; returns the ids of the runs it started
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn publish_event(&self, event: Event) -> Result<Vec<Uuid>, IngressError> {
        if !self.is_accepting() {
            warn!("rejecting event during shutdown");
            return Err(IngressError::ShuttingDown);
        }

        if event.event_type.trim().is_empty() {
            return Err(malformed(&event, "event type is empty"));
        }
        if !event.payload.is_object() {
            return Err(malformed(&event, "payload is not a JSON object"));
        }

        let definitions = self.registry.matching(&event.event_type);
        if definitions.is_empty() {
            debug!("no workflow listens for this event type");
            return Ok(vec![]);
        }

        for definition in definitions {
            if let Err(reason) = definition.validate_payload(&event.payload) {
                warn!(definition_id = %definition.id(), %reason, "rejecting malformed event");
                return Err(malformed(
                    &event,
                    format!("rejected by workflow {}: {reason}", definition.id()),
                ));
            }
        }

        let now = self.clock.now();
        let runs: Vec<WorkflowRun> = definitions
            .iter()
            .map(|definition| WorkflowRun::new(definition.id(), event.clone(), now))
            .collect();

        self.store.create_runs(&runs).await?;

        let run_ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
        info!(runs = run_ids.len(), "event published");

        self.dispatch(&run_ids);
        Ok(run_ids)
    }

    fn dispatch(&self, run_ids: &[Uuid]) {
        let guard = self.dispatcher.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };

        for run_id in run_ids {
            if let Err(e) = tx.try_send(*run_id) {
                // Persisted as Pending; the poller will find it
                debug!(%run_id, error = %e, "dispatch queue unavailable, deferring to poller");
            }
        }
    }

    /// Stop accepting events; in-flight publishes finish normally
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("event bus stopped accepting events");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

fn malformed(event: &Event, reason: impl Into<String>) -> IngressError {
    IngressError::Malformed {
        event_type: event.event_type.clone(),
        reason: reason.into(),
    }
}
