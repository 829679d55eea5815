//! Domain events admitted by the event bus

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// An immutable domain event emitted by a producer
///
/// Events are snapshotted into every run they trigger, so a run can be
/// resumed long after the producer's in-memory state is gone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event ID
    pub id: Uuid,

    /// Event type, e.g. `app/cart.updated`
    pub event_type: String,

    /// Event payload (a JSON object)
    pub payload: serde_json::Value,

    /// When the producer observed the change
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Create an event occurring now
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::at(event_type, payload, Utc::now())
    }

    /// Create an event with an explicit occurrence time
    pub fn at(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            occurred_at,
        }
    }

    /// Deserialize the payload into a typed struct
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
