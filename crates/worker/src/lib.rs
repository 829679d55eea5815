//! Storefront background worker
//!
//! Registers the storefront workflows with the durable engine and supplies
//! the data store and notification sinks their steps act on.

pub mod config;
pub mod datastore;
pub mod notify;
pub mod telemetry;
pub mod workflows;

pub use config::{ConfigError, WorkerConfig};
pub use datastore::{InMemoryStorefrontStore, PgStorefrontStore, StorefrontStore};
pub use notify::{
    InMemoryNotificationSink, LogNotificationSink, Notification, NotificationSink,
    WebhookNotificationSink,
};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use workflows::{registry, SetupError, WorkflowDeps, WorkflowSettings};
