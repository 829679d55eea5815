//! Reliability patterns for durable execution
//!
//! - [`RetryPolicy`] - per-step retry with exponential backoff

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::RetryPolicy;
