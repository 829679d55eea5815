//! Step executor trait and execution context

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::Event;

/// Error type for step failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the run immediately, without
    /// consulting the step's retry policy.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create a transient error (data store hiccup, notification outage)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StepError {}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(err.to_string()).with_type("INVALID_PAYLOAD")
    }
}

/// Context handed to a step executor
///
/// Carries the trigger event snapshot taken when the run was created and the
/// results of the steps that already succeeded for this run.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Run that owns this step
    pub run_id: Uuid,

    /// Definition the run was created from
    pub definition_id: String,

    /// Step name within the definition
    pub step_name: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the step's retry policy
    pub max_attempts: u32,

    /// Time the orchestrator started this attempt
    pub started_at: DateTime<Utc>,

    /// Trigger event snapshot
    pub event: Event,

    prior_results: HashMap<String, serde_json::Value>,
}

impl StepContext {
    pub fn new(
        run_id: Uuid,
        definition_id: impl Into<String>,
        step_name: impl Into<String>,
        event: Event,
    ) -> Self {
        Self {
            run_id,
            definition_id: definition_id.into(),
            step_name: step_name.into(),
            attempt: 1,
            max_attempts: 1,
            started_at: Utc::now(),
            event,
            prior_results: HashMap::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_prior_results(mut self, results: HashMap<String, serde_json::Value>) -> Self {
        self.prior_results = results;
        self
    }

    /// Deserialize the trigger payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(self.event.payload_as()?)
    }

    /// Result of an earlier succeeded step, if any
    pub fn prior_result(&self, step_name: &str) -> Option<&serde_json::Value> {
        self.prior_results.get(step_name)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Business logic bound to a `Run` step
///
/// Executors may be invoked more than once for the same run: after a crash
/// mid-step, or because a duplicate event created a second run. Any
/// externally visible side effect must therefore be gated on state read
/// fresh from the data store, not on the trigger snapshot alone.
///
/// # Example
///
/// ```ignore
/// struct DeleteCoupon { store: Arc<dyn StorefrontStore> }
///
/// #[async_trait]
/// impl StepExecutor for DeleteCoupon {
///     async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
///         let payload: CouponExpired = ctx.payload()?;
///         let deleted = self.store.delete_coupon(&payload.code).await?;
///         Ok(json!({ "deleted": deleted }))
///     }
/// }
/// ```
#[async_trait]
pub trait StepExecutor: Send + Sync + 'static {
    /// Execute the step
    ///
    /// Return `StepError::retryable()` for transient failures and
    /// `StepError::permanent()` for failures no retry can fix.
    async fn execute(&self, ctx: &StepContext) -> Result<serde_json::Value, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct CouponExpired {
        code: String,
    }

    fn context() -> StepContext {
        StepContext::new(
            Uuid::now_v7(),
            "delete-coupon-on-expiry",
            "delete-coupon",
            Event::new("app/coupon.expired", serde_json::json!({"code": "SAVE10"})),
        )
    }

    #[test]
    fn test_step_error_kinds() {
        assert!(StepError::retryable("timeout").retryable);
        assert!(!StepError::permanent("bad input").retryable);
    }

    #[test]
    fn test_step_error_display_with_type() {
        let error = StepError::retryable("connection refused").with_type("DATA_STORE");
        assert_eq!(error.to_string(), "DATA_STORE: connection refused");
    }

    #[test]
    fn test_invalid_payload_is_permanent() {
        let ctx = context();
        let result: Result<StockPayload, _> = ctx.payload();
        let error = result.unwrap_err();

        assert!(!error.retryable);
        assert_eq!(error.error_type.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct StockPayload {
        stock: i64,
    }

    #[test]
    fn test_context_payload_and_prior_results() {
        let mut prior = HashMap::new();
        prior.insert("wait-for-expiry".to_string(), serde_json::json!({"slept": true}));
        let ctx = context().with_attempt(2, 3).with_prior_results(prior);

        let payload: CouponExpired = ctx.payload().unwrap();
        assert_eq!(payload.code, "SAVE10");
        assert!(ctx.prior_result("wait-for-expiry").is_some());
        assert!(ctx.prior_result("delete-coupon").is_none());
        assert!(!ctx.is_last_attempt());
    }
}
