//! Declarative workflow definitions

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use super::{Event, StepError, StepExecutor};
use crate::reliability::RetryPolicy;

/// Computes an absolute wake time from the trigger event
pub type WakeAtFn = Arc<dyn Fn(&Event) -> Result<DateTime<Utc>, StepError> + Send + Sync>;

/// Checks a trigger payload at ingress
pub type PayloadValidator = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

/// One step of a workflow
#[derive(Clone)]
pub enum StepSpec {
    /// Invoke a step executor
    Run {
        name: String,
        executor: Arc<dyn StepExecutor>,
        retry: RetryPolicy,
    },

    /// Suspend the run for a fixed duration
    SleepFor { name: String, duration: Duration },

    /// Suspend the run until a time derived from the trigger payload
    SleepUntil { name: String, wake_at: WakeAtFn },
}

impl StepSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Run { name, .. } | Self::SleepFor { name, .. } | Self::SleepUntil { name, .. } => {
                name
            }
        }
    }

    pub fn is_sleep(&self) -> bool {
        !matches!(self, Self::Run { .. })
    }
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run { name, retry, .. } => f
                .debug_struct("Run")
                .field("name", name)
                .field("retry", retry)
                .finish(),
            Self::SleepFor { name, duration } => f
                .debug_struct("SleepFor")
                .field("name", name)
                .field("duration", duration)
                .finish(),
            Self::SleepUntil { name, .. } => {
                f.debug_struct("SleepUntil").field("name", name).finish()
            }
        }
    }
}

/// Errors from building a definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("workflow id must not be empty")]
    EmptyId,

    #[error("workflow {0} has an empty trigger event type")]
    EmptyTrigger(String),

    #[error("workflow {0} has no steps")]
    NoSteps(String),

    #[error("workflow {workflow} declares step {step} more than once")]
    DuplicateStep { workflow: String, step: String },
}

/// A static, ordered list of steps triggered by one event type
///
/// # Example
///
/// ```ignore
/// let definition = WorkflowDefinition::builder("delete-coupon-on-expiry", "app/coupon.expired")
///     .payload::<CouponExpired>()
///     .sleep_until("wait-for-expiry", |event| expiry_from(event))
///     .run("delete-coupon", DeleteCoupon::new(store))
///     .build()?;
/// ```
#[derive(Clone)]
pub struct WorkflowDefinition {
    id: String,
    trigger_event_type: String,
    steps: Vec<StepSpec>,
    validators: Vec<PayloadValidator>,
}

impl WorkflowDefinition {
    pub fn builder(
        id: impl Into<String>,
        trigger_event_type: impl Into<String>,
    ) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            id: id.into(),
            trigger_event_type: trigger_event_type.into(),
            steps: vec![],
            validators: vec![],
            default_retry: RetryPolicy::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trigger_event_type(&self) -> &str {
        &self.trigger_event_type
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    /// Run every payload check registered for this definition
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), String> {
        self.validators.iter().try_for_each(|check| check(payload))
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("trigger_event_type", &self.trigger_event_type)
            .field("steps", &self.steps)
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowDefinitionBuilder {
    id: String,
    trigger_event_type: String,
    steps: Vec<StepSpec>,
    validators: Vec<PayloadValidator>,
    default_retry: RetryPolicy,
}

impl WorkflowDefinitionBuilder {
    /// Require the trigger payload to deserialize into `T`
    ///
    /// Events that fail this check are rejected by the bus before any run
    /// is created.
    pub fn payload<T: DeserializeOwned + 'static>(mut self) -> Self {
        self.validators.push(Arc::new(|payload: &serde_json::Value| {
            T::deserialize(payload)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }));
        self
    }

    /// Add a custom payload check
    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(check));
        self
    }

    /// Retry policy for `run` steps added after this call
    pub fn default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn run(self, name: impl Into<String>, executor: impl StepExecutor) -> Self {
        let retry = self.default_retry.clone();
        self.run_with_retry(name, executor, retry)
    }

    pub fn run_with_retry(
        mut self,
        name: impl Into<String>,
        executor: impl StepExecutor,
        retry: RetryPolicy,
    ) -> Self {
        self.steps.push(StepSpec::Run {
            name: name.into(),
            executor: Arc::new(executor),
            retry,
        });
        self
    }

    pub fn sleep_for(mut self, name: impl Into<String>, duration: Duration) -> Self {
        self.steps.push(StepSpec::SleepFor {
            name: name.into(),
            duration,
        });
        self
    }

    pub fn sleep_until<F>(mut self, name: impl Into<String>, wake_at: F) -> Self
    where
        F: Fn(&Event) -> Result<DateTime<Utc>, StepError> + Send + Sync + 'static,
    {
        self.steps.push(StepSpec::SleepUntil {
            name: name.into(),
            wake_at: Arc::new(wake_at),
        });
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.trigger_event_type.trim().is_empty() {
            return Err(DefinitionError::EmptyTrigger(self.id));
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.id.clone(),
                    step: step.name().to_string(),
                });
            }
        }

        Ok(WorkflowDefinition {
            id: self.id,
            trigger_event_type: self.trigger_event_type,
            steps: self.steps,
            validators: self.validators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepContext;
    use async_trait::async_trait;
    use serde::Deserialize;

    struct Noop;

    #[async_trait]
    impl StepExecutor for Noop {
        async fn execute(&self, _ctx: &StepContext) -> Result<serde_json::Value, StepError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct CartUpdated {
        #[serde(rename = "userId")]
        user_id: String,
    }

    #[test]
    fn test_build_definition() {
        let definition = WorkflowDefinition::builder("abandoned-cart-recovery", "app/cart.updated")
            .sleep_for("wait-24h", Duration::from_secs(86_400))
            .run("send-recovery-notification", Noop)
            .build()
            .unwrap();

        assert_eq!(definition.id(), "abandoned-cart-recovery");
        assert_eq!(definition.steps().len(), 2);
        assert!(definition.steps()[0].is_sleep());
        assert_eq!(definition.steps()[1].name(), "send-recovery-notification");
    }

    #[test]
    fn test_rejects_empty_and_duplicate_steps() {
        let empty = WorkflowDefinition::builder("w", "e").build();
        assert_eq!(empty.unwrap_err(), DefinitionError::NoSteps("w".into()));

        let duplicate = WorkflowDefinition::builder("w", "e")
            .run("a", Noop)
            .run("a", Noop)
            .build();
        assert!(matches!(
            duplicate,
            Err(DefinitionError::DuplicateStep { .. })
        ));

        let no_trigger = WorkflowDefinition::builder("w", " ").run("a", Noop).build();
        assert!(matches!(no_trigger, Err(DefinitionError::EmptyTrigger(_))));
    }

    #[test]
    fn test_payload_validation() {
        let definition = WorkflowDefinition::builder("abandoned-cart-recovery", "app/cart.updated")
            .payload::<CartUpdated>()
            .run("send-recovery-notification", Noop)
            .build()
            .unwrap();

        assert!(definition
            .validate_payload(&serde_json::json!({"userId": "u1", "cart": {}}))
            .is_ok());
        assert!(definition
            .validate_payload(&serde_json::json!({"cart": {}}))
            .is_err());
    }

    #[test]
    fn test_default_retry_applies_to_later_steps() {
        let definition = WorkflowDefinition::builder("w", "e")
            .run("first", Noop)
            .default_retry(RetryPolicy::no_retry())
            .run("second", Noop)
            .build()
            .unwrap();

        match (&definition.steps()[0], &definition.steps()[1]) {
            (StepSpec::Run { retry: first, .. }, StepSpec::Run { retry: second, .. }) => {
                assert_eq!(first.max_attempts, 3);
                assert_eq!(second.max_attempts, 1);
            }
            other => panic!("unexpected steps: {:?}", other),
        }
    }
}
