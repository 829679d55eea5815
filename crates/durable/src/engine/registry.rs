//! Workflow registry: event type → workflow definitions
//!
//! Built once at process start and shared read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::workflow::WorkflowDefinition;

/// Registry of workflow definitions, indexed by trigger event type
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    by_trigger: HashMap<String, Vec<Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition
    ///
    /// Definitions sharing a trigger are matched in registration order.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        if self.definitions.contains_key(definition.id()) {
            return Err(RegistryError::DuplicateDefinition(
                definition.id().to_string(),
            ));
        }

        let definition = Arc::new(definition);
        self.by_trigger
            .entry(definition.trigger_event_type().to_string())
            .or_default()
            .push(Arc::clone(&definition));
        self.definitions
            .insert(definition.id().to_string(), definition);
        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, definition: WorkflowDefinition) -> Result<Self, RegistryError> {
        self.register(definition)?;
        Ok(self)
    }

    /// Definitions triggered by `event_type`
    pub fn matching(&self, event_type: &str) -> &[Arc<WorkflowDefinition>] {
        self.by_trigger
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, definition_id: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.definitions.get(definition_id)
    }

    pub fn contains(&self, definition_id: &str) -> bool {
        self.definitions.contains_key(definition_id)
    }

    /// Get the number of registered definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Event types with at least one definition
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.by_trigger.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let triggers: HashMap<&str, Vec<&str>> = self
            .by_trigger
            .iter()
            .map(|(event, defs)| (event.as_str(), defs.iter().map(|d| d.id()).collect()))
            .collect();

        f.debug_struct("WorkflowRegistry")
            .field("triggers", &triggers)
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Definition id registered twice
    #[error("workflow definition already registered: {0}")]
    DuplicateDefinition(String),

    /// Run refers to a definition that is not registered
    #[error("unknown workflow definition: {0}")]
    UnknownDefinition(String),
}
