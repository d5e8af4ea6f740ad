//! Handler and definition registry
//!
//! An explicit registry object built once at process start and passed by
//! reference into the orchestrator. There is no global registration and no
//! runtime discovery: every step name a definition mentions must resolve
//! here, and [`HandlerRegistry::verify`] checks that before any workflow
//! runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::workflow::WorkflowDefinition;

use super::step::StepHandler;

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No handler registered under this step name
    #[error("unknown step handler: {0}")]
    UnknownStep(String),

    /// No definition registered under this workflow type
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// A definition references a step with no registered handler
    #[error("definition {workflow_type} references unregistered step: {step}")]
    UnresolvedStep {
        /// The definition at fault
        workflow_type: String,

        /// The step name that failed to resolve
        step: String,
    },
}

/// Registry of step handlers and workflow definitions
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    definitions: HashMap<String, WorkflowDefinition>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            definitions: HashMap::new(),
        }
    }

    /// Bind a step name to its handler
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register a workflow definition under its type tag
    pub fn define(&mut self, definition: WorkflowDefinition) {
        self.definitions
            .insert(definition.workflow_type.clone(), definition);
    }

    /// Resolve a step name to its handler
    pub fn handler(&self, name: &str) -> Result<Arc<dyn StepHandler>, RegistryError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStep(name.to_string()))
    }

    /// Resolve a workflow type to its definition
    pub fn definition(&self, workflow_type: &str) -> Result<&WorkflowDefinition, RegistryError> {
        self.definitions
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Whether a handler is registered under this step name
    pub fn contains_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }

    /// Check that every definition's steps resolve to a handler
    ///
    /// Call once at startup, after all registrations, so that a missing
    /// binding fails the process instead of a workflow mid-flight.
    pub fn verify(&self) -> Result<(), RegistryError> {
        for definition in self.definitions.values() {
            for step in &definition.steps {
                if !self.handlers.contains_key(&step.name) {
                    return Err(RegistryError::UnresolvedStep {
                        workflow_type: definition.workflow_type.clone(),
                        step: step.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("definitions", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::step::{
        StepCompensationError, StepContext, StepExecutionError, StepOutput,
    };
    use crate::workflow::StepSpec;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl StepHandler for NoopHandler {
        async fn execute(
            &self,
            _ctx: StepContext<'_>,
            _input: serde_json::Value,
        ) -> Result<StepOutput, StepExecutionError> {
            Ok(StepOutput::default())
        }

        async fn compensate(
            &self,
            _ctx: StepContext<'_>,
            _compensation_data: serde_json::Value,
        ) -> Result<(), StepCompensationError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register("create_record", Arc::new(NoopHandler));

        assert!(registry.contains_handler("create_record"));
        assert!(registry.handler("create_record").is_ok());
        assert!(matches!(
            registry.handler("unknown"),
            Err(RegistryError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.definition("provision_line"),
            Err(RegistryError::UnknownWorkflowType(_))
        ));
    }

    #[test]
    fn test_verify_catches_unresolved_step() {
        let mut registry = HandlerRegistry::new();
        registry.define(
            WorkflowDefinition::new("provision_line")
                .with_step(StepSpec::new("create_record", "record-store")),
        );

        assert!(matches!(
            registry.verify(),
            Err(RegistryError::UnresolvedStep { .. })
        ));

        registry.register("create_record", Arc::new(NoopHandler));
        assert!(registry.verify().is_ok());
    }

    #[test]
    fn test_debug_lists_registrations() {
        let mut registry = HandlerRegistry::new();
        registry.register("create_record", Arc::new(NoopHandler));
        registry.define(WorkflowDefinition::new("provision_line"));

        let debug = format!("{:?}", registry);
        assert!(debug.contains("create_record"));
        assert!(debug.contains("provision_line"));
    }
}
