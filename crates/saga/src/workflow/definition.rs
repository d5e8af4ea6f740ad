//! Workflow definitions
//!
//! A [`WorkflowDefinition`] is the ordered list of step specifications a
//! workflow type runs, plus the input fields a caller must supply.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Error produced when caller input does not satisfy a definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Input must be a JSON object
    #[error("input data must be a JSON object")]
    NotAnObject,

    /// A required input field is absent or null
    #[error("missing required input field: {0}")]
    MissingField(String),
}

/// Specification of a single step within a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name; must resolve to a registered handler
    pub name: String,

    /// Label of the external system this step targets
    pub target_system: String,

    /// Whether exhausting the retry budget triggers rollback.
    /// Non-required steps are marked skipped and execution continues.
    pub required: bool,

    /// Attempt budget per forward pass (including the first attempt)
    pub max_attempts: u32,

    /// Per-attempt bound on handler execution; a timeout counts as a
    /// failed attempt
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Delay policy between attempts; the orchestrator default applies
    /// when unset
    pub retry_policy: Option<RetryPolicy>,
}

impl StepSpec {
    /// Create a required step spec with defaults (3 attempts, 30s timeout)
    pub fn new(name: impl Into<String>, target_system: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_system: target_system.into(),
            required: true,
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            retry_policy: None,
        }
    }

    /// Mark this step optional: its failure never triggers rollback
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set a step-specific retry delay policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Ordered list of step specifications for one workflow type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Type tag callers use to select this definition
    pub workflow_type: String,

    /// Input fields that must be present (and non-null) on submission
    pub required_fields: Vec<String>,

    /// Steps in forward execution order
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    /// Create an empty definition
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            required_fields: vec![],
            steps: vec![],
        }
    }

    /// Require an input field
    pub fn with_required_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    /// Append a step
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate caller input against the required fields
    ///
    /// Runs before any step executes; a failure here means no external
    /// system was touched.
    pub fn validate_input(&self, input: &serde_json::Value) -> Result<(), ValidationError> {
        let object = input.as_object().ok_or(ValidationError::NotAnObject)?;

        for field in &self.required_fields {
            match object.get(field) {
                Some(value) if !value.is_null() => {}
                _ => return Err(ValidationError::MissingField(field.clone())),
            }
        }

        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
