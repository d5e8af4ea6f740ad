//! Workflow and step persistence records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::WorkflowContext;
use super::status::{StepStatus, WorkflowStatus};

/// Error detail recorded on a failed workflow
///
/// Retains the failed step's name and attempt count so operators can audit
/// and diagnose without replaying logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowErrorDetail {
    /// Human-readable message, including the underlying cause chain
    pub message: String,

    /// Name of the step whose failure terminated forward execution
    pub step: Option<String>,

    /// Attempts consumed by the failing step
    pub attempts: u32,
}

impl WorkflowErrorDetail {
    /// Record a step-level failure on the workflow
    pub fn step_failure(step: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: Some(step.into()),
            attempts,
        }
    }
}

impl std::fmt::Display for WorkflowErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(
                f,
                "step {} failed after {} attempt(s): {}",
                step, self.attempts, self.message
            ),
            None => f.write_str(&self.message),
        }
    }
}

/// Error detail recorded on a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorDetail {
    /// Human-readable message, including the underlying cause chain
    pub message: String,

    /// Attempts consumed (1-based count of invocations)
    pub attempts: u32,

    /// Whether the failure occurred while compensating rather than executing
    pub during_compensation: bool,
}

impl StepErrorDetail {
    /// Record a forward-execution failure
    pub fn execution(attempts: u32, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attempts,
            during_compensation: false,
        }
    }

    /// Record a compensation failure
    pub fn compensation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            attempts: 1,
            during_compensation: true,
        }
    }
}

/// A workflow instance as persisted in the store
///
/// Owned exclusively by the orchestrator once created; never deleted —
/// terminal workflows are retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Unique identifier (UUID v7, time-ordered)
    pub id: Uuid,

    /// Which workflow definition's ordered step list this instance runs
    pub workflow_type: String,

    /// Current status
    pub status: WorkflowStatus,

    /// Caller-supplied input, immutable after creation
    pub input_data: serde_json::Value,

    /// Curated output, populated on completion
    pub output_data: Option<serde_json::Value>,

    /// Accumulated context snapshot
    pub context: WorkflowContext,

    /// Error detail when the workflow failed
    pub error: Option<WorkflowErrorDetail>,

    /// Number of whole-workflow retries requested
    pub retry_count: u32,

    /// Tenant scope, if any
    pub tenant_id: Option<String>,

    /// Optimistic-concurrency version; bumped on every committed update
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Create a new pending workflow
    pub fn new(
        workflow_type: impl Into<String>,
        input_data: serde_json::Value,
        tenant_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Pending,
            input_data,
            output_data: None,
            context: WorkflowContext::new(),
            error: None,
            retry_count: 0,
            tenant_id,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single step of a workflow instance as persisted in the store
///
/// The workflow owns its steps; `workflow_id` is a back-reference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Owning workflow
    pub workflow_id: Uuid,

    /// Step name, resolved against the handler registry
    pub name: String,

    /// Position in the definition; unique per workflow. Forward execution
    /// visits ascending order, compensation strictly descending.
    pub step_order: i32,

    /// Label of the external system this step provisions against
    pub target_system: String,

    /// Current status
    pub status: StepStatus,

    /// Output produced by the forward handler
    pub output_data: Option<serde_json::Value>,

    /// Opaque payload the compensation handler needs to undo this step
    pub compensation_data: Option<serde_json::Value>,

    /// Error detail from the most recent failure
    pub error: Option<StepErrorDetail>,

    /// Failed attempts consumed in the current forward pass
    pub retry_count: u32,

    /// When the current execution began
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached a forward-terminal or compensated state
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Create a pending step for a workflow
    pub fn new(
        workflow_id: Uuid,
        name: impl Into<String>,
        step_order: i32,
        target_system: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            name: name.into(),
            step_order,
            target_system: target_system.into(),
            status: StepStatus::Pending,
            output_data: None,
            compensation_data: None,
            error: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Reset the step for a fresh forward pass (whole-workflow retry)
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.output_data = None;
        self.compensation_data = None;
        self.error = None;
        self.retry_count = 0;
        self.started_at = None;
        self.finished_at = None;
    }
}
