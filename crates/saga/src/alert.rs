//! Compensation-failure notification hook
//!
//! A workflow that ends `compensation_failed` holds external state no
//! automatic process can be trusted to repair; an operator has to look at
//! it. The orchestrator reports every such workflow through this hook.
//! Wiring the notification to a pager, queue, or ticket system is the
//! collaborator's job.

use async_trait::async_trait;
use tracing::error;

use crate::workflow::{StepRecord, WorkflowRecord};

/// Collaborator notified when a workflow requires operator intervention
///
/// Implementations must not fail the orchestrator: the hook returns nothing
/// and is expected to swallow (and log) its own delivery errors.
#[async_trait]
pub trait CompensationAlert: Send + Sync {
    /// Called once per workflow that terminates `compensation_failed`
    ///
    /// `failed_steps` are the steps whose compensation handlers failed,
    /// with their recorded error details.
    async fn compensation_failed(&self, workflow: &WorkflowRecord, failed_steps: &[StepRecord]);
}

/// Alert sink that does nothing
pub struct NoopAlert;

#[async_trait]
impl CompensationAlert for NoopAlert {
    async fn compensation_failed(&self, _workflow: &WorkflowRecord, _failed_steps: &[StepRecord]) {}
}

/// Alert sink that emits a structured error event per failed step
pub struct LogAlert;

#[async_trait]
impl CompensationAlert for LogAlert {
    async fn compensation_failed(&self, workflow: &WorkflowRecord, failed_steps: &[StepRecord]) {
        for step in failed_steps {
            error!(
                workflow_id = %workflow.id,
                workflow_type = %workflow.workflow_type,
                step = %step.name,
                target_system = %step.target_system,
                error = step.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown"),
                "compensation failed; operator intervention required"
            );
        }
    }
}
