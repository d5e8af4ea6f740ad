//! Step handler contract
//!
//! External systems plug into the orchestrator by implementing
//! [`StepHandler`]: a forward action plus the compensating action that
//! semantically undoes it. Both must be idempotent — the orchestrator may
//! invoke either more than once with the same input (retry, crash resume,
//! whole-workflow retry). Handlers detect pre-existing results via a
//! natural key rather than relying on the orchestrator for deduplication.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::workflow::{ContextDelta, WorkflowContext};

/// Error from a forward handler invocation
#[derive(Debug, thiserror::Error)]
pub enum StepExecutionError {
    /// The handler reported a failure
    #[error("{message}")]
    Failed {
        /// What went wrong
        message: String,

        /// Whether another attempt may succeed. Non-retryable failures
        /// terminate the attempt loop immediately.
        retryable: bool,
    },

    /// The attempt exceeded the step's configured timeout
    #[error("step timed out after {limit:?}")]
    Timeout {
        /// The configured per-attempt bound
        limit: Duration,
    },

    /// Unclassified handler error; treated as retryable
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepExecutionError {
    /// A transient failure worth retrying
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; further attempts are pointless
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the retry budget should keep being spent on this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Other(_) => true,
        }
    }
}

/// Error from a compensation handler invocation
///
/// Never halts compensation of other steps; it is recorded on the step and
/// surfaces at the workflow level as `compensation_failed`.
#[derive(Debug, thiserror::Error)]
pub enum StepCompensationError {
    /// The handler could not undo the step
    #[error("{0}")]
    Failed(String),

    /// Unclassified handler error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepCompensationError {
    /// Report a compensation failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Successful result of a forward handler invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Data produced by the step, persisted on the step record
    pub output_data: serde_json::Value,

    /// Opaque payload the compensation handler needs to undo the step
    pub compensation_data: Option<serde_json::Value>,

    /// Context entries to merge into the workflow's snapshot for
    /// subsequent steps
    pub context_updates: ContextDelta,
}

impl StepOutput {
    /// Create an output with the given data
    pub fn new(output_data: serde_json::Value) -> Self {
        Self {
            output_data,
            compensation_data: None,
            context_updates: ContextDelta::new(),
        }
    }

    /// Attach the payload compensation will need
    pub fn with_compensation(mut self, compensation_data: serde_json::Value) -> Self {
        self.compensation_data = Some(compensation_data);
        self
    }

    /// Add a context entry for downstream steps
    pub fn with_context_update(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

/// Execution context handed to a handler invocation
///
/// Carries the workflow identity and an immutable borrow of the current
/// context snapshot; handlers return updates as a delta in [`StepOutput`]
/// rather than mutating shared state.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Owning workflow
    pub workflow_id: Uuid,

    /// Name of the step being executed or compensated
    pub step_name: &'a str,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Attempt budget for this step
    pub max_attempts: u32,

    /// Tenant scope, if any
    pub tenant_id: Option<&'a str>,

    context: &'a WorkflowContext,
}

impl<'a> StepContext<'a> {
    /// Create a context for a handler invocation
    pub fn new(
        workflow_id: Uuid,
        step_name: &'a str,
        attempt: u32,
        max_attempts: u32,
        tenant_id: Option<&'a str>,
        context: &'a WorkflowContext,
    ) -> Self {
        Self {
            workflow_id,
            step_name,
            attempt,
            max_attempts,
            tenant_id,
            context,
        }
    }

    /// The accumulated context snapshot
    pub fn context(&self) -> &WorkflowContext {
        self.context
    }

    /// Look up a context value by key
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.get(key)
    }
}

/// A named forward/compensate pair bound to a step
///
/// # Example
///
/// ```ignore
/// struct AllocateAddress { pool: AddressPoolClient }
///
/// #[async_trait]
/// impl StepHandler for AllocateAddress {
///     async fn execute(
///         &self,
///         ctx: StepContext<'_>,
///         input: serde_json::Value,
///     ) -> Result<StepOutput, StepExecutionError> {
///         // Idempotent: the pool returns the existing lease for a known key
///         let lease = self.pool.allocate(ctx.workflow_id, &input).await?;
///         Ok(StepOutput::new(json!({ "address": lease.address }))
///             .with_compensation(json!({ "lease_id": lease.id }))
///             .with_context_update("address", json!(lease.address)))
///     }
///
///     async fn compensate(
///         &self,
///         _ctx: StepContext<'_>,
///         compensation_data: serde_json::Value,
///     ) -> Result<(), StepCompensationError> {
///         let lease_id = compensation_data["lease_id"].as_str().unwrap_or_default();
///         self.pool.release(lease_id).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Apply the step against its external system
    ///
    /// Receives the step's slice of the workflow input and the current
    /// context snapshot. Must be idempotent under re-invocation with the
    /// same input.
    async fn execute(
        &self,
        ctx: StepContext<'_>,
        input: serde_json::Value,
    ) -> Result<StepOutput, StepExecutionError>;

    /// Undo a previously completed execution
    ///
    /// Receives the `compensation_data` the forward invocation stored.
    /// Must be idempotent and safe to call even if the forward effect was
    /// never observed externally.
    async fn compensate(
        &self,
        ctx: StepContext<'_>,
        compensation_data: serde_json::Value,
    ) -> Result<(), StepCompensationError>;
}
