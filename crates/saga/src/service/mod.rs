//! Orchestration service
//!
//! The entry point for callers: validates input, creates workflows, and
//! exposes the lifecycle operations (`get`, `list`, `retry`, `cancel`,
//! `stats`). Any protocol layer — REST, RPC, CLI — wraps this API; none is
//! mandated here.
//!
//! Provisioning chains run from seconds to minutes, so both modes are
//! supported: [`OrchestrationService::submit`] returns an id for polling,
//! [`OrchestrationService::submit_and_wait`] blocks until the terminal
//! result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::engine::{OrchestratorError, SagaOrchestrator};
use crate::handler::{HandlerRegistry, RegistryError};
use crate::persistence::{
    Page, Pagination, StoreError, WorkflowCounts, WorkflowFilter, WorkflowStore,
};
use crate::workflow::{
    StepErrorDetail, StepRecord, StepStatus, ValidationError, WorkflowErrorDetail, WorkflowRecord,
    WorkflowStatus,
};

/// Errors from service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Caller input failed validation; no step was executed
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// The requested operation is not legal from the workflow's status
    #[error("workflow {workflow_id} in status {status} cannot be {operation}")]
    InvalidStateTransition {
        /// The workflow in question
        workflow_id: Uuid,

        /// Its current status
        status: WorkflowStatus,

        /// The rejected operation, past tense ("retried", "cancelled")
        operation: &'static str,
    },

    /// Registry error (unknown workflow type or step)
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Orchestrator error
    #[error("orchestrator error: {0}")]
    Orchestrator(OrchestratorError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => Self::WorkflowNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<OrchestratorError> for ServiceError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Store(e) => e.into(),
            OrchestratorError::Registry(e) => Self::Registry(e),
            OrchestratorError::NotRetryable {
                workflow_id,
                status,
            } => Self::InvalidStateTransition {
                workflow_id,
                status,
                operation: "retried",
            },
            other => Self::Orchestrator(other),
        }
    }
}

/// Curated view of one step for external callers
#[derive(Debug, Clone, Serialize)]
pub struct StepSnapshot {
    /// Step name
    pub name: String,

    /// Position in the definition
    pub step_order: i32,

    /// External system label
    pub target_system: String,

    /// Current status
    pub status: StepStatus,

    /// Failed attempts consumed
    pub retry_count: u32,

    /// Most recent error, if any
    pub error: Option<StepErrorDetail>,
}

/// Curated view of a workflow for external callers
///
/// The raw context is orchestrator-internal and deliberately absent; what a
/// workflow produces for callers is its `output_data`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    /// Workflow id
    pub id: Uuid,

    /// Workflow type
    pub workflow_type: String,

    /// Current status
    pub status: WorkflowStatus,

    /// Curated output, populated on completion
    pub output_data: Option<serde_json::Value>,

    /// Error detail when the workflow failed
    pub error: Option<WorkflowErrorDetail>,

    /// Whole-workflow retries requested
    pub retry_count: u32,

    /// Tenant scope, if any
    pub tenant_id: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Per-step status
    pub steps: Vec<StepSnapshot>,
}

/// One row of a workflow listing
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    /// Workflow id
    pub id: Uuid,

    /// Workflow type
    pub workflow_type: String,

    /// Current status
    pub status: WorkflowStatus,

    /// Tenant scope, if any
    pub tenant_id: Option<String>,

    /// Whole-workflow retries requested
    pub retry_count: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl From<WorkflowRecord> for WorkflowSummary {
    fn from(record: WorkflowRecord) -> Self {
        Self {
            id: record.id,
            workflow_type: record.workflow_type,
            status: record.status,
            tenant_id: record.tenant_id,
            retry_count: record.retry_count,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Lifecycle API over the orchestrator and store
pub struct OrchestrationService<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    orchestrator: Arc<SagaOrchestrator<S>>,
}

impl<S: WorkflowStore> OrchestrationService<S> {
    /// Create a service with a default orchestrator
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>) -> Self {
        let orchestrator = Arc::new(SagaOrchestrator::new(store.clone(), registry.clone()));
        Self {
            store,
            registry,
            orchestrator,
        }
    }

    /// Create a service around a pre-configured orchestrator
    pub fn with_orchestrator(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        orchestrator: Arc<SagaOrchestrator<S>>,
    ) -> Self {
        Self {
            store,
            registry,
            orchestrator,
        }
    }

    /// The orchestrator driving this service's workflows
    pub fn orchestrator(&self) -> &Arc<SagaOrchestrator<S>> {
        &self.orchestrator
    }

    /// Create a workflow and run it in the background (asynchronous mode)
    ///
    /// Returns the workflow id for later polling via [`Self::get`].
    #[instrument(skip(self, input_data))]
    pub async fn submit(
        &self,
        workflow_type: &str,
        input_data: serde_json::Value,
        tenant_id: Option<String>,
    ) -> Result<Uuid, ServiceError> {
        let workflow_id = self.create(workflow_type, input_data, tenant_id).await?;

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.run(workflow_id).await {
                error!(%workflow_id, error = %err, "background workflow run failed");
            }
        });

        Ok(workflow_id)
    }

    /// Create a workflow and wait for its terminal result (synchronous mode)
    #[instrument(skip(self, input_data))]
    pub async fn submit_and_wait(
        &self,
        workflow_type: &str,
        input_data: serde_json::Value,
        tenant_id: Option<String>,
    ) -> Result<WorkflowSnapshot, ServiceError> {
        let workflow_id = self.create(workflow_type, input_data, tenant_id).await?;
        self.orchestrator.run(workflow_id).await?;
        self.get(workflow_id).await
    }

    /// Current status snapshot of a workflow
    #[instrument(skip(self))]
    pub async fn get(&self, workflow_id: Uuid) -> Result<WorkflowSnapshot, ServiceError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let steps = self.store.get_steps(workflow_id).await?;
        Ok(snapshot(workflow, steps))
    }

    /// Paginated workflow summaries matching the filter
    #[instrument(skip(self, filter, pagination))]
    pub async fn list(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Page<WorkflowSummary>, ServiceError> {
        let page = self.store.list_workflows(filter, pagination).await?;
        Ok(Page {
            items: page.items.into_iter().map(WorkflowSummary::from).collect(),
            total: page.total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Re-run a concluded workflow in the background
    ///
    /// Fails with [`ServiceError::InvalidStateTransition`] unless the
    /// workflow is in a retryable terminal status.
    #[instrument(skip(self))]
    pub async fn retry(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.status.is_retryable() {
            return Err(ServiceError::InvalidStateTransition {
                workflow_id,
                status: workflow.status,
                operation: "retried",
            });
        }

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.retry(workflow_id).await {
                error!(%workflow_id, error = %err, "background workflow retry failed");
            }
        });

        Ok(())
    }

    /// Re-run a concluded workflow and wait for its terminal result
    #[instrument(skip(self))]
    pub async fn retry_and_wait(&self, workflow_id: Uuid) -> Result<WorkflowSnapshot, ServiceError> {
        self.orchestrator.retry(workflow_id).await?;
        self.get(workflow_id).await
    }

    /// Request cooperative cancellation
    ///
    /// A still-pending workflow is cancelled outright; a running one is
    /// flagged and rolls back once the orchestrator polls the flag between
    /// steps. Fails if the workflow is already terminal.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), ServiceError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(ServiceError::InvalidStateTransition {
                workflow_id,
                status: workflow.status,
                operation: "cancelled",
            });
        }

        if workflow.status == WorkflowStatus::Pending {
            let mut cancelled = workflow.clone();
            cancelled.status = WorkflowStatus::Cancelled;
            match self
                .store
                .update_workflow(&cancelled, workflow.version)
                .await
            {
                Ok(_) => return Ok(()),
                // A runner picked the workflow up in the meantime; fall
                // through to the cooperative flag.
                Err(StoreError::Conflict { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.store.request_cancel(workflow_id).await?;
        Ok(())
    }

    /// Aggregate counts by status and type
    #[instrument(skip(self))]
    pub async fn stats(&self, tenant_id: Option<&str>) -> Result<WorkflowCounts, ServiceError> {
        Ok(self.store.count_workflows(tenant_id).await?)
    }

    /// Resume non-terminal workflows after a process restart
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<Uuid>, ServiceError> {
        Ok(self.orchestrator.recover().await?)
    }

    /// Validate input against the definition and persist a pending workflow
    /// with its step rows
    async fn create(
        &self,
        workflow_type: &str,
        input_data: serde_json::Value,
        tenant_id: Option<String>,
    ) -> Result<Uuid, ServiceError> {
        let definition = self.registry.definition(workflow_type)?;
        definition.validate_input(&input_data)?;

        let workflow = WorkflowRecord::new(workflow_type, input_data, tenant_id);
        let steps: Vec<StepRecord> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(order, spec)| {
                StepRecord::new(workflow.id, &spec.name, order as i32, &spec.target_system)
            })
            .collect();

        self.store.create_workflow(&workflow, &steps).await?;
        Ok(workflow.id)
    }
}

fn snapshot(workflow: WorkflowRecord, steps: Vec<StepRecord>) -> WorkflowSnapshot {
    WorkflowSnapshot {
        id: workflow.id,
        workflow_type: workflow.workflow_type,
        status: workflow.status,
        output_data: workflow.output_data,
        error: workflow.error,
        retry_count: workflow.retry_count,
        tenant_id: workflow.tenant_id,
        created_at: workflow.created_at,
        updated_at: workflow.updated_at,
        steps: steps
            .into_iter()
            .map(|step| StepSnapshot {
                name: step.name,
                step_order: step.step_order,
                target_system: step.target_system,
                status: step.status,
                retry_count: step.retry_count,
                error: step.error,
            })
            .collect(),
    }
}
