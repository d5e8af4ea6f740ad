//! WorkflowStore trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::workflow::{StepRecord, WorkflowRecord, WorkflowStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// Optimistic-lock conflict: another writer advanced the workflow
    #[error("version conflict on workflow {workflow_id}: expected {expected}, found {actual}")]
    Conflict {
        /// The workflow under contention
        workflow_id: Uuid,

        /// Version the writer expected
        expected: i64,

        /// Version actually stored
        actual: i64,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Filter for listing workflows
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    /// Restrict to one status
    pub status: Option<WorkflowStatus>,

    /// Restrict to one workflow type
    pub workflow_type: Option<String>,

    /// Restrict to one tenant
    pub tenant_id: Option<String>,
}

impl WorkflowFilter {
    /// Filter by status
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by workflow type
    pub fn with_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    /// Filter by tenant
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// Rows to skip
    pub offset: u32,

    /// Maximum rows to return
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// One page of query results
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The rows in this page
    pub items: Vec<T>,

    /// Total rows matching the filter (across all pages)
    pub total: u64,

    /// Offset this page was fetched at
    pub offset: u32,

    /// Limit this page was fetched with
    pub limit: u32,
}

/// Aggregate workflow counts for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowCounts {
    /// Workflows per status (keyed by the wire status string)
    pub by_status: BTreeMap<String, u64>,

    /// Workflows per workflow type
    pub by_type: BTreeMap<String, u64>,
}

/// Durable store for workflow and step records
///
/// Implementations must be thread-safe and crash-consistent: the
/// orchestrator commits every state transition here before proceeding, so a
/// restart resumes precisely from the last committed transition.
/// `update_workflow` enforces optimistic concurrency via the record's
/// version so that a stale resumer can never advance a workflow another
/// instance already moved past.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Persist a new workflow together with its step rows
    async fn create_workflow(
        &self,
        workflow: &WorkflowRecord,
        steps: &[StepRecord],
    ) -> Result<(), StoreError>;

    /// Fetch a workflow by id
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError>;

    /// Fetch a workflow's steps in ascending step order
    async fn get_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    /// Commit a workflow update, enforcing the version check
    ///
    /// `expected_version` must match the stored version; on success the
    /// stored version becomes `expected_version + 1` and is returned.
    async fn update_workflow(
        &self,
        workflow: &WorkflowRecord,
        expected_version: i64,
    ) -> Result<i64, StoreError>;

    /// Commit a step update
    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError>;

    /// Record a cooperative cancellation request
    async fn request_cancel(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    /// Whether cancellation has been requested for this workflow
    async fn cancel_requested(&self, workflow_id: Uuid) -> Result<bool, StoreError>;

    /// Clear a cancellation request (whole-workflow retry)
    async fn clear_cancel(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    /// List workflows matching the filter, newest first
    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Page<WorkflowRecord>, StoreError>;

    /// Aggregate counts per status and per type, optionally tenant-scoped
    async fn count_workflows(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<WorkflowCounts, StoreError>;

    /// Ids of workflows in a non-terminal status, for crash recovery
    async fn list_resumable(&self) -> Result<Vec<Uuid>, StoreError>;
}
