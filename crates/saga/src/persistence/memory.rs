//! In-memory implementation of WorkflowStore
//!
//! Primarily for tests and embedded use. Mirrors the PostgreSQL
//! implementation's semantics, including the optimistic version check.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::workflow::{StepRecord, WorkflowRecord};

use super::store::*;

/// Internal per-workflow state
struct WorkflowState {
    workflow: WorkflowRecord,
    steps: Vec<StepRecord>,
    cancel_requested: bool,
}

/// In-memory implementation of WorkflowStore
///
/// # Example
///
/// ```
/// use provisio_saga::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Number of workflows held
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(
        &self,
        workflow: &WorkflowRecord,
        steps: &[StepRecord],
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let mut steps = steps.to_vec();
        steps.sort_by_key(|s| s.step_order);

        workflows.insert(
            workflow.id,
            WorkflowState {
                workflow: workflow.clone(),
                steps,
                cancel_requested: false,
            },
        );
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|s| s.workflow.clone())
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn get_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|s| s.steps.clone())
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn update_workflow(
        &self,
        workflow: &WorkflowRecord,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(&workflow.id)
            .ok_or(StoreError::WorkflowNotFound(workflow.id))?;

        if state.workflow.version != expected_version {
            return Err(StoreError::Conflict {
                workflow_id: workflow.id,
                expected: expected_version,
                actual: state.workflow.version,
            });
        }

        let new_version = expected_version + 1;
        state.workflow = workflow.clone();
        state.workflow.version = new_version;
        state.workflow.updated_at = Utc::now();
        Ok(new_version)
    }

    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(&step.workflow_id)
            .ok_or(StoreError::WorkflowNotFound(step.workflow_id))?;

        let existing = state
            .steps
            .iter_mut()
            .find(|s| s.id == step.id)
            .ok_or(StoreError::StepNotFound(step.id))?;

        *existing = step.clone();
        Ok(())
    }

    async fn request_cancel(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        state.cancel_requested = true;
        Ok(())
    }

    async fn cancel_requested(&self, workflow_id: Uuid) -> Result<bool, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|s| s.cancel_requested)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn clear_cancel(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let state = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        state.cancel_requested = false;
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Page<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read();
        let mut matching: Vec<_> = workflows
            .values()
            .map(|s| &s.workflow)
            .filter(|w| {
                if let Some(status) = filter.status {
                    if w.status != status {
                        return false;
                    }
                }
                if let Some(ref workflow_type) = filter.workflow_type {
                    if &w.workflow_type != workflow_type {
                        return false;
                    }
                }
                if let Some(ref tenant_id) = filter.tenant_id {
                    if w.tenant_id.as_ref() != Some(tenant_id) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(Page {
            items,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    async fn count_workflows(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<WorkflowCounts, StoreError> {
        let workflows = self.workflows.read();
        let mut counts = WorkflowCounts::default();

        for state in workflows.values() {
            let workflow = &state.workflow;
            if let Some(tenant) = tenant_id {
                if workflow.tenant_id.as_deref() != Some(tenant) {
                    continue;
                }
            }

            *counts
                .by_status
                .entry(workflow.status.as_str().to_string())
                .or_insert(0) += 1;
            *counts
                .by_type
                .entry(workflow.workflow_type.clone())
                .or_insert(0) += 1;
        }

        Ok(counts)
    }

    async fn list_resumable(&self) -> Result<Vec<Uuid>, StoreError> {
        let workflows = self.workflows.read();
        let mut ids: Vec<_> = workflows
            .values()
            .filter(|s| !s.workflow.status.is_terminal())
            .map(|s| s.workflow.id)
            .collect();

        ids.sort();
        Ok(ids)
    }
}
