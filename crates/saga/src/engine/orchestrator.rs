//! Saga orchestrator
//!
//! The orchestrator drives a workflow's steps in ascending order, commits
//! every state transition to the store before proceeding, and — when a
//! required step exhausts its budget or a cancellation is observed —
//! compensates the completed steps in strictly descending order.
//!
//! A workflow is driven by exactly one task at a time: an in-process map
//! guards against duplicate drivers in the same process, and the store's
//! version check stops a stale resumer in another process.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::alert::{CompensationAlert, NoopAlert};
use crate::handler::{HandlerRegistry, RegistryError, StepContext, StepExecutionError, StepOutput};
use crate::persistence::{StoreError, WorkflowStore};
use crate::reliability::RetryPolicy;
use crate::workflow::{
    StepErrorDetail, StepRecord, StepSpec, StepStatus, WorkflowDefinition, WorkflowErrorDetail,
    WorkflowRecord, WorkflowStatus,
};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay policy used by steps that do not specify their own
    pub default_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::exponential(),
        }
    }
}

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Another task in this process is already driving the workflow
    #[error("workflow {0} is already being driven by this process")]
    AlreadyRunning(Uuid),

    /// Retry requested from a non-retryable status
    #[error("workflow {workflow_id} in status {status} cannot be retried")]
    NotRetryable {
        /// The workflow in question
        workflow_id: Uuid,

        /// Its current status
        status: WorkflowStatus,
    },

    /// Stored steps do not line up with the registered definition
    #[error(
        "workflow {workflow_id} has {actual} steps but definition {workflow_type} declares {expected}"
    )]
    DefinitionMismatch {
        /// The workflow in question
        workflow_id: Uuid,

        /// The definition consulted
        workflow_type: String,

        /// Steps the definition declares
        expected: usize,

        /// Step rows found in the store
        actual: usize,
    },
}

/// Outcome of driving one step's forward attempts
enum StepRun {
    /// The handler succeeded within the budget
    Completed(StepOutput),

    /// Every attempt failed (or a non-retryable failure cut the loop short)
    Exhausted {
        error: StepExecutionError,
        attempts: u32,
    },
}

/// Removes the in-flight marker when a driver finishes, on every exit path
struct RunGuard<'a> {
    in_flight: &'a DashMap<Uuid, ()>,
    workflow_id: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.workflow_id);
    }
}

/// Saga orchestrator
///
/// # Example
///
/// ```ignore
/// use provisio_saga::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowStore::new());
/// let orchestrator = SagaOrchestrator::new(store, Arc::new(registry));
///
/// let result = orchestrator.run(workflow_id).await?;
/// assert!(result.status.is_terminal());
/// ```
pub struct SagaOrchestrator<S: WorkflowStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: OrchestratorConfig,
    alert: Arc<dyn CompensationAlert>,
    in_flight: DashMap<Uuid, ()>,
}

impl<S: WorkflowStore> SagaOrchestrator<S> {
    /// Create an orchestrator over the given store and registry
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            config: OrchestratorConfig::default(),
            alert: Arc::new(NoopAlert),
            in_flight: DashMap::new(),
        }
    }

    /// Replace the default configuration
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a compensation-failure alert sink
    pub fn with_alert(mut self, alert: Arc<dyn CompensationAlert>) -> Self {
        self.alert = alert;
        self
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Drive a workflow until it reaches a terminal status
    ///
    /// Safe to call on a freshly created workflow, on a workflow being
    /// resumed after a crash (forward or mid-rollback), and on a workflow
    /// already terminal (no-op, returns the record).
    #[instrument(skip(self))]
    pub async fn run(&self, workflow_id: Uuid) -> Result<WorkflowRecord, OrchestratorError> {
        let _guard = self.acquire(workflow_id)?;

        let mut workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            debug!(%workflow_id, status = %workflow.status, "workflow already terminal");
            return Ok(workflow);
        }

        let mut steps = self.store.get_steps(workflow_id).await?;
        let definition = self.registry.definition(&workflow.workflow_type)?.clone();
        if steps.len() != definition.steps.len() {
            return Err(OrchestratorError::DefinitionMismatch {
                workflow_id,
                workflow_type: workflow.workflow_type.clone(),
                expected: definition.steps.len(),
                actual: steps.len(),
            });
        }

        match workflow.status {
            WorkflowStatus::Pending => {
                workflow.status = WorkflowStatus::Running;
                self.persist_workflow(&mut workflow).await?;
                self.forward(&mut workflow, &mut steps, &definition).await
            }
            WorkflowStatus::Running => self.forward(&mut workflow, &mut steps, &definition).await,
            WorkflowStatus::RollingBack => {
                self.rollback(&mut workflow, &mut steps, &definition).await
            }
            _ => Ok(workflow),
        }
    }

    /// Start a fresh forward pass over a concluded workflow
    ///
    /// Permitted only from `Failed`, `RolledBack` or `Compensated`. All step
    /// statuses are reset; the final context of the prior attempt carries
    /// over. Handlers see completed work again and must dedup via their
    /// natural keys.
    #[instrument(skip(self))]
    pub async fn retry(&self, workflow_id: Uuid) -> Result<WorkflowRecord, OrchestratorError> {
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.status.is_retryable() {
            return Err(OrchestratorError::NotRetryable {
                workflow_id,
                status: workflow.status,
            });
        }

        info!(%workflow_id, retry = workflow.retry_count + 1, "retrying workflow");

        self.store.clear_cancel(workflow_id).await?;

        let mut steps = self.store.get_steps(workflow_id).await?;
        for step in steps.iter_mut() {
            step.reset();
            self.store.update_step(step).await?;
        }

        workflow.status = WorkflowStatus::Pending;
        workflow.error = None;
        workflow.output_data = None;
        workflow.retry_count += 1;
        self.persist_workflow(&mut workflow).await?;

        self.run(workflow_id).await
    }

    /// Resume every non-terminal workflow after a process restart
    ///
    /// Returns the ids that were driven to completion. Failures to resume
    /// one workflow are logged and do not stop the others.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<Uuid>, OrchestratorError> {
        let ids = self.store.list_resumable().await?;
        info!(count = ids.len(), "recovering non-terminal workflows");

        let mut resumed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.run(id).await {
                Ok(_) => resumed.push(id),
                Err(err) => error!(workflow_id = %id, error = %err, "failed to resume workflow"),
            }
        }
        Ok(resumed)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn acquire(&self, workflow_id: Uuid) -> Result<RunGuard<'_>, OrchestratorError> {
        match self.in_flight.entry(workflow_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(OrchestratorError::AlreadyRunning(workflow_id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Ok(RunGuard {
                    in_flight: &self.in_flight,
                    workflow_id,
                })
            }
        }
    }

    /// Commit the workflow record and advance the local version
    async fn persist_workflow(
        &self,
        workflow: &mut WorkflowRecord,
    ) -> Result<(), OrchestratorError> {
        let new_version = self
            .store
            .update_workflow(workflow, workflow.version)
            .await?;
        workflow.version = new_version;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    /// Forward phase: execute steps in ascending order
    async fn forward(
        &self,
        workflow: &mut WorkflowRecord,
        steps: &mut [StepRecord],
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRecord, OrchestratorError> {
        for idx in 0..steps.len() {
            // A persisted Failed step means a required step exhausted its
            // budget before a crash; pick the rollback back up.
            if steps[idx].status == StepStatus::Failed {
                if workflow.error.is_none() {
                    let step = &steps[idx];
                    let message = step
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "step failed".to_string());
                    workflow.error = Some(WorkflowErrorDetail::step_failure(
                        &step.name,
                        step.retry_count.max(1),
                        message,
                    ));
                }
                return self.rollback(workflow, steps, definition).await;
            }

            if steps[idx].status.is_forward_terminal() {
                continue;
            }

            // Cancellation is cooperative: polled between steps, never
            // preemptive mid-handler.
            if self.store.cancel_requested(workflow.id).await? {
                info!(workflow_id = %workflow.id, "cancellation observed; rolling back");
                return self.rollback(workflow, steps, definition).await;
            }

            let spec = &definition.steps[idx];
            match self.execute_step(workflow, &mut steps[idx], spec).await? {
                StepRun::Completed(output) => {
                    let step = &mut steps[idx];
                    step.status = StepStatus::Completed;
                    step.output_data = if output.output_data.is_null() {
                        None
                    } else {
                        Some(output.output_data)
                    };
                    step.compensation_data = output.compensation_data;
                    step.finished_at = Some(Utc::now());
                    self.store.update_step(step).await?;

                    workflow.context = workflow.context.merged(output.context_updates);
                    self.persist_workflow(workflow).await?;

                    debug!(workflow_id = %workflow.id, step = %spec.name, "step completed");
                }
                StepRun::Exhausted { error, attempts } => {
                    let step = &mut steps[idx];
                    step.finished_at = Some(Utc::now());

                    if spec.required {
                        step.status = StepStatus::Failed;
                        self.store.update_step(step).await?;

                        warn!(
                            workflow_id = %workflow.id,
                            step = %spec.name,
                            attempts,
                            error = %error,
                            "required step exhausted its budget; rolling back"
                        );
                        workflow.error = Some(WorkflowErrorDetail::step_failure(
                            &spec.name,
                            attempts,
                            error.to_string(),
                        ));
                        return self.rollback(workflow, steps, definition).await;
                    }

                    step.status = StepStatus::Skipped;
                    self.store.update_step(step).await?;
                    info!(
                        workflow_id = %workflow.id,
                        step = %spec.name,
                        attempts,
                        "optional step exhausted its budget; skipped"
                    );
                }
            }
        }

        workflow.status = WorkflowStatus::Completed;
        workflow.output_data = Some(curate_output(steps));
        self.persist_workflow(workflow).await?;

        info!(workflow_id = %workflow.id, "workflow completed");
        Ok(workflow.clone())
    }

    /// Run one step's attempt loop, committing each failed attempt
    async fn execute_step(
        &self,
        workflow: &WorkflowRecord,
        step: &mut StepRecord,
        spec: &StepSpec,
    ) -> Result<StepRun, OrchestratorError> {
        let handler = self.registry.handler(&spec.name)?;
        let policy = spec
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let max_attempts = spec.max_attempts.max(1);

        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.retry_count = 0;
        step.error = None;
        self.store.update_step(step).await?;

        let input = step_input(workflow, spec);
        let mut last_error: Option<StepExecutionError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = policy.delay_for_attempt(attempt).min(spec.timeout);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let ctx = StepContext::new(
                workflow.id,
                &spec.name,
                attempt,
                max_attempts,
                workflow.tenant_id.as_deref(),
                &workflow.context,
            );

            let error =
                match tokio::time::timeout(spec.timeout, handler.execute(ctx, input.clone())).await
                {
                    Ok(Ok(output)) => return Ok(StepRun::Completed(output)),
                    Ok(Err(err)) => err,
                    Err(_) => StepExecutionError::Timeout {
                        limit: spec.timeout,
                    },
                };

            warn!(
                workflow_id = %workflow.id,
                step = %spec.name,
                attempt,
                error = %error,
                "step attempt failed"
            );

            // Commit the failed attempt before sleeping or giving up
            step.retry_count = attempt;
            step.error = Some(StepErrorDetail::execution(attempt, error.to_string()));
            self.store.update_step(step).await?;

            let retryable = error.is_retryable();
            last_error = Some(error);
            if !retryable {
                break;
            }
        }

        let attempts = step.retry_count;
        let error = last_error
            .unwrap_or_else(|| StepExecutionError::non_retryable("step attempt budget is zero"));
        Ok(StepRun::Exhausted { error, attempts })
    }

    /// Compensation phase: undo completed steps in descending order
    ///
    /// Best-effort: a compensation failure is recorded and the phase keeps
    /// going, so every undoable step gets its chance.
    async fn rollback(
        &self,
        workflow: &mut WorkflowRecord,
        steps: &mut [StepRecord],
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRecord, OrchestratorError> {
        if workflow.status != WorkflowStatus::RollingBack {
            workflow.status = WorkflowStatus::RollingBack;
            self.persist_workflow(workflow).await?;
        }

        for idx in (0..steps.len()).rev() {
            if !steps[idx].status.needs_compensation() {
                continue;
            }

            let spec = &definition.steps[idx];
            let step = &mut steps[idx];

            step.status = StepStatus::Compensating;
            self.store.update_step(step).await?;

            let outcome = self.compensate_step(workflow, step, spec).await;
            match outcome {
                Ok(()) => {
                    step.status = StepStatus::Compensated;
                    step.finished_at = Some(Utc::now());
                    self.store.update_step(step).await?;
                    debug!(workflow_id = %workflow.id, step = %spec.name, "step compensated");
                }
                Err(message) => {
                    error!(
                        workflow_id = %workflow.id,
                        step = %spec.name,
                        error = %message,
                        "compensation failed; continuing with earlier steps"
                    );
                    step.status = StepStatus::CompensationFailed;
                    step.error = Some(StepErrorDetail::compensation(message));
                    step.finished_at = Some(Utc::now());
                    self.store.update_step(step).await?;
                }
            }
        }

        workflow.status = conclude_rollback(workflow, steps);
        self.persist_workflow(workflow).await?;
        info!(workflow_id = %workflow.id, status = %workflow.status, "rollback concluded");

        if workflow.status == WorkflowStatus::CompensationFailed {
            let failed: Vec<StepRecord> = steps
                .iter()
                .filter(|s| s.status == StepStatus::CompensationFailed)
                .cloned()
                .collect();
            self.alert.compensation_failed(workflow, &failed).await;
        }

        Ok(workflow.clone())
    }

    /// Invoke one compensation handler, mapping every failure to a message
    async fn compensate_step(
        &self,
        workflow: &WorkflowRecord,
        step: &StepRecord,
        spec: &StepSpec,
    ) -> Result<(), String> {
        let handler = self.registry.handler(&spec.name).map_err(|e| e.to_string())?;

        let data = step
            .compensation_data
            .clone()
            .unwrap_or(serde_json::Value::Null);
        let ctx = StepContext::new(
            workflow.id,
            &spec.name,
            1,
            1,
            workflow.tenant_id.as_deref(),
            &workflow.context,
        );

        match tokio::time::timeout(spec.timeout, handler.compensate(ctx, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("compensation timed out after {:?}", spec.timeout)),
        }
    }
}

/// The step's slice of the workflow input: the entry keyed by the step's
/// name when the input carries one, otherwise the whole input object.
fn step_input(workflow: &WorkflowRecord, spec: &StepSpec) -> serde_json::Value {
    workflow
        .input_data
        .get(&spec.name)
        .cloned()
        .unwrap_or_else(|| workflow.input_data.clone())
}

/// Curated workflow output: step name → output for steps that produced one
fn curate_output(steps: &[StepRecord]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for step in steps {
        if let Some(output) = &step.output_data {
            if !output.is_null() {
                map.insert(step.name.clone(), output.clone());
            }
        }
    }
    serde_json::Value::Object(map)
}

/// Terminal status after a compensation pass, derived purely from the step
/// statuses and the recorded error
fn conclude_rollback(workflow: &WorkflowRecord, steps: &[StepRecord]) -> WorkflowStatus {
    if steps
        .iter()
        .any(|s| s.status == StepStatus::CompensationFailed)
    {
        return WorkflowStatus::CompensationFailed;
    }

    let failure_triggered =
        workflow.error.is_some() || steps.iter().any(|s| s.status == StepStatus::Failed);

    if failure_triggered {
        if steps.iter().any(|s| s.status == StepStatus::Compensated) {
            WorkflowStatus::Compensated
        } else {
            // Nothing was ever completed, so nothing was undone
            WorkflowStatus::Failed
        }
    } else {
        WorkflowStatus::RolledBack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{StepCompensationError, StepHandler, StepOutput};
    use crate::persistence::InMemoryWorkflowStore;
    use crate::workflow::StepSpec;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Scripted handler: fails the first `fail_attempts` executions, then
    /// succeeds. Records every invocation in a shared journal.
    struct ScriptedHandler {
        name: &'static str,
        fail_attempts: u32,
        fail_compensation: bool,
        calls: Arc<Mutex<Vec<String>>>,
        executions: Mutex<u32>,
    }

    impl ScriptedHandler {
        fn new(name: &'static str, calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                fail_attempts: 0,
                fail_compensation: false,
                calls,
                executions: Mutex::new(0),
            }
        }

        fn failing(mut self, attempts: u32) -> Self {
            self.fail_attempts = attempts;
            self
        }

        fn with_failing_compensation(mut self) -> Self {
            self.fail_compensation = true;
            self
        }
    }

    #[async_trait]
    impl StepHandler for ScriptedHandler {
        async fn execute(
            &self,
            _ctx: StepContext<'_>,
            _input: serde_json::Value,
        ) -> Result<StepOutput, StepExecutionError> {
            let mut executions = self.executions.lock();
            *executions += 1;
            self.calls.lock().push(format!("execute:{}", self.name));

            if *executions <= self.fail_attempts {
                return Err(StepExecutionError::retryable("scripted failure"));
            }

            Ok(StepOutput::new(json!({ "done": self.name }))
                .with_compensation(json!({ "undo": self.name }))
                .with_context_update(self.name, json!("ok")))
        }

        async fn compensate(
            &self,
            _ctx: StepContext<'_>,
            _compensation_data: serde_json::Value,
        ) -> Result<(), StepCompensationError> {
            self.calls.lock().push(format!("compensate:{}", self.name));
            if self.fail_compensation {
                return Err(StepCompensationError::failed("scripted compensation failure"));
            }
            Ok(())
        }
    }

    fn three_step_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("provision_line")
            .with_step(fast_spec("create_record"))
            .with_step(fast_spec("allocate_resource"))
            .with_step(fast_spec("activate_service"))
    }

    fn fast_spec(name: &str) -> StepSpec {
        StepSpec::new(name, "test-system")
            .with_timeout(Duration::from_secs(5))
            .with_retry_policy(RetryPolicy::none())
    }

    struct Fixture {
        store: Arc<InMemoryWorkflowStore>,
        orchestrator: SagaOrchestrator<InMemoryWorkflowStore>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(build: impl FnOnce(&Arc<Mutex<Vec<String>>>, &mut HandlerRegistry)) -> Fixture {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        build(&calls, &mut registry);

        let store = Arc::new(InMemoryWorkflowStore::new());
        let orchestrator = SagaOrchestrator::new(store.clone(), Arc::new(registry));
        Fixture {
            store,
            orchestrator,
            calls,
        }
    }

    async fn seed(
        store: &InMemoryWorkflowStore,
        definition: &WorkflowDefinition,
    ) -> WorkflowRecord {
        let workflow = WorkflowRecord::new(&definition.workflow_type, json!({}), None);
        let steps: Vec<StepRecord> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                StepRecord::new(workflow.id, &spec.name, i as i32, &spec.target_system)
            })
            .collect();
        store.create_workflow(&workflow, &steps).await.unwrap();
        workflow
    }

    #[tokio::test]
    async fn test_happy_path_completes_all_steps() {
        let definition = three_step_definition();
        let f = fixture(|calls, registry| {
            registry.define(three_step_definition());
            for name in ["create_record", "allocate_resource", "activate_service"] {
                registry.register(name, Arc::new(ScriptedHandler::new(name, calls.clone())));
            }
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.context.get("activate_service"), Some(&json!("ok")));

        let steps = f.store.get_steps(workflow.id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

        // Output is curated per step
        let output = result.output_data.unwrap();
        assert_eq!(output["create_record"], json!({"done": "create_record"}));
    }

    #[tokio::test]
    async fn test_required_failure_compensates_in_reverse() {
        let definition = three_step_definition();
        let f = fixture(|calls, registry| {
            registry.define(three_step_definition());
            registry.register(
                "create_record",
                Arc::new(ScriptedHandler::new("create_record", calls.clone())),
            );
            registry.register(
                "allocate_resource",
                Arc::new(ScriptedHandler::new("allocate_resource", calls.clone())),
            );
            // retry budget 3, fails on all 3 attempts
            registry.register(
                "activate_service",
                Arc::new(ScriptedHandler::new("activate_service", calls.clone()).failing(99)),
            );
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Compensated);

        let steps = f.store.get_steps(workflow.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Compensated);
        assert_eq!(steps[1].status, StepStatus::Compensated);
        assert_eq!(steps[2].status, StepStatus::Failed);
        assert_eq!(steps[2].retry_count, 3);

        // Error detail retains step name and attempt count
        let error = result.error.unwrap();
        assert_eq!(error.step.as_deref(), Some("activate_service"));
        assert_eq!(error.attempts, 3);

        // Compensation ran strictly in reverse
        let calls = f.calls.lock();
        let compensations: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("compensate:"))
            .collect();
        assert_eq!(
            compensations,
            vec!["compensate:allocate_resource", "compensate:create_record"]
        );
    }

    #[tokio::test]
    async fn test_first_step_failure_has_nothing_to_undo() {
        let definition = three_step_definition();
        let f = fixture(|calls, registry| {
            registry.define(three_step_definition());
            registry.register(
                "create_record",
                Arc::new(ScriptedHandler::new("create_record", calls.clone()).failing(99)),
            );
            registry.register(
                "allocate_resource",
                Arc::new(ScriptedHandler::new("allocate_resource", calls.clone())),
            );
            registry.register(
                "activate_service",
                Arc::new(ScriptedHandler::new("activate_service", calls.clone())),
            );
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);

        let steps = f.store.get_steps(workflow.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[1].status, StepStatus::Pending);
        assert_eq!(steps[2].status, StepStatus::Pending);
        assert!(f.calls.lock().iter().all(|c| !c.starts_with("compensate:")));
    }

    #[tokio::test]
    async fn test_optional_step_failure_is_skipped() {
        let definition = WorkflowDefinition::new("provision_line")
            .with_step(fast_spec("create_record"))
            .with_step(fast_spec("create_billing").optional().with_max_attempts(2))
            .with_step(fast_spec("activate_service"));

        let f = fixture(|calls, registry| {
            registry.define(
                WorkflowDefinition::new("provision_line")
                    .with_step(fast_spec("create_record"))
                    .with_step(fast_spec("create_billing").optional().with_max_attempts(2))
                    .with_step(fast_spec("activate_service")),
            );
            registry.register(
                "create_record",
                Arc::new(ScriptedHandler::new("create_record", calls.clone())),
            );
            registry.register(
                "create_billing",
                Arc::new(ScriptedHandler::new("create_billing", calls.clone()).failing(99)),
            );
            registry.register(
                "activate_service",
                Arc::new(ScriptedHandler::new("activate_service", calls.clone())),
            );
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);

        let steps = f.store.get_steps(workflow.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Skipped);
        assert_eq!(steps[1].retry_count, 2);
        assert_eq!(steps[2].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_compensation_failure_keeps_going_and_marks_workflow() {
        let definition = three_step_definition();
        let f = fixture(|calls, registry| {
            registry.define(three_step_definition());
            registry.register(
                "create_record",
                Arc::new(ScriptedHandler::new("create_record", calls.clone())),
            );
            registry.register(
                "allocate_resource",
                Arc::new(
                    ScriptedHandler::new("allocate_resource", calls.clone())
                        .with_failing_compensation(),
                ),
            );
            registry.register(
                "activate_service",
                Arc::new(ScriptedHandler::new("activate_service", calls.clone()).failing(99)),
            );
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::CompensationFailed);

        let steps = f.store.get_steps(workflow.id).await.unwrap();
        // The failing compensation never stopped the earlier step's undo
        assert_eq!(steps[0].status, StepStatus::Compensated);
        assert_eq!(steps[1].status, StepStatus::CompensationFailed);
        assert!(steps[1].error.as_ref().unwrap().during_compensation);
        assert_eq!(steps[2].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_retryable_error_cuts_attempt_loop() {
        struct HardFail;

        #[async_trait]
        impl StepHandler for HardFail {
            async fn execute(
                &self,
                _ctx: StepContext<'_>,
                _input: serde_json::Value,
            ) -> Result<StepOutput, StepExecutionError> {
                Err(StepExecutionError::non_retryable("schema rejected"))
            }

            async fn compensate(
                &self,
                _ctx: StepContext<'_>,
                _compensation_data: serde_json::Value,
            ) -> Result<(), StepCompensationError> {
                Ok(())
            }
        }

        let definition = WorkflowDefinition::new("provision_line")
            .with_step(fast_spec("create_record").with_max_attempts(5));
        let f = fixture(|_calls, registry| {
            registry.define(
                WorkflowDefinition::new("provision_line")
                    .with_step(fast_spec("create_record").with_max_attempts(5)),
            );
            registry.register("create_record", Arc::new(HardFail));
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        let steps = f.store.get_steps(workflow.id).await.unwrap();
        // one attempt, not five
        assert_eq!(steps[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_step_timeout_counts_as_failed_attempt() {
        struct Hangs;

        #[async_trait]
        impl StepHandler for Hangs {
            async fn execute(
                &self,
                _ctx: StepContext<'_>,
                _input: serde_json::Value,
            ) -> Result<StepOutput, StepExecutionError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
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

        let spec = StepSpec::new("create_record", "test-system")
            .with_timeout(Duration::from_millis(50))
            .with_max_attempts(2)
            .with_retry_policy(RetryPolicy::none());
        let definition = WorkflowDefinition::new("provision_line").with_step(spec.clone());

        let f = fixture(|_calls, registry| {
            registry.define(WorkflowDefinition::new("provision_line").with_step(spec.clone()));
            registry.register("create_record", Arc::new(Hangs));
        });

        let workflow = seed(&f.store, &definition).await;
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        let steps = f.store.get_steps(workflow.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].retry_count, 2);
        assert!(steps[0].error.as_ref().unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_on_terminal_workflow_is_noop() {
        let definition = three_step_definition();
        let f = fixture(|calls, registry| {
            registry.define(three_step_definition());
            for name in ["create_record", "allocate_resource", "activate_service"] {
                registry.register(name, Arc::new(ScriptedHandler::new(name, calls.clone())));
            }
        });

        let workflow = seed(&f.store, &definition).await;
        f.orchestrator.run(workflow.id).await.unwrap();

        let executions_before = f.calls.lock().len();
        let result = f.orchestrator.run(workflow.id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(f.calls.lock().len(), executions_before);
    }

    #[tokio::test]
    async fn test_retry_from_non_retryable_status_is_rejected() {
        let definition = three_step_definition();
        let f = fixture(|calls, registry| {
            registry.define(three_step_definition());
            for name in ["create_record", "allocate_resource", "activate_service"] {
                registry.register(name, Arc::new(ScriptedHandler::new(name, calls.clone())));
            }
        });

        let workflow = seed(&f.store, &definition).await;
        f.orchestrator.run(workflow.id).await.unwrap();

        let result = f.orchestrator.retry(workflow.id).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::NotRetryable {
                status: WorkflowStatus::Completed,
                ..
            })
        ));
    }
}
