//! # Saga Orchestration Engine
//!
//! A PostgreSQL-backed saga orchestrator for provisioning composite
//! resources across independent external systems with all-or-nothing
//! semantics and no shared transaction coordinator.
//!
//! ## Features
//!
//! - **Ordered execution**: steps run strictly sequentially per workflow,
//!   in ascending step order
//! - **Durable progress**: every state transition is committed to the store
//!   before the orchestrator proceeds, so a restart resumes exactly where
//!   the last run left off
//! - **Automatic compensation**: when a required step exhausts its retry
//!   budget, completed steps are undone in strictly descending order
//! - **Cooperative cancellation**: polled between steps, never preemptive
//! - **Per-attempt timeouts and backoff**: a timeout counts as a failed
//!   attempt against the step's retry budget
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   OrchestrationService                       │
//! │  (create / get / list / retry / cancel / stats)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SagaOrchestrator                         │
//! │  (forward pass, compensation pass, resume, retry)           │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                     │
//!                    ▼                     ▼
//! ┌──────────────────────────┐  ┌──────────────────────────────┐
//! │     HandlerRegistry      │  │        WorkflowStore          │
//! │  (StepHandler bindings)  │  │  (PostgreSQL / in-memory)     │
//! └──────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use provisio_saga::prelude::*;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("create_record", Arc::new(CreateRecordHandler::new(db)));
//! registry.register("allocate_address", Arc::new(AllocateAddressHandler::new(pool)));
//! registry.register("activate_device", Arc::new(ActivateDeviceHandler::new(dms)));
//! registry.define(
//!     WorkflowDefinition::new("provision_line")
//!         .with_required_field("subscriber_id")
//!         .with_step(StepSpec::new("create_record", "record-store"))
//!         .with_step(StepSpec::new("allocate_address", "address-pool"))
//!         .with_step(StepSpec::new("activate_device", "device-mgmt")),
//! );
//! registry.verify()?;
//!
//! let store = Arc::new(PostgresWorkflowStore::new(pool));
//! let service = OrchestrationService::new(store, Arc::new(registry));
//!
//! // Resume anything a previous process left unfinished
//! service.recover().await?;
//!
//! let id = service
//!     .submit("provision_line", json!({ "subscriber_id": "sub-42" }), None)
//!     .await?;
//! ```

pub mod alert;
pub mod engine;
pub mod handler;
pub mod persistence;
pub mod reliability;
pub mod service;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::alert::{CompensationAlert, LogAlert, NoopAlert};
    pub use crate::engine::{OrchestratorConfig, OrchestratorError, SagaOrchestrator};
    pub use crate::handler::{
        HandlerRegistry, RegistryError, StepCompensationError, StepContext, StepExecutionError,
        StepHandler, StepOutput,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, Page, Pagination, PostgresWorkflowStore, StoreError,
        WorkflowCounts, WorkflowFilter, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::service::{
        OrchestrationService, ServiceError, StepSnapshot, WorkflowSnapshot, WorkflowSummary,
    };
    pub use crate::workflow::{
        ContextDelta, StepErrorDetail, StepRecord, StepSpec, StepStatus, ValidationError,
        WorkflowContext, WorkflowDefinition, WorkflowErrorDetail, WorkflowRecord, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use alert::{CompensationAlert, LogAlert, NoopAlert};
pub use engine::{OrchestratorConfig, OrchestratorError, SagaOrchestrator};
pub use handler::{
    HandlerRegistry, RegistryError, StepCompensationError, StepContext, StepExecutionError,
    StepHandler, StepOutput,
};
pub use persistence::{
    InMemoryWorkflowStore, Page, Pagination, PostgresWorkflowStore, StoreError, WorkflowCounts,
    WorkflowFilter, WorkflowStore,
};
pub use reliability::RetryPolicy;
pub use service::{
    OrchestrationService, ServiceError, StepSnapshot, WorkflowSnapshot, WorkflowSummary,
};
pub use workflow::{
    ContextDelta, StepErrorDetail, StepRecord, StepSpec, StepStatus, ValidationError,
    WorkflowContext, WorkflowDefinition, WorkflowErrorDetail, WorkflowRecord, WorkflowStatus,
};
