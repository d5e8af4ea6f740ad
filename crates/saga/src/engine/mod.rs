//! The saga execution engine

mod orchestrator;

pub use orchestrator::{OrchestratorConfig, OrchestratorError, SagaOrchestrator};
