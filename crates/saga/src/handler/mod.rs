//! Step handlers and the registry that binds them to step names

mod registry;
mod step;

pub use registry::{HandlerRegistry, RegistryError};
pub use step::{
    StepCompensationError, StepContext, StepExecutionError, StepHandler, StepOutput,
};
