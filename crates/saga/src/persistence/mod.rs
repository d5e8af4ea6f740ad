//! Durable persistence of workflow and step records

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::PostgresWorkflowStore;
pub use store::{Page, Pagination, StoreError, WorkflowCounts, WorkflowFilter, WorkflowStore};
