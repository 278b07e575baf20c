//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for run, event, task and timer persistence
//! - [`InMemoryWorkflowEventStore`] for tests and single-process embedding
//! - [`EventLog`] paged reader and appender over a store

mod log;
mod memory;
mod store;

pub use log::{EventLog, DEFAULT_PAGE_SIZE};
pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    AppendBatch, CancelOutcome, ClaimedTask, ExecutionFilter, ExecutionInfo, ExpiredTask,
    FinishedTask, HeartbeatResponse, NewExecution, RunClosure, StoreError, TaskDefinition,
    TaskInfo, TaskStatus, TimerDefinition, WorkflowEventStore, WorkflowStatus,
};
