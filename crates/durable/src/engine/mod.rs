//! Workflow execution engine
//!
//! The engine drives workflow programs through deterministic replay:
//! - [`WorkflowExecutor`] replays runs and commits the intents they produce
//! - [`TaskDispatcher`] hands activity tasks to workers and records results
//! - [`TimerManager`] fires durable timers
//! - Signals, queries, updates and cancellation enter through the executor
//! - Continue-as-new retires a run in favor of a successor with fresh history

mod channels;
mod compactor;
mod dispatcher;
mod executor;
mod registry;
pub mod replay;
mod timers;
pub mod version;

pub use dispatcher::{DispatchError, DispatcherConfig, ReportOutcome, TaskDispatcher};
pub use executor::{ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor};
pub use registry::{RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{ExecutionResult, Intent, ReplayError, ReplayOutcome};
pub use timers::{TimerConfig, TimerManager};
