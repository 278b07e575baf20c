//! # Durable Execution Engine
//!
//! An event-sourced workflow engine: workflow programs are replayed from
//! their history on every step, so a run survives crashes, redeploys and
//! arbitrarily long waits without keeping state in memory.
//!
//! ## Features
//!
//! - **Event log**: append-only history per run with optimistic concurrency
//! - **Deterministic replay**: intents are checked against recorded commands
//! - **Activities**: dispatch with retries, exponential backoff and heartbeats
//! - **Durable timers**: lease-based firing that survives restarts
//! - **Signals, queries and updates**: message a running workflow
//! - **Continue-as-new and version gates**: bounded histories, safe upgrades
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (replays runs, commits intents, signals/queries/updates)   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//!   TaskDispatcher        TimerManager        WorkflowEventStore
//!   (activity tasks)      (due timers)        (events, tasks, timers)
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (claims tasks, executes activities, sends heartbeats)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use ledgerflow_durable::prelude::*;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Transfer {
//!     input: TransferInput,
//!     debited: bool,
//! }
//!
//! impl Workflow for Transfer {
//!     const TYPE: &'static str = "transfer";
//!     type Input = TransferInput;
//!     type Output = TransferReceipt;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { input, debited: false }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity("debit", "debit_account", json!(self.input))]
//!     }
//!
//!     // ... implement other trait methods
//! }
//! ```

pub mod activity;
pub mod clock;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod telemetry;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::DurableConfig;
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, TaskDispatcher, TimerManager, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, StoreError, TaskDefinition, WorkflowEventStore,
        WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
        WorkflowEvent, WorkflowSignal, WorkflowUpdate,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DurableConfig;
pub use engine::{
    ExecutorConfig, ExecutorError, TaskDispatcher, TimerManager, WorkflowExecutor,
    WorkflowRegistry,
};
pub use persistence::{InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowStatus};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
    WorkflowSignal, WorkflowUpdate,
};
