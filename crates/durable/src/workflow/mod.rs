//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowContext`] for time, side effects and version gates
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] enum for persisted events
//! - [`WorkflowSignal`] / [`WorkflowUpdate`] for external communication
//! - [`Saga`] for compensation bookkeeping

mod action;
mod context;
mod definition;
mod event;
mod saga;
mod signal;

pub use action::{ActivityOptions, WorkflowAction};
pub use context::WorkflowContext;
pub use definition::{error_codes, Workflow, WorkflowError};
pub use event::{Marker, MarkerKind, ParentRef, RecordedEvent, TimeoutType, WorkflowEvent};
pub use saga::{Compensation, Saga, SagaStep};
pub use signal::{UpdateOutcome, WorkflowSignal, WorkflowUpdate};
