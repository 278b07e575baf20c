//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::{WorkflowAction, WorkflowContext, WorkflowSignal, WorkflowUpdate};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Whether this error is retryable
    #[serde(default)]
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Check the error code
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Well-known error codes set by the engine
pub mod error_codes {
    /// Replayed intents diverged from recorded history
    pub const NON_DETERMINISTIC: &str = "NON_DETERMINISTIC";
    /// A recorded version marker is outside the supported range
    pub const INCOMPATIBLE_VERSION: &str = "INCOMPATIBLE_VERSION";
    /// The started event's input does not match the program's input type
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    /// A command reused the id of a still-pending operation
    pub const DUPLICATE_ID: &str = "DUPLICATE_ID";
    /// A value could not be (de)serialized
    pub const SERIALIZATION: &str = "SERIALIZATION";
    /// The program has no handler for the update
    pub const UNKNOWN_UPDATE: &str = "UNKNOWN_UPDATE";
    /// The program has no handler for the query
    pub const UNKNOWN_QUERY: &str = "UNKNOWN_QUERY";
    /// A read-only handler tried to record state
    pub const USAGE: &str = "USAGE";
    /// A child run was cancelled
    pub const CANCELLED: &str = "CANCELLED";
    /// A child with the same id is still running
    pub const CHILD_ALREADY_RUNNING: &str = "CHILD_ALREADY_RUNNING";
}

/// A workflow is a deterministic state machine driven by events
///
/// Workflows are the core abstraction for durable execution. The engine
/// rebuilds a workflow by calling [`Workflow::new`] with the started input
/// and replaying every recorded event through the callbacks below:
/// - How to start execution (`on_start`)
/// - How to handle activity completions (`on_activity_completed`, `on_activity_failed`)
/// - How to handle timers (`on_timer_fired`)
/// - How to handle external messages (`on_signal`, `on_update`, `query`)
/// - How to handle child workflows and cancellation requests
///
/// # Determinism
///
/// Workflows must be deterministic - given the same sequence of events, they must
/// produce the same sequence of actions. Time, randomness and version
/// decisions go through the [`WorkflowContext`]; keyed state that is iterated
/// should live in ordered maps.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// struct PaymentWorkflow {
///     amount: u64,
/// }
///
/// impl Workflow for PaymentWorkflow {
///     const TYPE: &'static str = "payment";
///     type Input = PaymentInput;
///     type Output = Receipt;
///
///     fn new(input: Self::Input) -> Self {
///         Self { amount: input.amount }
///     }
///
///     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity(
///             "charge",
///             "charge",
///             json!({ "amount": self.amount }),
///         )]
///     }
///
///     fn on_activity_completed(
///         &mut self,
///         _ctx: &mut WorkflowContext,
///         _activity_id: &str,
///         result: serde_json::Value,
///     ) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::complete(result)]
///     }
///
///     fn on_activity_failed(
///         &mut self,
///         _ctx: &mut WorkflowContext,
///         _activity_id: &str,
///         error: &ActivityError,
///     ) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::fail(WorkflowError::new(error.message.clone()))]
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// This is called both when starting a new workflow and when replaying.
    fn new(input: Self::Input) -> Self;

    /// Called when the run starts (and at the start of every replay)
    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails (after all retries exhausted)
    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called when an external signal is received
    fn on_signal(
        &mut self,
        ctx: &mut WorkflowContext,
        signal: &WorkflowSignal,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, signal);
        vec![]
    }

    /// Accept or reject an update before it is recorded
    ///
    /// Runs against the replayed state with a read-only context. A rejection
    /// is returned to the caller and nothing is appended.
    fn validate_update(
        &self,
        ctx: &mut WorkflowContext,
        update: &WorkflowUpdate,
    ) -> Result<(), WorkflowError> {
        let _ = ctx;
        Err(
            WorkflowError::new(format!("no handler for update '{}'", update.name))
                .with_code(error_codes::UNKNOWN_UPDATE),
        )
    }

    /// Called for an accepted update
    ///
    /// The update is resolved when a [`WorkflowAction::CompleteUpdate`] for its
    /// id is returned, here or from a later callback.
    fn on_update(
        &mut self,
        ctx: &mut WorkflowContext,
        update: &WorkflowUpdate,
    ) -> Vec<WorkflowAction> {
        let _ = ctx;
        vec![WorkflowAction::reject_update(
            update.update_id.clone(),
            WorkflowError::new(format!("no handler for update '{}'", update.name))
                .with_code(error_codes::UNKNOWN_UPDATE),
        )]
    }

    /// Answer a query from the current replayed state
    ///
    /// The context is read-only: recording a side effect or version marker
    /// here is a usage error.
    fn query(
        &self,
        ctx: &mut WorkflowContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        let _ = (ctx, args);
        Err(WorkflowError::new(format!("no handler for query '{name}'"))
            .with_code(error_codes::UNKNOWN_QUERY))
    }

    /// Called when a child workflow completes
    fn on_child_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        child_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, child_id, result);
        vec![]
    }

    /// Called when a child workflow fails or is cancelled
    fn on_child_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        child_id: &str,
        error: &WorkflowError,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, child_id);
        vec![WorkflowAction::fail(error.clone())]
    }

    /// Called when cancellation of the run is requested
    ///
    /// In-flight activities have already been asked to stop. Activities
    /// scheduled from here on (compensations) are not cancelled.
    fn on_cancel_requested(
        &mut self,
        ctx: &mut WorkflowContext,
        reason: &str,
    ) -> Vec<WorkflowAction> {
        let _ = ctx;
        vec![WorkflowAction::cancel(reason)]
    }
}
