//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, UpdateOutcome, WorkflowError, WorkflowSignal, WorkflowUpdate};
use crate::activity::{error_types, ActivityError};

/// Types of timeouts that can occur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Activity did not complete within start_to_close_timeout
    StartToClose,

    /// Worker did not send heartbeat within heartbeat_timeout
    Heartbeat,
}

impl TimeoutType {
    /// Error type reported to the retry policy for this timeout
    pub fn error_type(self) -> &'static str {
        match self {
            TimeoutType::StartToClose => error_types::TIMEOUT_START_TO_CLOSE,
            TimeoutType::Heartbeat => error_types::TIMEOUT_HEARTBEAT,
        }
    }
}

/// Reference from a child execution back to the parent that scheduled it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentRef {
    /// Parent's external workflow id
    pub workflow_id: String,
    /// Parent run that issued the schedule command
    pub run_id: Uuid,
    /// Child id as named by the parent program
    pub child_id: String,
}

/// Kinds of recorded markers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Version gate decision for a change id
    Version,
    /// Value computed once by `side_effect`
    SideEffect,
    /// Latest value of a `mutable_side_effect`
    MutableSideEffect,
}

impl MarkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerKind::Version => "version",
            MarkerKind::SideEffect => "side_effect",
            MarkerKind::MutableSideEffect => "mutable_side_effect",
        }
    }
}

/// A recorded, non-deterministic value pinned into history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub id: String,
    pub value: serde_json::Value,
}

/// Events stored in a run's event log
///
/// These events form the append-only log for a workflow run. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows after recovery
/// - Auditing and debugging
///
/// Events are immutable once written. Events are either *commands* (the
/// program asked for something; matched against intents on replay) or
/// *resolutions* (something happened; delivered to the program on replay).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow run was started with the given input
    WorkflowStarted {
        /// Registered program name
        workflow_type: String,
        /// The input provided when starting the run
        input: serde_json::Value,
        /// Set when this run is a child execution
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentRef>,
        /// Previous run when this run was created by continue-as-new
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continued_from: Option<Uuid>,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    /// Run was retired and a successor started under the same workflow id
    WorkflowContinuedAsNew {
        /// Run id of the successor
        new_run_id: Uuid,
        /// Input handed to the successor
        input: serde_json::Value,
    },

    /// Cancellation of the run was requested from outside
    CancelRequested {
        /// Reason supplied by the caller
        reason: String,
    },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique identifier for this activity within the run
        activity_id: String,
        /// Type of activity
        activity_type: String,
        /// Queue the task was dispatched to
        task_queue: String,
        /// Input data
        input: serde_json::Value,
        /// Execution options
        options: ActivityOptions,
    },

    /// Activity completed successfully (possibly after retries)
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,
        /// Result value
        result: serde_json::Value,
        /// Number of attempts it took
        attempts: u32,
    },

    /// Activity failed terminally (non-retryable or attempts exhausted)
    ActivityFailed {
        /// Activity identifier
        activity_id: String,
        /// Error details of the last attempt
        error: ActivityError,
        /// Number of attempts made
        attempts: u32,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was armed
    TimerStarted {
        /// Timer identifier
        timer_id: String,
        /// Logical deadline (workflow now + duration)
        fire_at: DateTime<Utc>,
    },

    /// Timer fired
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Channel Events
    // =========================================================================
    /// External signal received
    SignalReceived {
        /// The signal
        signal: WorkflowSignal,
    },

    /// Update request accepted by the validator
    UpdateReceived {
        /// The update request
        update: WorkflowUpdate,
    },

    /// Update handler produced its outcome
    UpdateCompleted {
        /// Update identifier
        update_id: String,
        /// Result or error returned to the caller
        outcome: UpdateOutcome,
    },

    // =========================================================================
    // Determinism Events
    // =========================================================================
    /// Recorded side effect or version decision
    MarkerRecorded {
        /// The marker
        marker: Marker,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Child workflow was created
    ChildWorkflowScheduled {
        /// Child id as named by the parent program
        child_id: String,
        /// External id of the child execution
        workflow_id: String,
        /// First run of the child
        run_id: Uuid,
        /// Child program type
        workflow_type: String,
        /// Child input
        input: serde_json::Value,
    },

    /// Child workflow completed successfully
    ChildWorkflowCompleted {
        /// Child id
        child_id: String,
        /// Child result
        result: serde_json::Value,
    },

    /// Child workflow failed or was cancelled
    ChildWorkflowFailed {
        /// Child id
        child_id: String,
        /// Error details
        error: WorkflowError,
    },
}

impl WorkflowEvent {
    /// Stable snake_case name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow_started",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow_completed",
            WorkflowEvent::WorkflowFailed { .. } => "workflow_failed",
            WorkflowEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            WorkflowEvent::WorkflowContinuedAsNew { .. } => "workflow_continued_as_new",
            WorkflowEvent::CancelRequested { .. } => "cancel_requested",
            WorkflowEvent::ActivityScheduled { .. } => "activity_scheduled",
            WorkflowEvent::ActivityCompleted { .. } => "activity_completed",
            WorkflowEvent::ActivityFailed { .. } => "activity_failed",
            WorkflowEvent::TimerStarted { .. } => "timer_started",
            WorkflowEvent::TimerFired { .. } => "timer_fired",
            WorkflowEvent::SignalReceived { .. } => "signal_received",
            WorkflowEvent::UpdateReceived { .. } => "update_received",
            WorkflowEvent::UpdateCompleted { .. } => "update_completed",
            WorkflowEvent::MarkerRecorded { .. } => "marker_recorded",
            WorkflowEvent::ChildWorkflowScheduled { .. } => "child_workflow_scheduled",
            WorkflowEvent::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            WorkflowEvent::ChildWorkflowFailed { .. } => "child_workflow_failed",
        }
    }

    /// Get the activity ID if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::ActivityScheduled { activity_id, .. }
            | WorkflowEvent::ActivityCompleted { activity_id, .. }
            | WorkflowEvent::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal event (run is closed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowCompleted { .. }
                | WorkflowEvent::WorkflowFailed { .. }
                | WorkflowEvent::WorkflowCancelled { .. }
                | WorkflowEvent::WorkflowContinuedAsNew { .. }
        )
    }

    /// Check if this event records a decision made by the program
    ///
    /// Command events are matched against the program's intents on replay;
    /// everything else is delivered to the program as a resolution.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::ActivityScheduled { .. }
                | WorkflowEvent::TimerStarted { .. }
                | WorkflowEvent::MarkerRecorded { .. }
                | WorkflowEvent::ChildWorkflowScheduled { .. }
                | WorkflowEvent::UpdateCompleted { .. }
        ) || self.is_terminal()
    }
}

/// An event as persisted in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedEvent {
    /// Position in the run's log, starting at 0
    pub sequence: u64,
    /// Engine clock at append time
    pub recorded_at: DateTime<Utc>,
    /// The event itself
    pub event: WorkflowEvent,
}
