//! Workflow actions and activity options

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{error_codes, UpdateOutcome, WorkflowContext, WorkflowError};
use crate::config::{duration_millis, option_duration_millis};
use crate::reliability::RetryPolicy;

/// Actions a workflow can request
///
/// These are the commands a workflow issues in response to events. Recording
/// actions become command events in the run's log; `CancelTimer` and
/// `CancelActivity` are never recorded and may be repeated safely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up the worker handler)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (queue, retries, timeouts)
        options: ActivityOptions,
    },

    /// Start a timer that fires after the specified duration
    ///
    /// The deadline is computed from the workflow's logical now.
    StartTimer {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Cancel a pending timer; a cancelled timer is never delivered
    CancelTimer {
        /// ID of the timer to cancel
        timer_id: String,
    },

    /// Request cancellation of a pending activity
    CancelActivity {
        /// ID of the activity to cancel
        activity_id: String,
    },

    /// Schedule a child workflow
    ScheduleChildWorkflow {
        /// Identifier of the child within this workflow
        child_id: String,

        /// Type of workflow to start
        workflow_type: String,

        /// Input for the child workflow
        input: serde_json::Value,
    },

    /// Resolve an accepted update
    CompleteUpdate {
        /// Update being resolved
        update_id: String,

        /// Value or error returned to the caller
        outcome: UpdateOutcome,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// Finish the workflow as cancelled
    CancelWorkflow {
        /// Reason recorded in the terminal event
        reason: String,
    },

    /// Retire this run and start a fresh one with a compact input
    ContinueAsNew {
        /// Input for the successor run
        input: serde_json::Value,
    },

    /// No action (used when event handling doesn't trigger new work)
    None,
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::schedule_activity_with(activity_id, activity_type, input, ActivityOptions::default())
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Complete with a typed output
    ///
    /// An output that fails to serialize fails the workflow instead.
    pub fn complete_with<T: Serialize>(output: &T) -> Self {
        match serde_json::to_value(output) {
            Ok(result) => Self::CompleteWorkflow { result },
            Err(e) => Self::FailWorkflow {
                error: WorkflowError::new(format!("failed to serialize output: {e}"))
                    .with_code(error_codes::SERIALIZATION),
            },
        }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Create a cancel workflow action
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::CancelWorkflow {
            reason: reason.into(),
        }
    }

    /// Create a continue-as-new action
    pub fn continue_as_new(input: serde_json::Value) -> Self {
        Self::ContinueAsNew { input }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Sleep until an absolute deadline, measured against workflow time
    pub fn sleep_until(
        ctx: &WorkflowContext,
        timer_id: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        let duration = (deadline - ctx.now()).to_std().unwrap_or(Duration::ZERO);
        Self::timer(timer_id, duration)
    }

    /// Cancel a timer
    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    /// Request cancellation of an activity
    pub fn cancel_activity(activity_id: impl Into<String>) -> Self {
        Self::CancelActivity {
            activity_id: activity_id.into(),
        }
    }

    /// Start a child workflow
    pub fn child(
        child_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleChildWorkflow {
            child_id: child_id.into(),
            workflow_type: workflow_type.into(),
            input,
        }
    }

    /// Resolve an update with a value
    pub fn complete_update(update_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::CompleteUpdate {
            update_id: update_id.into(),
            outcome: UpdateOutcome::Completed { result },
        }
    }

    /// Resolve an update with an error
    pub fn reject_update(update_id: impl Into<String>, error: WorkflowError) -> Self {
        Self::CompleteUpdate {
            update_id: update_id.into(),
            outcome: UpdateOutcome::Failed { error },
        }
    }

    /// Check if this action ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::CancelWorkflow { .. }
                | Self::ContinueAsNew { .. }
        )
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Task queue to dispatch to; defaults to the activity type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,

    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for activity execution (from start to completion)
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// Heartbeat interval for long-running activities
    /// If set, workers must send heartbeats within this interval
    #[serde(default, with = "option_duration_millis")]
    pub heartbeat_timeout: Option<Duration>,

    /// Priority (higher values = higher priority, claimed first)
    pub priority: i32,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            task_queue: None,
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
            priority: 0,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Route the task to a named queue
    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }

    /// Queue this activity is dispatched to
    pub fn queue_for<'a>(&'a self, activity_type: &'a str) -> &'a str {
        self.task_queue.as_deref().unwrap_or(activity_type)
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Enable heartbeating with the specified timeout
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
