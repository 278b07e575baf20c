//! Channel messages: signals and updates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowError;

/// External signal delivered to a running workflow
///
/// Signals are fire-and-forget. They are appended to the run's log and
/// delivered to `on_signal` in log order the next time the run is driven.
///
/// # Example
///
/// ```ignore
/// executor.signal("order-42", "approve", json!({"by": "ops"})).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name
    pub name: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was accepted (observability only)
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(
        name: impl Into<String>,
        payload: serde_json::Value,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at,
        }
    }

    /// Check the signal name
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

/// Synchronous, mutating request against a running workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowUpdate {
    /// Caller-visible id; resubmitting the same id returns the first outcome
    pub update_id: String,

    /// Handler name
    pub name: String,

    /// Handler input
    pub payload: serde_json::Value,
}

impl WorkflowUpdate {
    /// Create an update with a generated id
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            update_id: Uuid::now_v7().to_string(),
            name: name.into(),
            payload,
        }
    }

    /// Use a caller-chosen id (for idempotent resubmission)
    pub fn with_id(mut self, update_id: impl Into<String>) -> Self {
        self.update_id = update_id.into();
        self
    }
}

/// Outcome of an update handler, recorded in `update_completed`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Completed { result: serde_json::Value },
    Failed { error: WorkflowError },
}

impl UpdateOutcome {
    /// Convert into the caller-facing result
    pub fn into_result(self) -> Result<serde_json::Value, WorkflowError> {
        match self {
            UpdateOutcome::Completed { result } => Ok(result),
            UpdateOutcome::Failed { error } => Err(error),
        }
    }
}

impl From<Result<serde_json::Value, WorkflowError>> for UpdateOutcome {
    fn from(result: Result<serde_json::Value, WorkflowError>) -> Self {
        match result {
            Ok(result) => UpdateOutcome::Completed { result },
            Err(error) => UpdateOutcome::Failed { error },
        }
    }
}
