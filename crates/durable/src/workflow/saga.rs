//! Compensation bookkeeping for saga-style workflows
//!
//! The engine has no saga primitive. A workflow keeps a [`Saga`] in its state,
//! registers an undo step after each forward step succeeds, and on failure
//! drains the compensations in reverse order, one activity at a time.
//!
//! Callbacks run again on every replay, so nothing here logs. Failed
//! compensations are logged once, live, by the dispatcher that records them.

use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowAction, WorkflowError};
use crate::activity::ActivityError;

const COMPENSATION_PREFIX: &str = "compensate:";

/// One registered undo step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Compensation {
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// What the workflow should do after a compensation resolves
#[derive(Debug, Clone, PartialEq)]
pub enum SagaStep {
    /// Schedule the next compensation
    Next(WorkflowAction),
    /// A compensation is already running; wait for its result
    Waiting,
    /// All compensations ran; fail with the original error
    Done(WorkflowError),
}

impl SagaStep {
    /// Actions to return from the callback
    pub fn into_actions(self) -> Vec<WorkflowAction> {
        match self {
            SagaStep::Next(action) => vec![action],
            SagaStep::Waiting => vec![],
            SagaStep::Done(error) => vec![WorkflowAction::fail(error)],
        }
    }
}

/// Ordered list of compensations plus progress through them
#[derive(Debug, Clone, Default)]
pub struct Saga {
    pending: Vec<Compensation>,
    original_error: Option<WorkflowError>,
    failed: Vec<(String, ActivityError)>,
    scheduled: usize,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the undo step for a forward step that just succeeded
    pub fn add_compensation(
        &mut self,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) {
        self.add_compensation_with(activity_type, input, ActivityOptions::default());
    }

    /// Register an undo step with explicit activity options
    pub fn add_compensation_with(
        &mut self,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) {
        self.pending.push(Compensation {
            activity_type: activity_type.into(),
            input,
            options,
        });
    }

    /// Whether compensation has started
    pub fn is_compensating(&self) -> bool {
        self.original_error.is_some()
    }

    /// Check whether an activity id belongs to a compensation
    pub fn owns(&self, activity_id: &str) -> bool {
        activity_id.starts_with(COMPENSATION_PREFIX)
    }

    /// Compensations that failed so far
    pub fn failures(&self) -> &[(String, ActivityError)] {
        &self.failed
    }

    /// Begin unwinding after a forward step failed or the run was cancelled
    ///
    /// Once unwinding has started, later forward failures (typically the
    /// in-flight step reporting its cancellation) neither replace the original
    /// error nor start a second compensation.
    pub fn compensate(&mut self, error: WorkflowError) -> SagaStep {
        if self.is_compensating() {
            return SagaStep::Waiting;
        }
        self.original_error = Some(error);
        self.advance()
    }

    /// Record the outcome of a compensation and move on
    ///
    /// A failed compensation is recorded in [`Saga::failures`] and skipped;
    /// the saga still ends with the original error.
    pub fn on_compensation_result(
        &mut self,
        activity_id: &str,
        failure: Option<&ActivityError>,
    ) -> SagaStep {
        if let Some(error) = failure {
            self.failed.push((activity_id.to_string(), error.clone()));
        }
        self.advance()
    }

    fn advance(&mut self) -> SagaStep {
        match self.pending.pop() {
            Some(step) => {
                self.scheduled += 1;
                SagaStep::Next(WorkflowAction::schedule_activity_with(
                    format!("{COMPENSATION_PREFIX}{}:{}", self.scheduled, step.activity_type),
                    step.activity_type,
                    step.input,
                    step.options,
                ))
            }
            None => SagaStep::Done(
                self.original_error
                    .clone()
                    .unwrap_or_else(|| WorkflowError::new("saga compensated")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity_type(step: &SagaStep) -> &str {
        match step {
            SagaStep::Next(WorkflowAction::ScheduleActivity { activity_type, .. }) => activity_type,
            other => panic!("Expected scheduled compensation, got {other:?}"),
        }
    }

    #[test]
    fn test_compensations_run_in_reverse() {
        let mut saga = Saga::new();
        saga.add_compensation("refund", json!({}));
        saga.add_compensation("release_stock", json!({}));

        let first = saga.compensate(WorkflowError::new("shipping failed"));
        assert!(saga.is_compensating());
        assert_eq!(activity_type(&first), "release_stock");

        let second = saga.on_compensation_result("compensate:1:release_stock", None);
        assert_eq!(activity_type(&second), "refund");

        let done = saga.on_compensation_result("compensate:2:refund", None);
        assert_eq!(done, SagaStep::Done(WorkflowError::new("shipping failed")));
    }

    #[test]
    fn test_failed_compensation_keeps_original_error() {
        let mut saga = Saga::new();
        saga.add_compensation("refund", json!({}));

        let step = saga.compensate(WorkflowError::new("boom"));
        let SagaStep::Next(WorkflowAction::ScheduleActivity { activity_id, .. }) = step else {
            panic!("Expected compensation");
        };
        assert!(saga.owns(&activity_id));

        let done = saga.on_compensation_result(
            &activity_id,
            Some(&ActivityError::non_retryable("gateway down")),
        );
        assert_eq!(saga.failures().len(), 1);
        assert_eq!(
            done.into_actions(),
            vec![WorkflowAction::fail(WorkflowError::new("boom"))]
        );
    }

    #[test]
    fn test_late_forward_failure_waits_for_running_compensation() {
        let mut saga = Saga::new();
        saga.add_compensation("release_stock", json!({}));
        saga.add_compensation("void_hold", json!({}));

        let first = saga.compensate(WorkflowError::new("cancelled by operator"));
        assert_eq!(activity_type(&first), "void_hold");

        // The in-flight charge reports its cancellation after unwinding began
        let late = saga.compensate(WorkflowError::new("charge failed: cancelled"));
        assert_eq!(late, SagaStep::Waiting);
        assert!(late.into_actions().is_empty());

        let second = saga.on_compensation_result("compensate:1:void_hold", None);
        assert_eq!(activity_type(&second), "release_stock");
        let done = saga.on_compensation_result("compensate:2:release_stock", None);
        assert_eq!(done, SagaStep::Done(WorkflowError::new("cancelled by operator")));
    }

    #[test]
    fn test_empty_saga_fails_immediately() {
        let mut saga = Saga::new();
        assert_eq!(
            saga.compensate(WorkflowError::new("x")),
            SagaStep::Done(WorkflowError::new("x"))
        );
    }
}
