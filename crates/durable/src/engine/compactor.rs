//! History compaction through continue-as-new
//!
//! A long-lived workflow bounds its history by retiring the current run and
//! starting a successor under the same workflow id with fresh input. The
//! retiring run's terminal event, its status change, and the successor's
//! `workflow_started` event commit in a single store call.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::executor::{ExecutorError, WorkflowExecutor};
use crate::persistence::{
    AppendBatch, ExecutionInfo, NewExecution, RunClosure, StoreError, WorkflowEventStore,
    WorkflowStatus,
};
use crate::workflow::WorkflowEvent;

/// Successor run for `info`, carrying its parent link forward
pub(super) fn successor_for(
    info: &ExecutionInfo,
    input: serde_json::Value,
    now: DateTime<Utc>,
) -> NewExecution {
    let mut successor = NewExecution::new(
        info.workflow_id.clone(),
        info.workflow_type.clone(),
        input,
        now,
    );
    successor.parent = info.parent.clone();
    successor.continued_from = Some(info.run_id);
    successor
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Retire a running run and start its successor from outside the program
    ///
    /// Programs normally do this themselves with
    /// [`WorkflowAction::ContinueAsNew`](crate::workflow::WorkflowAction::ContinueAsNew).
    /// Returns the successor's run id.
    #[instrument(skip(self, new_input))]
    pub async fn continue_as_new(
        &self,
        run_id: Uuid,
        new_input: serde_json::Value,
    ) -> Result<Uuid, ExecutorError> {
        let attempts = self.config.max_append_retries + 1;
        for attempt in 1..=attempts {
            let info = self.store.get_execution(run_id).await?;
            if info.status != WorkflowStatus::Running {
                return Err(ExecutorError::NotRunning {
                    workflow_id: info.workflow_id,
                    status: info.status,
                });
            }
            // The successor must be constructible before the old run retires
            self.registry
                .create(&info.workflow_type, new_input.clone())?;

            let now = self.now();
            let successor = successor_for(&info, new_input.clone(), now);
            let successor_id = successor.run_id;
            let batch = AppendBatch {
                closure: Some(RunClosure::ContinuedAsNew {
                    new_run_id: successor_id,
                }),
                ..AppendBatch::event(
                    now,
                    WorkflowEvent::WorkflowContinuedAsNew {
                        new_run_id: successor_id,
                        input: new_input.clone(),
                    },
                )
            };

            match self
                .store
                .continue_as_new(run_id, info.event_count, batch, successor)
                .await
            {
                Ok(()) => {
                    info!(
                        workflow_id = %info.workflow_id,
                        %run_id,
                        successor = %successor_id,
                        events = info.event_count + 1,
                        "run continued as new"
                    );
                    self.wake_update_waiters(run_id);
                    self.update_waiters.remove(&run_id);
                    self.process_workflow(successor_id).await?;
                    return Ok(successor_id);
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    debug!(%run_id, attempt, expected, actual, "continue-as-new raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted { run_id, attempts })
    }

    /// Every run of a workflow id, oldest first
    pub async fn run_chain(&self, workflow_id: &str) -> Result<Vec<ExecutionInfo>, ExecutorError> {
        let run_ids = match self.store.list_runs(workflow_id).await {
            Ok(ids) => ids,
            Err(StoreError::WorkflowNotFound(id)) => return Err(ExecutorError::WorkflowNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let mut chain = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            chain.push(self.store.get_execution(run_id).await?);
        }
        Ok(chain)
    }
}
