//! External channels into a running workflow: signals, queries, updates and
//! cancellation requests

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use super::executor::{ExecutorError, WorkflowExecutor};
use super::replay::{self, HandlerError};
use crate::persistence::{AppendBatch, StoreError, WorkflowEventStore, WorkflowStatus};
use crate::workflow::{RecordedEvent, UpdateOutcome, WorkflowEvent, WorkflowSignal, WorkflowUpdate};

/// Where an update stands in a run's history
enum UpdateProgress {
    Unknown,
    Received,
    Completed(UpdateOutcome),
}

fn update_progress(history: &[RecordedEvent], update_id: &str) -> UpdateProgress {
    let mut progress = UpdateProgress::Unknown;
    for recorded in history {
        match &recorded.event {
            WorkflowEvent::UpdateCompleted {
                update_id: id,
                outcome,
            } if id == update_id => return UpdateProgress::Completed(outcome.clone()),
            WorkflowEvent::UpdateReceived { update } if update.update_id == update_id => {
                progress = UpdateProgress::Received;
            }
            _ => {}
        }
    }
    progress
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Deliver a signal to the current run of a workflow
    ///
    /// The signal is durable once this returns; delivery to `on_signal`
    /// happens in log order on the next drive.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        let info = self.running(workflow_id).await?;
        let now = self.now();
        let signal = WorkflowSignal::new(name, payload, now);

        self.append_with_retry(info.run_id, |_| {
            AppendBatch::event(
                now,
                WorkflowEvent::SignalReceived {
                    signal: signal.clone(),
                },
            )
        })
        .await
        .map_err(|e| self.closed_as_not_running(e, workflow_id))?;
        debug!(%workflow_id, run_id = %info.run_id, signal = name, "signal recorded");

        if self.config.process_on_signal {
            self.process_workflow(info.run_id).await?;
        }
        Ok(())
    }

    /// Answer a query from the replayed state of the current run
    ///
    /// Nothing is appended. Closed runs can be queried too.
    #[instrument(skip(self, args))]
    pub async fn query(
        &self,
        workflow_id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutorError> {
        let info = self.describe(workflow_id).await?;
        let history = self.log.load(info.run_id).await?;
        let mut outcome = replay::replay(&self.registry, workflow_id, info.run_id, &history)?;

        outcome.query(name, args).map_err(|e| match e {
            HandlerError::Usage(error) => ExecutorError::Usage(error),
            HandlerError::Rejected(error) => ExecutorError::QueryFailed(error),
        })
    }

    /// Send an update and wait for its outcome
    ///
    /// The validator runs first against the replayed state; a rejection is
    /// returned without appending anything. Resubmitting an update id returns
    /// the outcome of the first submission, even after the run has closed.
    #[instrument(skip(self, update), fields(update_id = %update.update_id, update = %update.name))]
    pub async fn update(
        &self,
        workflow_id: &str,
        update: WorkflowUpdate,
    ) -> Result<serde_json::Value, ExecutorError> {
        let info = self.describe(workflow_id).await?;
        let run_id = info.run_id;
        let history = self.log.load(run_id).await?;

        match update_progress(&history, &update.update_id) {
            UpdateProgress::Completed(outcome) => {
                debug!(%workflow_id, status = %info.status, "update already completed, returning recorded outcome");
                return outcome.into_result().map_err(ExecutorError::UpdateRejected);
            }
            _ if info.status != WorkflowStatus::Running => {
                return Err(ExecutorError::NotRunning {
                    workflow_id: workflow_id.to_string(),
                    status: info.status,
                });
            }
            UpdateProgress::Received => {}
            UpdateProgress::Unknown => {
                let mut outcome = replay::replay(&self.registry, workflow_id, run_id, &history)?;
                outcome.validate_update(&update).map_err(|e| match e {
                    HandlerError::Usage(error) => ExecutorError::Usage(error),
                    HandlerError::Rejected(error) => ExecutorError::UpdateRejected(error),
                })?;

                let now = self.now();
                let update_id = update.update_id.clone();
                self.append_with_retry(run_id, |_| {
                    AppendBatch::event(
                        now,
                        WorkflowEvent::UpdateReceived {
                            update: update.clone(),
                        },
                    )
                })
                .await
                .map_err(|e| self.closed_as_not_running(e, workflow_id))?;
                info!(%workflow_id, %run_id, %update_id, "update accepted");
            }
        }

        let notify = Arc::clone(
            self.update_waiters
                .entry(run_id)
                .or_insert_with(|| Arc::new(Notify::new()))
                .value(),
        );
        self.process_workflow(run_id).await?;

        let deadline = tokio::time::Instant::now() + self.config.update_timeout;
        loop {
            // Register interest before looking, so a completion in between
            // still wakes us up
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let history = self.log.load(run_id).await?;
            if let UpdateProgress::Completed(outcome) =
                update_progress(&history, &update.update_id)
            {
                return outcome.into_result().map_err(ExecutorError::UpdateRejected);
            }
            let status = self.store.get_execution(run_id).await?.status;
            if status.is_terminal() {
                return Err(ExecutorError::UpdateAborted {
                    update_id: update.update_id,
                    status,
                });
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ExecutorError::UpdateTimeout(update.update_id));
            }
        }
    }

    /// Ask the current run to cancel
    ///
    /// Appends `cancel_requested` and drives the run; the program decides how
    /// to wind down (by default it cancels immediately). Requesting again is a
    /// no-op for the program.
    #[instrument(skip(self))]
    pub async fn request_cancellation(
        &self,
        workflow_id: &str,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let info = self.running(workflow_id).await?;
        let now = self.now();
        self.append_with_retry(info.run_id, |_| {
            AppendBatch::event(
                now,
                WorkflowEvent::CancelRequested {
                    reason: reason.to_string(),
                },
            )
        })
        .await
        .map_err(|e| self.closed_as_not_running(e, workflow_id))?;
        info!(%workflow_id, run_id = %info.run_id, reason, "cancellation requested");

        self.process_workflow(info.run_id).await?;
        Ok(())
    }

    /// Current run, which must be running
    pub(super) async fn running(
        &self,
        workflow_id: &str,
    ) -> Result<crate::persistence::ExecutionInfo, ExecutorError> {
        let info = self.describe(workflow_id).await?;
        if info.status != WorkflowStatus::Running {
            return Err(ExecutorError::NotRunning {
                workflow_id: workflow_id.to_string(),
                status: info.status,
            });
        }
        Ok(info)
    }

    fn closed_as_not_running(&self, err: ExecutorError, workflow_id: &str) -> ExecutorError {
        match err {
            ExecutorError::Store(StoreError::ExecutionClosed { status, .. }) => {
                ExecutorError::NotRunning {
                    workflow_id: workflow_id.to_string(),
                    status,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::workflow::{
        error_codes, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    };
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Counter with a signal, a query and an update handler
    struct Counter {
        total: i64,
    }

    impl Workflow for Counter {
        const TYPE: &'static str = "counter";
        type Input = i64;
        type Output = i64;

        fn new(input: Self::Input) -> Self {
            Self { total: input }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_signal(
            &mut self,
            _ctx: &mut WorkflowContext,
            signal: &WorkflowSignal,
        ) -> Vec<WorkflowAction> {
            if signal.is("add") {
                self.total += signal.payload.as_i64().unwrap_or(0);
            }
            if signal.is("stop") {
                return vec![WorkflowAction::complete(json!(self.total))];
            }
            vec![]
        }

        fn validate_update(
            &self,
            _ctx: &mut WorkflowContext,
            update: &WorkflowUpdate,
        ) -> Result<(), WorkflowError> {
            match update.payload.as_i64() {
                Some(n) if n > 0 => Ok(()),
                _ => Err(WorkflowError::new("amount must be positive")),
            }
        }

        fn on_update(
            &mut self,
            _ctx: &mut WorkflowContext,
            update: &WorkflowUpdate,
        ) -> Vec<WorkflowAction> {
            if update.name == "hold" {
                return vec![];
            }
            self.total += update.payload.as_i64().unwrap_or(0);
            vec![WorkflowAction::complete_update(
                update.update_id.clone(),
                json!(self.total),
            )]
        }

        fn query(
            &self,
            ctx: &mut WorkflowContext,
            name: &str,
            _args: Value,
        ) -> Result<Value, WorkflowError> {
            match name {
                "total" => Ok(json!(self.total)),
                "roll" => ctx.random_u64().map(|n| json!(n)),
                other => Err(WorkflowError::new(format!("no query {other}"))
                    .with_code(error_codes::UNKNOWN_QUERY)),
            }
        }
    }

    fn executor() -> WorkflowExecutor<InMemoryWorkflowEventStore> {
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        executor.register::<Counter>();
        executor
    }

    #[tokio::test]
    async fn test_signals_are_applied_in_order() {
        let executor = executor();
        executor.start_workflow::<Counter>("c-1", 10).await.unwrap();

        executor.signal("c-1", "add", json!(5)).await.unwrap();
        executor.signal("c-1", "add", json!(7)).await.unwrap();
        assert_eq!(executor.query("c-1", "total", json!(null)).await.unwrap(), json!(22));

        executor.signal("c-1", "stop", json!(null)).await.unwrap();
        assert_eq!(
            executor.get_execution_status("c-1").await.unwrap(),
            WorkflowStatus::Completed
        );

        let result = executor.signal("c-1", "add", json!(1)).await;
        assert!(matches!(result, Err(ExecutorError::NotRunning { .. })));
    }

    #[tokio::test]
    async fn test_query_does_not_append() {
        let executor = executor();
        executor.start_workflow::<Counter>("c-2", 1).await.unwrap();
        let before = executor.history("c-2").await.unwrap().len();

        let usage = executor.query("c-2", "roll", json!(null)).await;
        assert!(matches!(usage, Err(ExecutorError::Usage(_))));

        let unknown = executor.query("c-2", "nope", json!(null)).await;
        match unknown {
            Err(ExecutorError::QueryFailed(e)) => assert!(e.has_code(error_codes::UNKNOWN_QUERY)),
            other => panic!("unexpected: {other:?}"),
        }

        assert_eq!(executor.history("c-2").await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_update_round_trip_and_dedup() {
        let executor = executor();
        executor.start_workflow::<Counter>("c-3", 1).await.unwrap();

        let update = WorkflowUpdate::new("add", json!(4)).with_id("u-1");
        let first = executor.update("c-3", update.clone()).await.unwrap();
        assert_eq!(first, json!(5));

        // Same id: recorded outcome, handler not run again
        let again = executor.update("c-3", update).await.unwrap();
        assert_eq!(again, json!(5));
        assert_eq!(executor.query("c-3", "total", json!(null)).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_completed_update_answers_after_close() {
        let executor = executor();
        executor.start_workflow::<Counter>("c-7", 1).await.unwrap();

        let update = WorkflowUpdate::new("add", json!(2)).with_id("u-3");
        assert_eq!(executor.update("c-7", update.clone()).await.unwrap(), json!(3));
        executor.signal("c-7", "stop", json!(null)).await.unwrap();

        // A client retrying after a lost response still gets its answer
        assert_eq!(executor.update("c-7", update).await.unwrap(), json!(3));

        let fresh = executor
            .update("c-7", WorkflowUpdate::new("add", json!(2)).with_id("u-4"))
            .await;
        assert!(matches!(
            fresh,
            Err(ExecutorError::NotRunning { status: WorkflowStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_update_appends_nothing() {
        let executor = executor();
        executor.start_workflow::<Counter>("c-4", 1).await.unwrap();
        let before = executor.history("c-4").await.unwrap().len();

        let result = executor
            .update("c-4", WorkflowUpdate::new("add", json!(-3)))
            .await;
        assert!(matches!(result, Err(ExecutorError::UpdateRejected(_))));
        assert_eq!(executor.history("c-4").await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_update_times_out_when_not_driven() {
        let store = InMemoryWorkflowEventStore::new();
        let mut executor = WorkflowExecutor::with_config(
            store,
            crate::engine::ExecutorConfig::default().with_update_timeout(Duration::from_millis(50)),
        );
        executor.register::<Counter>();
        executor.start_workflow::<Counter>("c-5", 1).await.unwrap();

        let result = executor
            .update("c-5", WorkflowUpdate::new("hold", json!(2)).with_id("u-2"))
            .await;
        assert!(matches!(result, Err(ExecutorError::UpdateTimeout(id)) if id == "u-2"));

        // The request itself was recorded
        let history = executor.history("c-5").await.unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(&e.event, WorkflowEvent::UpdateReceived { update } if update.update_id == "u-2")));
    }

    #[tokio::test]
    async fn test_cancellation_closes_run() {
        let executor = executor();
        executor.start_workflow::<Counter>("c-6", 1).await.unwrap();

        executor.request_cancellation("c-6", "operator").await.unwrap();
        let info = executor.describe("c-6").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Cancelled);
        assert!(info.error.unwrap().has_code(error_codes::CANCELLED));

        let again = executor.request_cancellation("c-6", "operator").await;
        assert!(matches!(again, Err(ExecutorError::NotRunning { .. })));
    }
}
