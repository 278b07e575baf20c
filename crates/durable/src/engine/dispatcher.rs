//! Task dispatcher
//!
//! Hands activity tasks to workers and turns their reports into history.
//! A success or a final failure is appended together with the task's status
//! change, so a task is resolved exactly once no matter how many reports or
//! sweeps race for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::executor::{ExecutorError, WorkflowExecutor};
use crate::activity::ActivityError;
use crate::clock::add_duration;
use crate::config::env_millis;
use crate::persistence::{
    AppendBatch, CancelOutcome, ClaimedTask, FinishedTask, HeartbeatResponse, StoreError,
    TaskInfo, TaskStatus, WorkflowEventStore,
};
use crate::reliability::RetryDecision;
use crate::worker::WorkerTransport;
use crate::workflow::WorkflowEvent;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often expired attempts are swept
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        Self {
            sweep_interval: env_millis("DURABLE_TASK_SWEEP_INTERVAL_MS")
                .unwrap_or(Self::default().sweep_interval),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// What a worker report did
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// Completion recorded in history
    Completed,
    /// Attempt failed and the task was re-queued
    Retrying { next_attempt: u32, delay: Duration },
    /// Final failure recorded in history
    Failed,
    /// Task was already resolved; report discarded
    Ignored,
    /// The run closed; the result has nowhere to go
    Dropped,
}

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Task dispatcher
pub struct TaskDispatcher<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    config: DispatcherConfig,
}

impl<S: WorkflowEventStore> TaskDispatcher<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>) -> Self {
        Self::with_config(executor, DispatcherConfig::default())
    }

    pub fn with_config(executor: Arc<WorkflowExecutor<S>>, config: DispatcherConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<S>> {
        &self.executor
    }

    /// Claim up to `max_tasks` tasks from the given queues
    #[instrument(skip(self, queues))]
    pub async fn poll(
        &self,
        worker_id: &str,
        queues: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, DispatchError> {
        let tasks = self
            .executor
            .store
            .claim_tasks(worker_id, queues, max_tasks, self.executor.now())
            .await?;
        if !tasks.is_empty() {
            debug!(%worker_id, count = tasks.len(), "claimed tasks");
        }
        Ok(tasks)
    }

    /// Record a worker's result for one attempt
    ///
    /// Failures are retried per the activity's retry policy; only a final
    /// failure reaches the workflow.
    #[instrument(skip(self, result), fields(ok = result.is_ok()))]
    pub async fn report_result(
        &self,
        task_id: Uuid,
        attempt: u32,
        result: Result<serde_json::Value, ActivityError>,
    ) -> Result<ReportOutcome, DispatchError> {
        let task = match self.executor.store.get_task(task_id).await {
            Ok(task) => task,
            // Dropped with its closed run
            Err(StoreError::TaskNotFound(_)) => {
                debug!(%task_id, "task no longer tracked, ignoring report");
                return Ok(ReportOutcome::Ignored);
            }
            Err(e) => return Err(e.into()),
        };
        if task.status.is_finished() {
            debug!(%task_id, status = ?task.status, "task already resolved, ignoring report");
            return Ok(ReportOutcome::Ignored);
        }
        if task.status != TaskStatus::Claimed || task.attempt != attempt {
            return Err(StoreError::StaleAttempt {
                task_id,
                expected: task.attempt,
                actual: attempt,
            }
            .into());
        }

        match result {
            Ok(value) => self.complete(&task, attempt, value).await,
            Err(error) => self.fail(&task, attempt, error).await,
        }
    }

    /// Record a heartbeat; the response tells the worker whether to stop
    pub async fn heartbeat(
        &self,
        task_id: Uuid,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, DispatchError> {
        Ok(self
            .executor
            .store
            .heartbeat_task(task_id, attempt, details, self.executor.now())
            .await?)
    }

    /// Fail every attempt that missed its heartbeat or start-to-close deadline
    ///
    /// Timeouts are retryable failures, so they go through the retry policy
    /// like any other error. Returns the number of attempts timed out.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<usize, DispatchError> {
        let expired = self
            .executor
            .store
            .expired_tasks(self.executor.now())
            .await?;
        let mut swept = 0;
        for entry in expired {
            let task = entry.task;
            let error = ActivityError::timed_out(
                entry.timeout,
                &task.activity_id,
                task.attempt,
                task.heartbeat_details.clone(),
            );

            match self.report_result(task.id, task.attempt, Err(error)).await {
                Ok(outcome) => {
                    swept += 1;
                    warn!(
                        task_id = %task.id,
                        activity_id = %task.activity_id,
                        timeout = entry.timeout.error_type(),
                        ?outcome,
                        "activity attempt timed out"
                    );
                }
                // A report raced the sweep
                Err(DispatchError::Store(StoreError::StaleAttempt { .. })) => {}
                Err(e) => error!(task_id = %task.id, error = %e, "failed to time out task"),
            }
        }
        Ok(swept)
    }

    /// Sweep expired attempts until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        info!(interval_ms = self.config.sweep_interval.as_millis() as u64, "task sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired().await {
                        error!(error = %e, "task sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("task sweeper exited");
    }

    async fn complete(
        &self,
        task: &TaskInfo,
        attempt: u32,
        value: serde_json::Value,
    ) -> Result<ReportOutcome, DispatchError> {
        let now = self.executor.now();
        let run_id = task.definition.run_id;
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: task.definition.activity_id.clone(),
            result: value,
            attempts: attempt,
        };
        let finished = FinishedTask {
            task_id: task.id,
            attempt: Some(attempt),
            status: TaskStatus::Completed,
        };

        if !self
            .resolve(task, AppendBatch::event(now, event).with_finished_task(finished))
            .await?
        {
            return Ok(ReportOutcome::Dropped);
        }
        debug!(task_id = %task.id, activity_id = %task.definition.activity_id, attempt, "activity completed");
        self.executor.process_workflow(run_id).await?;
        Ok(ReportOutcome::Completed)
    }

    async fn fail(
        &self,
        task: &TaskInfo,
        attempt: u32,
        error: ActivityError,
    ) -> Result<ReportOutcome, DispatchError> {
        let now = self.executor.now();
        let policy = &task.definition.options.retry_policy;

        let reason = match policy.decide(attempt, &error) {
            RetryDecision::GiveUp(reason) => reason,
            RetryDecision::Retry { delay } => {
                self.executor
                    .store
                    .retry_task(task.id, attempt, &error, add_duration(now, delay))
                    .await?;
                info!(
                    task_id = %task.id,
                    activity_id = %task.definition.activity_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "activity attempt failed, retrying"
                );
                return Ok(ReportOutcome::Retrying {
                    next_attempt: attempt + 1,
                    delay,
                });
            }
        };

        let run_id = task.definition.run_id;
        let event = WorkflowEvent::ActivityFailed {
            activity_id: task.definition.activity_id.clone(),
            error: error.clone(),
            attempts: attempt,
        };
        let finished = FinishedTask {
            task_id: task.id,
            attempt: Some(attempt),
            status: TaskStatus::Failed,
        };
        if !self
            .resolve(task, AppendBatch::event(now, event).with_finished_task(finished))
            .await?
        {
            return Ok(ReportOutcome::Dropped);
        }
        if error.is_cancelled() {
            info!(task_id = %task.id, activity_id = %task.definition.activity_id, attempt, "activity stopped after cancellation");
        } else {
            warn!(
                task_id = %task.id,
                activity_id = %task.definition.activity_id,
                attempt,
                reason = reason.as_str(),
                error = %error,
                "activity failed"
            );
        }
        self.executor.process_workflow(run_id).await?;
        Ok(ReportOutcome::Failed)
    }

    /// Append the resolution; `false` when the run already closed
    async fn resolve(&self, task: &TaskInfo, batch: AppendBatch) -> Result<bool, DispatchError> {
        match self
            .executor
            .append_with_retry(task.definition.run_id, move |_| batch.clone())
            .await
        {
            Ok(_) => Ok(true),
            Err(ExecutorError::Store(StoreError::ExecutionClosed { .. })) => {
                match self
                    .executor
                    .store
                    .finish_task(task.id, TaskStatus::Cancelled)
                    .await
                {
                    Ok(()) | Err(StoreError::TaskNotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                warn!(task_id = %task.id, run_id = %task.definition.run_id, "run closed, dropping activity result");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Stop the task of an activity the program cancelled
    ///
    /// A queued task is resolved right away with a cancellation failure; a
    /// running one is flagged and its worker sees the flag on the next
    /// heartbeat. Returns whether a resolution was appended.
    pub(super) async fn cancel_activity_task(
        &self,
        run_id: Uuid,
        activity_id: &str,
    ) -> Result<bool, ExecutorError> {
        match self
            .store
            .request_task_cancellation(run_id, activity_id)
            .await?
        {
            CancelOutcome::NotFound => Ok(false),
            CancelOutcome::Claimed { task_id } => {
                debug!(%run_id, %activity_id, %task_id, "asked running activity to stop");
                Ok(false)
            }
            CancelOutcome::Pending { task_id, attempt } => {
                let now = self.now();
                let batch = AppendBatch::event(
                    now,
                    WorkflowEvent::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        error: ActivityError::cancelled("activity cancelled by workflow"),
                        attempts: attempt,
                    },
                )
                .with_finished_task(FinishedTask {
                    task_id,
                    attempt: None,
                    status: TaskStatus::Cancelled,
                });

                match self.append_with_retry(run_id, move |_| batch.clone()).await {
                    Ok(_) => {
                        debug!(%run_id, %activity_id, "cancelled queued activity");
                        Ok(true)
                    }
                    Err(ExecutorError::Store(StoreError::ExecutionClosed { .. })) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[async_trait]
impl<S: WorkflowEventStore> WorkerTransport for TaskDispatcher<S> {
    async fn poll_tasks(
        &self,
        worker_id: &str,
        queues: &[String],
        max_tasks: usize,
    ) -> anyhow::Result<Vec<ClaimedTask>> {
        Ok(self.poll(worker_id, queues, max_tasks).await?)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        result: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.report_result(task_id, attempt, Ok(result)).await?;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        error: ActivityError,
    ) -> anyhow::Result<()> {
        self.report_result(task_id, attempt, Err(error)).await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        task_id: Uuid,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> anyhow::Result<HeartbeatResponse> {
        Ok(TaskDispatcher::heartbeat(self, task_id, attempt, details).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{InMemoryWorkflowEventStore, WorkflowStatus};
    use crate::reliability::RetryPolicy;
    use crate::workflow::{ActivityOptions, Workflow, WorkflowAction, WorkflowContext};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    /// Runs one activity with the retry policy given as input
    struct Single {
        max_attempts: u32,
        heartbeat: bool,
    }

    impl Workflow for Single {
        const TYPE: &'static str = "single";
        type Input = Value;
        type Output = Value;

        fn new(input: Self::Input) -> Self {
            Self {
                max_attempts: input["max_attempts"].as_u64().unwrap_or(3) as u32,
                heartbeat: input["heartbeat"].as_bool().unwrap_or(false),
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            let policy = RetryPolicy::fixed(Duration::from_secs(1), self.max_attempts);
            let mut options = ActivityOptions::default()
                .with_retry(policy)
                .with_start_to_close_timeout(Duration::from_secs(60));
            if self.heartbeat {
                options = options.with_heartbeat(Duration::from_secs(5));
            }
            vec![WorkflowAction::schedule_activity_with(
                "work",
                "do_work",
                json!({}),
                options,
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            result: Value,
        ) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(result)]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![WorkflowAction::fail(crate::workflow::WorkflowError::new(
                error.message.clone(),
            ))]
        }
    }

    fn setup() -> (
        Arc<ManualClock>,
        TaskDispatcher<InMemoryWorkflowEventStore>,
    ) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new())
            .with_clock(clock.clone());
        executor.register::<Single>();
        (clock, TaskDispatcher::new(Arc::new(executor)))
    }

    fn queues() -> Vec<String> {
        vec!["do_work".to_string()]
    }

    #[tokio::test]
    async fn test_success_resolves_task_once() {
        let (_clock, dispatcher) = setup();
        let executor = dispatcher.executor().clone();
        executor
            .start_workflow_by_type("w-1", Single::TYPE, json!({}))
            .await
            .unwrap();

        let tasks = dispatcher.poll("worker-a", &queues(), 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempt, 1);
        // Nothing else to claim while the attempt runs
        assert!(dispatcher.poll("worker-b", &queues(), 10).await.unwrap().is_empty());

        let outcome = dispatcher
            .report_result(tasks[0].id, 1, Ok(json!("done")))
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Completed);
        assert_eq!(
            executor.get_execution_status("w-1").await.unwrap(),
            WorkflowStatus::Completed
        );

        let duplicate = dispatcher
            .report_result(tasks[0].id, 1, Ok(json!("again")))
            .await
            .unwrap();
        assert_eq!(duplicate, ReportOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let (clock, dispatcher) = setup();
        let executor = dispatcher.executor().clone();
        executor
            .start_workflow_by_type("w-2", Single::TYPE, json!({"max_attempts": 2}))
            .await
            .unwrap();

        let task = dispatcher.poll("w", &queues(), 1).await.unwrap().remove(0);
        let outcome = dispatcher
            .report_result(task.id, 1, Err(ActivityError::retryable("flaky")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReportOutcome::Retrying {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );

        assert!(dispatcher.poll("w", &queues(), 1).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(1));
        let retry = dispatcher.poll("w", &queues(), 1).await.unwrap().remove(0);
        assert_eq!(retry.attempt, 2);

        // Report for the old attempt is stale
        let stale = dispatcher
            .report_result(task.id, 1, Ok(json!("late")))
            .await;
        assert!(matches!(
            stale,
            Err(DispatchError::Store(StoreError::StaleAttempt { .. }))
        ));

        let outcome = dispatcher
            .report_result(retry.id, 2, Err(ActivityError::retryable("still flaky")))
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Failed);
        assert_eq!(
            executor.get_execution_status("w-2").await.unwrap(),
            WorkflowStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let (_clock, dispatcher) = setup();
        let executor = dispatcher.executor().clone();
        executor
            .start_workflow_by_type("w-3", Single::TYPE, json!({"max_attempts": 5}))
            .await
            .unwrap();

        let task = dispatcher.poll("w", &queues(), 1).await.unwrap().remove(0);
        let outcome = dispatcher
            .report_result(task.id, 1, Err(ActivityError::non_retryable("card declined")))
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Failed);

        let history = executor.history("w-3").await.unwrap();
        assert!(history.iter().any(|e| matches!(
            &e.event,
            WorkflowEvent::ActivityFailed { attempts: 1, .. }
        )));
    }

    #[tokio::test]
    async fn test_missed_heartbeat_is_retried() {
        let (clock, dispatcher) = setup();
        let executor = dispatcher.executor().clone();
        executor
            .start_workflow_by_type("w-4", Single::TYPE, json!({"heartbeat": true}))
            .await
            .unwrap();

        let task = dispatcher.poll("w", &queues(), 1).await.unwrap().remove(0);
        let beat = dispatcher
            .heartbeat(task.id, 1, Some(json!({"progress": 10})))
            .await
            .unwrap();
        assert!(beat.accepted);
        assert!(!beat.should_cancel);

        clock.advance(Duration::from_secs(6));
        assert_eq!(dispatcher.sweep_expired().await.unwrap(), 1);

        clock.advance(Duration::from_secs(1));
        let retry = dispatcher.poll("w", &queues(), 1).await.unwrap().remove(0);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.heartbeat_details, Some(json!({"progress": 10})));

        // The first attempt's heartbeat is no longer accepted
        let late = dispatcher.heartbeat(task.id, 1, None).await.unwrap();
        assert!(!late.accepted);
    }

    #[tokio::test]
    async fn test_result_after_run_closed_is_ignored() {
        let (_clock, dispatcher) = setup();
        let executor = dispatcher.executor().clone();
        executor
            .start_workflow_by_type("w-5", Single::TYPE, json!({}))
            .await
            .unwrap();
        let task = dispatcher.poll("w", &queues(), 1).await.unwrap().remove(0);

        executor.request_cancellation("w-5", "stop").await.unwrap();
        let beat = dispatcher.heartbeat(task.id, 1, None).await.unwrap();
        assert!(beat.should_cancel);

        let outcome = dispatcher
            .report_result(task.id, 1, Ok(json!("too late")))
            .await
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Ignored);
    }
}
