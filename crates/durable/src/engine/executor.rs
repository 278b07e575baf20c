//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new runs
//! - Replaying runs from event history and committing the resulting intents
//!   as one atomic batch
//! - Post-commit effects: child runs, parent notification, successor runs,
//!   activity cancellation
//! - Recovering every running execution after a restart

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::compactor::successor_for;
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{self, Intent, ReplayError};
use crate::clock::{Clock, SystemClock};
use crate::config::{env_flag, env_millis, env_parse};
use crate::persistence::{
    AppendBatch, EventLog, ExecutionFilter, ExecutionInfo, NewExecution, RunClosure, StoreError,
    TaskDefinition, TimerDefinition, WorkflowEventStore, WorkflowStatus, DEFAULT_PAGE_SIZE,
};
use crate::workflow::{
    error_codes, ParentRef, RecordedEvent, Workflow, WorkflowError, WorkflowEvent,
};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per run (for safety)
    pub max_events_per_workflow: usize,

    /// Retries after a concurrency conflict before giving up
    pub max_append_retries: u32,

    /// How long `update` waits for the handler's outcome
    pub update_timeout: Duration,

    /// Events fetched per page when loading history
    pub history_page_size: usize,

    /// Drive the run immediately after a signal is appended
    pub process_on_signal: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
            max_append_retries: 5,
            update_timeout: Duration::from_secs(30),
            history_page_size: DEFAULT_PAGE_SIZE,
            process_on_signal: true,
        }
    }
}

impl ExecutorConfig {
    /// Create configuration from `DURABLE_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_events_per_workflow: env_parse("DURABLE_MAX_EVENTS")
                .unwrap_or(defaults.max_events_per_workflow),
            max_append_retries: env_parse("DURABLE_MAX_APPEND_RETRIES")
                .unwrap_or(defaults.max_append_retries),
            update_timeout: env_millis("DURABLE_UPDATE_TIMEOUT_MS")
                .unwrap_or(defaults.update_timeout),
            history_page_size: env_parse("DURABLE_HISTORY_PAGE_SIZE")
                .unwrap_or(defaults.history_page_size),
            process_on_signal: env_flag("DURABLE_PROCESS_ON_SIGNAL")
                .unwrap_or(defaults.process_on_signal),
        }
    }

    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events_per_workflow = max;
        self
    }

    pub fn with_max_append_retries(mut self, retries: u32) -> Self {
        self.max_append_retries = retries;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = size.max(1);
        self
    }

    pub fn with_process_on_signal(mut self, enabled: bool) -> Self {
        self.process_on_signal = enabled;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay could not start (missing registration, corrupt history head)
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The current run of the workflow is closed
    #[error("workflow {workflow_id} is not running ({status})")]
    NotRunning {
        workflow_id: String,
        status: WorkflowStatus,
    },

    /// Too many events
    #[error("run {run_id} has too many events ({count} > {max})")]
    TooManyEvents { run_id: Uuid, count: usize, max: usize },

    /// A read-only handler tried to record something
    #[error("usage error: {0}")]
    Usage(WorkflowError),

    /// Query handler returned an error
    #[error("query failed: {0}")]
    QueryFailed(WorkflowError),

    /// Update validator rejected the request
    #[error("update rejected: {0}")]
    UpdateRejected(WorkflowError),

    /// The run closed before the update completed
    #[error("update {update_id} aborted: run closed as {status}")]
    UpdateAborted {
        update_id: String,
        status: WorkflowStatus,
    },

    /// The update did not complete in time
    #[error("update {0} timed out")]
    UpdateTimeout(String),

    /// The workflow finished without a result
    #[error("workflow failed: {0}")]
    ExecutionFailed(WorkflowError),

    /// Concurrency conflicts persisted through every retry
    #[error("gave up appending to run {run_id} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted { run_id: Uuid, attempts: u32 },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of processing a run
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub run_id: Uuid,

    /// Status after processing
    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,

    /// Number of timers armed
    pub timers_started: usize,

    /// Number of child runs created
    pub children_started: usize,
}

impl ProcessResult {
    fn idle(run_id: Uuid, status: WorkflowStatus) -> Self {
        Self {
            run_id,
            status,
            events_written: 0,
            tasks_enqueued: 0,
            timers_started: 0,
            children_started: 0,
        }
    }

    /// Whether the run is closed
    pub fn completed(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Intents of one replay pass converted into store writes
struct Plan {
    batch: AppendBatch,
    successor: Option<NewExecution>,
    cancel_activities: Vec<String>,
    children: Vec<Uuid>,
}

/// Workflow executor
///
/// The executor drives workflow programs by replaying events and committing
/// the intents they produce. It uses optimistic concurrency control to handle
/// concurrent updates: a conflicting append is replanned from fresh history.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
/// executor.register::<MyWorkflow>();
///
/// // Start a new workflow
/// let run_id = executor.start_workflow::<MyWorkflow>("order-42", input).await?;
///
/// // Drive the run again (after activities complete)
/// executor.process_workflow(run_id).await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    pub(super) store: Arc<S>,
    pub(super) log: EventLog<S>,
    pub(super) registry: WorkflowRegistry,
    pub(super) config: ExecutorConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) update_waiters: DashMap<Uuid, Arc<Notify>>,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Create a new executor with the given store
    pub fn new(store: S) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(store: S, config: ExecutorConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Create an executor over a store shared with other components
    pub fn from_shared(store: Arc<S>, config: ExecutorConfig) -> Self {
        let log = EventLog::new(Arc::clone(&store)).with_page_size(config.history_page_size);
        Self {
            store,
            log,
            registry: WorkflowRegistry::new(),
            config,
            clock: Arc::new(SystemClock),
            update_waiters: DashMap::new(),
        }
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Starting and driving runs
    // =========================================================================

    /// Start a new workflow
    ///
    /// Creates the run with its `workflow_started` event and drives it until
    /// it blocks. Returns the run id.
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(
        &self,
        workflow_id: &str,
        input: W::Input,
    ) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(&input)?;
        self.start_workflow_by_type(workflow_id, W::TYPE, input).await
    }

    /// Start a workflow by registered type name
    #[instrument(skip(self, input))]
    pub async fn start_workflow_by_type(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, ExecutorError> {
        // Reject unknown types and malformed input before anything is written
        self.registry.create(workflow_type, input.clone())?;

        let execution = NewExecution::new(workflow_id, workflow_type, input, self.now());
        let run_id = execution.run_id;
        self.store.create_execution(execution).await?;
        info!(%workflow_id, %run_id, "started workflow");

        self.process_workflow(run_id).await?;
        Ok(run_id)
    }

    /// Drive a run after new events (activity results, timers, signals...)
    ///
    /// Replays the run from event 0, commits whatever new intents the program
    /// produced, and then drives every run affected by the commit (children,
    /// parent, successor).
    #[instrument(skip(self))]
    pub async fn process_workflow(&self, run_id: Uuid) -> Result<ProcessResult, ExecutorError> {
        let mut follow_ups = VecDeque::new();
        let result = self.drive(run_id, &mut follow_ups).await?;

        while let Some(next) = follow_ups.pop_front() {
            if let Err(e) = self.drive(next, &mut follow_ups).await {
                warn!(run_id = %next, error = %e, "follow-up processing failed, recovery will retry");
            }
        }
        Ok(result)
    }

    /// Drive every running execution
    ///
    /// Safe to call at any time: replay plus intent matching makes driving an
    /// up-to-date run a no-op. Also delivers outcomes of closed children
    /// whose parents never recorded them.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let running = self.store.list_executions(ExecutionFilter::running()).await?;
        let mut driven = 0;
        for run in &running {
            match self.process_workflow(run.run_id).await {
                Ok(_) => driven += 1,
                Err(e) => {
                    warn!(workflow_id = %run.workflow_id, run_id = %run.run_id, error = %e, "recovery failed for run")
                }
            }
        }

        let closed_children: Vec<ExecutionInfo> = self
            .store
            .list_executions(ExecutionFilter::default())
            .await?
            .into_iter()
            .filter(|info| info.parent.is_some() && info.status.is_terminal())
            .collect();
        for child in &closed_children {
            match self.notify_parent(child).await {
                Ok(Some(parent_run)) => {
                    if let Err(e) = self.process_workflow(parent_run).await {
                        warn!(run_id = %parent_run, error = %e, "recovery failed for parent run");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(workflow_id = %child.workflow_id, error = %e, "failed to notify parent"),
            }
        }

        info!(runs = driven, "recovery sweep finished");
        Ok(driven)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Current run of a workflow id
    pub async fn describe(&self, workflow_id: &str) -> Result<ExecutionInfo, ExecutorError> {
        match self.store.current_run(workflow_id).await {
            Ok(info) => Ok(info),
            Err(StoreError::WorkflowNotFound(id)) => Err(ExecutorError::WorkflowNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Status of the current run
    pub async fn get_execution_status(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, ExecutorError> {
        Ok(self.describe(workflow_id).await?.status)
    }

    /// Full history of the current run
    pub async fn history(&self, workflow_id: &str) -> Result<Vec<RecordedEvent>, ExecutorError> {
        let info = self.describe(workflow_id).await?;
        Ok(self.log.load(info.run_id).await?)
    }

    /// Typed result of the current run; `None` while it is running
    pub async fn get_result<W: Workflow>(
        &self,
        workflow_id: &str,
    ) -> Result<Option<W::Output>, ExecutorError> {
        let info = self.describe(workflow_id).await?;
        match info.status {
            WorkflowStatus::Running => Ok(None),
            WorkflowStatus::Completed => {
                let result = info.result.unwrap_or(serde_json::Value::Null);
                Ok(Some(serde_json::from_value(result)?))
            }
            status => Err(ExecutorError::ExecutionFailed(info.error.unwrap_or_else(|| {
                WorkflowError::new(format!("workflow {workflow_id} closed as {status}"))
            }))),
        }
    }

    /// List runs matching a filter
    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionInfo>, ExecutorError> {
        Ok(self.store.list_executions(filter).await?)
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// One replay-plan-commit cycle for a run, retried on conflicts
    async fn drive(
        &self,
        run_id: Uuid,
        follow_ups: &mut VecDeque<Uuid>,
    ) -> Result<ProcessResult, ExecutorError> {
        let attempts = self.config.max_append_retries + 1;
        for attempt in 1..=attempts {
            let info = self.store.get_execution(run_id).await?;
            if info.status.is_terminal() {
                debug!(%run_id, status = %info.status, "run already closed");
                if let Some(parent_run) = self.notify_parent(&info).await? {
                    follow_ups.push_back(parent_run);
                }
                return Ok(ProcessResult::idle(run_id, info.status));
            }

            let history = self.log.load(run_id).await?;
            if history.len() > self.config.max_events_per_workflow {
                return Err(ExecutorError::TooManyEvents {
                    run_id,
                    count: history.len(),
                    max: self.config.max_events_per_workflow,
                });
            }

            let outcome = match replay::replay(&self.registry, &info.workflow_id, run_id, &history) {
                Ok(outcome) => outcome,
                Err(err) => return self.fail_run(&info, err, follow_ups).await,
            };

            let now = self.now();
            let plan = self.plan(&info, outcome.intents, now).await?;
            let closing = plan.batch.closure.as_ref().map(RunClosure::status);
            let mut result = ProcessResult {
                run_id,
                status: closing.unwrap_or(WorkflowStatus::Running),
                events_written: plan.batch.events.len(),
                tasks_enqueued: plan.batch.tasks.len(),
                timers_started: plan.batch.timers.len(),
                children_started: plan.children.len(),
            };

            let expected = history.len() as u64;
            let committed = if plan.batch.is_empty() {
                Ok(())
            } else if let Some(successor) = plan.successor.clone() {
                self.store
                    .continue_as_new(run_id, expected, plan.batch, successor)
                    .await
            } else {
                self.store
                    .append_events(run_id, expected, plan.batch)
                    .await
                    .map(|_| ())
            };

            match committed {
                Ok(()) => {}
                Err(
                    e @ (StoreError::ConcurrencyConflict { .. }
                    | StoreError::AlreadyRunning { .. }
                    | StoreError::ExecutionClosed { .. }),
                ) => {
                    debug!(%run_id, attempt, error = %e, "append raced, replanning");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if result.events_written > 0 {
                debug!(
                    %run_id,
                    events = result.events_written,
                    tasks = result.tasks_enqueued,
                    timers = result.timers_started,
                    "committed intents"
                );
            }
            self.wake_update_waiters(run_id);

            for activity_id in &plan.cancel_activities {
                match self.cancel_activity_task(run_id, activity_id).await {
                    Ok(true) => follow_ups.push_back(run_id),
                    Ok(false) => {}
                    Err(e) => warn!(%run_id, %activity_id, error = %e, "failed to propagate activity cancellation"),
                }
            }
            follow_ups.extend(plan.children.iter().copied());

            if let Some(status) = closing {
                info!(workflow_id = %info.workflow_id, %run_id, %status, "run closed");
                self.update_waiters.remove(&run_id);
                let closed = self.store.get_execution(run_id).await?;
                if let Some(parent_run) = self.notify_parent(&closed).await? {
                    follow_ups.push_back(parent_run);
                }
                if let Some(successor) = closed.continued_to {
                    info!(workflow_id = %info.workflow_id, %successor, "continued as new");
                    follow_ups.push_back(successor);
                }
                result.status = closed.status;
            }
            return Ok(result);
        }

        Err(ExecutorError::ConflictRetriesExhausted { run_id, attempts })
    }

    /// Close a run whose history can no longer be replayed
    ///
    /// Nothing is appended: the history stays intact for an operator fix.
    async fn fail_run(
        &self,
        info: &ExecutionInfo,
        err: ReplayError,
        follow_ups: &mut VecDeque<Uuid>,
    ) -> Result<ProcessResult, ExecutorError> {
        let Some(error) = err.fatal_error() else {
            return Err(err.into());
        };
        error!(
            workflow_id = %info.workflow_id,
            run_id = %info.run_id,
            error = %error,
            "run failed during replay"
        );

        match self
            .store
            .fail_execution(info.run_id, error, self.now())
            .await
        {
            Ok(()) | Err(StoreError::ExecutionClosed { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.wake_update_waiters(info.run_id);
        self.update_waiters.remove(&info.run_id);

        let closed = self.store.get_execution(info.run_id).await?;
        if let Some(parent_run) = self.notify_parent(&closed).await? {
            follow_ups.push_back(parent_run);
        }
        Ok(ProcessResult::idle(info.run_id, closed.status))
    }

    /// Convert intents into one atomic batch
    ///
    /// Recording commands keep the order the program produced them in; engine
    /// generated resolutions follow them and the terminal event comes last.
    async fn plan(
        &self,
        info: &ExecutionInfo,
        intents: Vec<Intent>,
        now: DateTime<Utc>,
    ) -> Result<Plan, ExecutorError> {
        let run_id = info.run_id;
        let armed: BTreeSet<String> = if intents
            .iter()
            .any(|i| matches!(i, Intent::CancelTimer { .. }))
        {
            self.store
                .pending_timers(Some(run_id))
                .await?
                .into_iter()
                .map(|t| t.timer_id)
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut plan = Plan {
            batch: AppendBatch::new(now),
            successor: None,
            cancel_activities: Vec::new(),
            children: Vec::new(),
        };
        let mut resolutions = Vec::new();
        let mut terminal = None;

        for intent in intents {
            match intent {
                Intent::ScheduleActivity {
                    activity_id,
                    activity_type,
                    task_queue,
                    input,
                    options,
                } => {
                    plan.batch.tasks.push(TaskDefinition {
                        run_id,
                        workflow_id: info.workflow_id.clone(),
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_queue: task_queue.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    plan.batch.events.push(WorkflowEvent::ActivityScheduled {
                        activity_id,
                        activity_type,
                        task_queue,
                        input,
                        options,
                    });
                }
                Intent::StartTimer { timer_id, fire_at } => {
                    plan.batch.timers.push(TimerDefinition {
                        run_id,
                        workflow_id: info.workflow_id.clone(),
                        timer_id: timer_id.clone(),
                        fire_at,
                    });
                    plan.batch
                        .events
                        .push(WorkflowEvent::TimerStarted { timer_id, fire_at });
                }
                Intent::CancelTimer { timer_id } => {
                    if armed.contains(&timer_id) {
                        plan.batch.cancelled_timers.push(timer_id);
                    }
                }
                Intent::CancelActivity { activity_id } => plan.cancel_activities.push(activity_id),
                Intent::RecordMarker { marker } => {
                    plan.batch.events.push(WorkflowEvent::MarkerRecorded { marker })
                }
                Intent::ScheduleChild {
                    child_id,
                    workflow_type,
                    input,
                } => {
                    let child_workflow_id = format!("{}/{}", info.workflow_id, child_id);
                    match self.child_conflict(&child_workflow_id, &workflow_type).await? {
                        None => {
                            let mut execution = NewExecution::new(
                                child_workflow_id.clone(),
                                workflow_type.clone(),
                                input.clone(),
                                now,
                            );
                            execution.parent = Some(ParentRef {
                                workflow_id: info.workflow_id.clone(),
                                run_id,
                                child_id: child_id.clone(),
                            });
                            plan.batch.events.push(WorkflowEvent::ChildWorkflowScheduled {
                                child_id,
                                workflow_id: child_workflow_id,
                                run_id: execution.run_id,
                                workflow_type,
                                input,
                            });
                            plan.children.push(execution.run_id);
                            plan.batch.children.push(execution);
                        }
                        Some((existing_run, error)) => {
                            warn!(%run_id, %child_workflow_id, error = %error, "child workflow not started");
                            plan.batch.events.push(WorkflowEvent::ChildWorkflowScheduled {
                                child_id: child_id.clone(),
                                workflow_id: child_workflow_id,
                                run_id: existing_run,
                                workflow_type,
                                input,
                            });
                            resolutions.push(WorkflowEvent::ChildWorkflowFailed { child_id, error });
                        }
                    }
                }
                Intent::CompleteUpdate { update_id, outcome } => {
                    plan.batch
                        .events
                        .push(WorkflowEvent::UpdateCompleted { update_id, outcome });
                }
                Intent::Complete { result } => {
                    terminal = Some(WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    });
                    plan.batch.closure = Some(RunClosure::Completed { result });
                }
                Intent::Fail { error } => {
                    terminal = Some(WorkflowEvent::WorkflowFailed {
                        error: error.clone(),
                    });
                    plan.batch.closure = Some(RunClosure::Failed { error });
                }
                Intent::Cancel { reason } => {
                    terminal = Some(WorkflowEvent::WorkflowCancelled {
                        reason: reason.clone(),
                    });
                    plan.batch.closure = Some(RunClosure::Cancelled { reason });
                }
                Intent::ContinueAsNew { input } => {
                    let successor = successor_for(info, input.clone(), now);
                    terminal = Some(WorkflowEvent::WorkflowContinuedAsNew {
                        new_run_id: successor.run_id,
                        input,
                    });
                    plan.batch.closure = Some(RunClosure::ContinuedAsNew {
                        new_run_id: successor.run_id,
                    });
                    plan.successor = Some(successor);
                }
            }
        }

        plan.batch.events.extend(resolutions);
        plan.batch.events.extend(terminal);
        Ok(plan)
    }

    /// Why a child cannot be started, if it cannot
    ///
    /// Returns the run id to record (nil when no run exists) and the error the
    /// parent receives.
    async fn child_conflict(
        &self,
        child_workflow_id: &str,
        workflow_type: &str,
    ) -> Result<Option<(Uuid, WorkflowError)>, ExecutorError> {
        if !self.registry.contains(workflow_type) {
            return Ok(Some((
                Uuid::nil(),
                WorkflowError::new(format!("unknown workflow type: {workflow_type}"))
                    .with_code(error_codes::INVALID_INPUT),
            )));
        }

        match self.store.current_run(child_workflow_id).await {
            Ok(existing) if existing.status == WorkflowStatus::Running => Ok(Some((
                existing.run_id,
                WorkflowError::new(format!("workflow {child_workflow_id} is already running"))
                    .with_code(error_codes::CHILD_ALREADY_RUNNING),
            ))),
            Ok(_) | Err(StoreError::WorkflowNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a closed child's outcome in its parent
    ///
    /// Idempotent: does nothing when the parent already holds a resolution
    /// for this child. Returns the parent run when an event was appended.
    pub(super) async fn notify_parent(
        &self,
        child: &ExecutionInfo,
    ) -> Result<Option<Uuid>, ExecutorError> {
        let Some(parent) = &child.parent else {
            return Ok(None);
        };
        let resolution = match child.status {
            WorkflowStatus::Completed => WorkflowEvent::ChildWorkflowCompleted {
                child_id: parent.child_id.clone(),
                result: child.result.clone().unwrap_or(serde_json::Value::Null),
            },
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                WorkflowEvent::ChildWorkflowFailed {
                    child_id: parent.child_id.clone(),
                    error: child.error.clone().unwrap_or_else(|| {
                        WorkflowError::new(format!("child workflow {}", child.status))
                    }),
                }
            }
            // The successor run carries the parent reference forward
            WorkflowStatus::Running | WorkflowStatus::ContinuedAsNew => return Ok(None),
        };

        let attempts = self.config.max_append_retries + 1;
        for _ in 0..attempts {
            let parent_info = match self.store.get_execution(parent.run_id).await {
                Ok(info) => info,
                Err(StoreError::RunNotFound(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if parent_info.status.is_terminal() {
                debug!(parent_run = %parent.run_id, child_id = %parent.child_id, "parent closed, dropping child outcome");
                return Ok(None);
            }

            let history = self.log.load(parent.run_id).await?;
            if child_resolved(&history, &parent.child_id) {
                return Ok(None);
            }

            let batch = AppendBatch::event(self.now(), resolution.clone());
            match self
                .store
                .append_events(parent.run_id, history.len() as u64, batch)
                .await
            {
                Ok(_) => {
                    debug!(parent_run = %parent.run_id, child_id = %parent.child_id, "recorded child outcome");
                    self.wake_update_waiters(parent.run_id);
                    return Ok(Some(parent.run_id));
                }
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                Err(StoreError::ExecutionClosed { .. }) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted {
            run_id: parent.run_id,
            attempts,
        })
    }

    /// Append to a running run, rebuilding the batch after each conflict
    ///
    /// Returns the new event count. A closed run yields
    /// [`StoreError::ExecutionClosed`].
    pub(crate) async fn append_with_retry<F>(
        &self,
        run_id: Uuid,
        mut build: F,
    ) -> Result<u64, ExecutorError>
    where
        F: FnMut(&ExecutionInfo) -> AppendBatch + Send,
    {
        let attempts = self.config.max_append_retries + 1;
        for attempt in 1..=attempts {
            let info = self.store.get_execution(run_id).await?;
            if info.status.is_terminal() {
                return Err(StoreError::ExecutionClosed {
                    run_id,
                    status: info.status,
                }
                .into());
            }

            let batch = build(&info);
            match self.store.append_events(run_id, info.event_count, batch).await {
                Ok(count) => {
                    self.wake_update_waiters(run_id);
                    return Ok(count);
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    debug!(%run_id, attempt, expected, actual, "append conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::ConflictRetriesExhausted { run_id, attempts })
    }

    pub(super) fn wake_update_waiters(&self, run_id: Uuid) {
        if let Some(notify) = self.update_waiters.get(&run_id) {
            notify.notify_waiters();
        }
    }
}

/// Whether the latest scheduling of `child_id` already has an outcome
fn child_resolved(history: &[RecordedEvent], child_id: &str) -> bool {
    let Some(scheduled_at) = history.iter().rposition(|e| {
        matches!(&e.event, WorkflowEvent::ChildWorkflowScheduled { child_id: c, .. } if c == child_id)
    }) else {
        return true;
    };
    history[scheduled_at..].iter().any(|e| {
        matches!(
            &e.event,
            WorkflowEvent::ChildWorkflowCompleted { child_id: c, .. }
                | WorkflowEvent::ChildWorkflowFailed { child_id: c, .. }
                if c == child_id
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::workflow::{WorkflowAction, WorkflowContext};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EchoInput {
        message: String,
    }

    /// Completes immediately with its input
    struct Echo {
        input: EchoInput,
    }

    impl Workflow for Echo {
        const TYPE: &'static str = "echo";
        type Input = EchoInput;
        type Output = EchoInput;

        fn new(input: Self::Input) -> Self {
            Self { input }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete_with(&self.input)]
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
    }

    /// Starts an echo child and completes with its result
    struct Parent;

    impl Workflow for Parent {
        const TYPE: &'static str = "parent";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::child(
                "greeter",
                Echo::TYPE,
                json!({"message": "hi"}),
            )]
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

        fn on_child_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _child_id: &str,
            result: Value,
        ) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(result)]
        }
    }

    static TAKE_OTHER_BRANCH: AtomicBool = AtomicBool::new(false);

    /// Arms a different timer depending on a flag flipped between runs
    struct Drifting;

    impl Workflow for Drifting {
        const TYPE: &'static str = "drifting";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            let timer_id = if TAKE_OTHER_BRANCH.load(Ordering::SeqCst) {
                "b"
            } else {
                "a"
            };
            vec![WorkflowAction::timer(timer_id, Duration::from_secs(60))]
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
    }

    /// Waits on a long timer
    struct Sleeper;

    impl Workflow for Sleeper {
        const TYPE: &'static str = "sleeper";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::timer("nap", Duration::from_secs(3600))]
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
    }

    /// Waits on a sleeping child
    struct Supervisor;

    impl Workflow for Supervisor {
        const TYPE: &'static str = "supervisor";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::child("nap", Sleeper::TYPE, json!({}))]
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
    }

    fn executor() -> WorkflowExecutor<InMemoryWorkflowEventStore> {
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        executor.register::<Echo>();
        executor.register::<Parent>();
        executor.register::<Drifting>();
        executor.register::<Sleeper>();
        executor
    }

    #[tokio::test]
    async fn test_start_completes_immediately() {
        let executor = executor();
        let input = EchoInput {
            message: "hello".to_string(),
        };

        let run_id = executor
            .start_workflow::<Echo>("echo-1", input)
            .await
            .expect("should start");

        let info = executor.store().get_execution(run_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.event_count, 2);

        let output = executor.get_result::<Echo>("echo-1").await.unwrap().unwrap();
        assert_eq!(output.message, "hello");
    }

    #[tokio::test]
    async fn test_start_rejects_bad_input_without_writing() {
        let executor = executor();
        let result = executor
            .start_workflow_by_type("echo-1", Echo::TYPE, json!({"wrong": 1}))
            .await;

        assert!(matches!(
            result,
            Err(ExecutorError::Registry(RegistryError::Deserialization(_)))
        ));
        assert_eq!(executor.store().run_count(), 0);

        let result = executor
            .start_workflow_by_type("x", "not_registered", json!({}))
            .await;
        assert!(matches!(
            result,
            Err(ExecutorError::Registry(RegistryError::UnknownWorkflowType(_)))
        ));
    }

    #[tokio::test]
    async fn test_child_outcome_reaches_parent() {
        let executor = executor();
        let run_id = executor
            .start_workflow::<Parent>("order-1", json!({}))
            .await
            .unwrap();

        let parent = executor.store().get_execution(run_id).await.unwrap();
        assert_eq!(parent.status, WorkflowStatus::Completed);
        assert_eq!(parent.result, Some(json!({"message": "hi"})));

        let child = executor.describe("order-1/greeter").await.unwrap();
        assert_eq!(child.status, WorkflowStatus::Completed);
        assert_eq!(child.parent.unwrap().run_id, run_id);

        let kinds: Vec<&str> = executor
            .history("order-1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "workflow_started",
                "child_workflow_scheduled",
                "child_workflow_completed",
                "workflow_completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_child_already_running_fails_in_parent() {
        let executor = executor();
        // Occupy the child's workflow id with a run that never finishes
        executor
            .start_workflow_by_type("order-2/greeter", Sleeper::TYPE, json!({}))
            .await
            .unwrap();

        executor
            .start_workflow::<Parent>("order-2", json!({}))
            .await
            .unwrap();

        let parent = executor.describe("order-2").await.unwrap();
        assert_eq!(parent.status, WorkflowStatus::Failed);
        assert!(parent
            .error
            .unwrap()
            .has_code(error_codes::CHILD_ALREADY_RUNNING));
    }

    #[tokio::test]
    async fn test_non_determinism_fails_run_without_appending() {
        let executor = executor();
        TAKE_OTHER_BRANCH.store(false, Ordering::SeqCst);
        let run_id = executor
            .start_workflow_by_type("drift-1", Drifting::TYPE, json!({}))
            .await
            .unwrap();
        let before = executor.store().get_execution(run_id).await.unwrap();
        assert_eq!(before.event_count, 2);

        // Deploy "new code"
        TAKE_OTHER_BRANCH.store(true, Ordering::SeqCst);
        let result = executor.process_workflow(run_id).await.unwrap();
        TAKE_OTHER_BRANCH.store(false, Ordering::SeqCst);

        assert_eq!(result.status, WorkflowStatus::Failed);
        let after = executor.store().get_execution(run_id).await.unwrap();
        assert_eq!(after.event_count, 2);
        assert!(after.error.unwrap().has_code(error_codes::NON_DETERMINISTIC));
    }

    #[tokio::test]
    async fn test_history_guard() {
        let store = InMemoryWorkflowEventStore::new();
        let mut executor =
            WorkflowExecutor::with_config(store, ExecutorConfig::default().with_max_events(1));
        executor.register::<Sleeper>();

        let result = executor
            .start_workflow_by_type("sleep-1", Sleeper::TYPE, json!({}))
            .await;
        // The first pass commits the timer; the next pass sees two events
        assert!(result.is_ok());
        let run = executor.describe("sleep-1").await.unwrap();
        let result = executor.process_workflow(run.run_id).await;
        assert!(matches!(result, Err(ExecutorError::TooManyEvents { count: 2, .. })));
    }

    #[tokio::test]
    async fn test_processing_is_idempotent_and_recover_is_safe() {
        let executor = executor();
        let run_id = executor
            .start_workflow_by_type("sleep-2", Sleeper::TYPE, json!({}))
            .await
            .unwrap();

        let again = executor.process_workflow(run_id).await.unwrap();
        assert_eq!(again.events_written, 0);
        assert_eq!(again.status, WorkflowStatus::Running);

        let driven = executor.recover().await.unwrap();
        assert!(driven >= 1);
        assert_eq!(
            executor.store().get_execution(run_id).await.unwrap().event_count,
            2
        );
    }

    #[tokio::test]
    async fn test_recover_keeps_going_when_a_parent_fails() {
        let store = InMemoryWorkflowEventStore::new();
        let mut executor =
            WorkflowExecutor::with_config(store, ExecutorConfig::default().with_max_events(3));
        executor.register::<Supervisor>();
        executor.register::<Sleeper>();

        executor
            .start_workflow_by_type("sup-a", Supervisor::TYPE, json!({}))
            .await
            .unwrap();
        executor
            .start_workflow_by_type("sup-b", Supervisor::TYPE, json!({}))
            .await
            .unwrap();
        // One more event puts sup-a over the limit once its child outcome lands
        executor.signal("sup-a", "poke", json!({})).await.unwrap();

        // Children die without their parents hearing about it
        for child in ["sup-a/nap", "sup-b/nap"] {
            let info = executor.describe(child).await.unwrap();
            executor
                .store()
                .fail_execution(info.run_id, WorkflowError::new("worker lost"), executor.now())
                .await
                .unwrap();
        }

        let driven = executor.recover().await.unwrap();
        assert_eq!(driven, 2);

        let a = executor.describe("sup-a").await.unwrap();
        assert_eq!(a.status, WorkflowStatus::Running);
        assert_eq!(a.event_count, 4);

        let b = executor.describe("sup-b").await.unwrap();
        assert_eq!(b.status, WorkflowStatus::Failed);
        assert_eq!(b.error.unwrap().message, "worker lost");
    }

    #[tokio::test]
    async fn test_unknown_workflow_lookup() {
        let executor = executor();
        assert!(matches!(
            executor.describe("missing").await,
            Err(ExecutorError::WorkflowNotFound(_))
        ));
    }
}
