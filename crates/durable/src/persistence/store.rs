//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, ParentRef, RecordedEvent, WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No execution with this workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No run with this run id
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The workflow id already has a running run
    #[error("workflow {workflow_id} is already running as run {run_id}")]
    AlreadyRunning { workflow_id: String, run_id: Uuid },

    /// The run has a terminal status and accepts no more events
    #[error("run {run_id} is closed ({status})")]
    ExecutionClosed { run_id: Uuid, status: WorkflowStatus },

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// A report referenced an attempt that is no longer current
    #[error("stale attempt for task {task_id}: expected {expected}, got {actual}")]
    StaleAttempt {
        task_id: Uuid,
        expected: u32,
        actual: u32,
    },

    /// Timer not armed (already fired or cancelled)
    #[error("timer not armed: {run_id}/{timer_id}")]
    TimerNotFound { run_id: Uuid, timer_id: String },

    /// Another timer manager holds a live lease on the timer
    #[error("timer {run_id}/{timer_id} is leased by {owner}")]
    TimerLeased {
        run_id: Uuid,
        timer_id: String,
        owner: String,
    },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Storage backend unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::Unavailable(_)
        )
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Run is active
    Running,

    /// Run completed successfully
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,

    /// Run was retired by continue-as-new
    ContinuedAsNew,
}

impl WorkflowStatus {
    /// Check if the run is closed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ContinuedAsNew => write!(f, "continued_as_new"),
        }
    }
}

// =============================================================================
// Executions
// =============================================================================

/// Request to create a run (and its `workflow_started` event)
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub parent: Option<ParentRef>,
    pub continued_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl NewExecution {
    /// New top-level run with a fresh run id
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: Uuid::now_v7(),
            workflow_type: workflow_type.into(),
            input,
            parent: None,
            continued_from: None,
            created_at,
        }
    }

    /// The first event of the run
    pub fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            input: self.input.clone(),
            parent: self.parent.clone(),
            continued_from: self.continued_from,
        }
    }
}

/// Run information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub parent: Option<ParentRef>,
    pub continued_from: Option<Uuid>,
    pub continued_to: Option<Uuid>,
    /// Number of events in the log (next sequence number)
    pub event_count: u64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Filter for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<String>,
    /// Only the latest run of each workflow id
    pub current_only: bool,
}

impl ExecutionFilter {
    /// Runs that still need driving
    pub fn running() -> Self {
        Self {
            status: Some(WorkflowStatus::Running),
            ..Self::default()
        }
    }

    pub fn matches(&self, info: &ExecutionInfo) -> bool {
        self.status.map_or(true, |s| s == info.status)
            && self
                .workflow_type
                .as_deref()
                .map_or(true, |t| t == info.workflow_type)
    }
}

/// Terminal status change committed with the terminal event
#[derive(Debug, Clone, PartialEq)]
pub enum RunClosure {
    Completed { result: serde_json::Value },
    Failed { error: WorkflowError },
    Cancelled { reason: String },
    ContinuedAsNew { new_run_id: Uuid },
}

impl RunClosure {
    pub fn status(&self) -> WorkflowStatus {
        match self {
            RunClosure::Completed { .. } => WorkflowStatus::Completed,
            RunClosure::Failed { .. } => WorkflowStatus::Failed,
            RunClosure::Cancelled { .. } => WorkflowStatus::Cancelled,
            RunClosure::ContinuedAsNew { .. } => WorkflowStatus::ContinuedAsNew,
        }
    }
}

// =============================================================================
// Tasks and timers
// =============================================================================

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    /// Attempt number of this claim (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
    /// Details of the last heartbeat from a previous attempt
    pub heartbeat_details: Option<serde_json::Value>,
}

/// Task state as seen by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: Uuid,
    pub definition: TaskDefinition,
    pub status: TaskStatus,
    /// Attempts started so far (0 until the first claim)
    pub attempt: u32,
    pub available_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub should_cancel: bool,
    pub last_error: Option<ActivityError>,
}

/// Task whose claimed attempt missed a deadline
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredTask {
    pub task: ClaimedTask,
    pub timeout: crate::workflow::TimeoutType,
}

/// Finish a task atomically with the event that resolves it
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTask {
    pub task_id: Uuid,
    /// `Some` requires the task to be claimed with this attempt
    pub attempt: Option<u32>,
    pub status: TaskStatus,
}

/// Response from heartbeat operation
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted
    pub accepted: bool,

    /// Whether cancellation was requested
    pub should_cancel: bool,
}

/// Result of asking a task to stop
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// No unfinished task for this activity
    NotFound,
    /// Task was waiting in the queue; the caller resolves it
    Pending { task_id: Uuid, attempt: u32 },
    /// Task is running; the worker sees `should_cancel` on its next heartbeat
    Claimed { task_id: Uuid },
}

/// Armed timer
#[derive(Debug, Clone, PartialEq)]
pub struct TimerDefinition {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

// =============================================================================
// Append batch
// =============================================================================

/// Events plus the side-index changes that commit with them
///
/// Either the whole batch becomes visible or none of it does.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendBatch {
    pub recorded_at: DateTime<Utc>,
    pub events: Vec<WorkflowEvent>,
    pub tasks: Vec<TaskDefinition>,
    pub finished_tasks: Vec<FinishedTask>,
    pub timers: Vec<TimerDefinition>,
    pub cancelled_timers: Vec<String>,
    /// Timers resolved by this batch; each must still be armed
    pub fired_timers: Vec<String>,
    pub children: Vec<NewExecution>,
    pub closure: Option<RunClosure>,
}

impl AppendBatch {
    pub fn new(recorded_at: DateTime<Utc>) -> Self {
        Self {
            recorded_at,
            events: Vec::new(),
            tasks: Vec::new(),
            finished_tasks: Vec::new(),
            timers: Vec::new(),
            cancelled_timers: Vec::new(),
            fired_timers: Vec::new(),
            children: Vec::new(),
            closure: None,
        }
    }

    /// Batch with a single event
    pub fn event(recorded_at: DateTime<Utc>, event: WorkflowEvent) -> Self {
        let mut batch = Self::new(recorded_at);
        batch.events.push(event);
        batch
    }

    pub fn with_finished_task(mut self, finished: FinishedTask) -> Self {
        self.finished_tasks.push(finished);
        self
    }

    pub fn with_fired_timer(mut self, timer_id: impl Into<String>) -> Self {
        self.fired_timers.push(timer_id.into());
        self
    }

    /// Nothing to write
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.tasks.is_empty()
            && self.finished_tasks.is_empty()
            && self.timers.is_empty()
            && self.cancelled_timers.is_empty()
            && self.fired_timers.is_empty()
            && self.children.is_empty()
            && self.closure.is_none()
    }
}

/// Store for workflow runs, their event logs and the task/timer side indexes
///
/// Implementations must be thread-safe and make every method that takes an
/// [`AppendBatch`] atomic. Event sequence numbers start at 0 per run.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Execution Operations
    // =========================================================================

    /// Create a run together with its `workflow_started` event
    ///
    /// Fails with [`StoreError::AlreadyRunning`] if the workflow id has a
    /// running run.
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError>;

    /// Get a run
    async fn get_execution(&self, run_id: Uuid) -> Result<ExecutionInfo, StoreError>;

    /// Latest run of a workflow id
    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionInfo, StoreError>;

    /// All run ids of a workflow id, oldest first
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Uuid>, StoreError>;

    /// List runs matching a filter
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionInfo>, StoreError>;

    /// Close a run as failed without appending an event
    ///
    /// Used for fatal engine-detected errors (non-determinism) where the
    /// history must be left untouched.
    async fn fail_execution(
        &self,
        run_id: Uuid,
        error: WorkflowError,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Append a batch (with optimistic concurrency)
    ///
    /// `expected_sequence` must equal the current number of events.
    /// Returns the new number of events.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        batch: AppendBatch,
    ) -> Result<u64, StoreError>;

    /// Load up to `limit` events starting at sequence `from`
    async fn load_events(
        &self,
        run_id: Uuid,
        from: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Close `run_id` with `batch` and create `successor` under the same
    /// workflow id, atomically
    async fn continue_as_new(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        batch: AppendBatch,
        successor: NewExecution,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Claim available tasks from the given queues
    ///
    /// Highest priority first, then oldest first.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        queues: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Get a task
    ///
    /// Tasks are dropped when their run closes; a dropped task reads as
    /// [`StoreError::TaskNotFound`].
    async fn get_task(&self, task_id: Uuid) -> Result<TaskInfo, StoreError>;

    /// All tasks of a running run
    async fn tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskInfo>, StoreError>;

    /// Record task heartbeat and extend its heartbeat deadline
    ///
    /// A heartbeat for a stale attempt or a dropped task is not accepted and
    /// answers `should_cancel`.
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Put a claimed attempt back in the queue
    async fn retry_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        error: &ActivityError,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark a task finished without an event (its run is closed)
    async fn finish_task(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

    /// Ask the task of an activity to stop
    async fn request_task_cancellation(
        &self,
        run_id: Uuid,
        activity_id: &str,
    ) -> Result<CancelOutcome, StoreError>;

    /// Claimed tasks past their heartbeat or start-to-close deadline
    async fn expired_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Lease due timers
    ///
    /// A timer is due when `fire_at <= now` and it has no live lease. A lease
    /// left behind by a crashed process expires after `lease` and the timer
    /// becomes claimable again.
    async fn claim_due_timers(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<TimerDefinition>, StoreError>;

    /// Remove a timer without firing it
    ///
    /// Fails with [`StoreError::TimerLeased`] while another owner's lease is
    /// live. Removing a timer that is no longer armed is a no-op.
    async fn complete_timer(
        &self,
        run_id: Uuid,
        timer_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Armed timers, optionally for one run
    async fn pending_timers(&self, run_id: Option<Uuid>)
        -> Result<Vec<TimerDefinition>, StoreError>;
}
