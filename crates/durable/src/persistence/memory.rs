//! In-memory implementation of WorkflowEventStore

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::clock::add_duration;
use crate::workflow::{error_codes, RecordedEvent, TimeoutType, WorkflowError};

struct RunState {
    info: ExecutionInfo,
    events: Vec<RecordedEvent>,
}

struct TaskState {
    id: Uuid,
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    available_at: DateTime<Utc>,
    enqueued_seq: u64,
    worker_id: Option<String>,
    heartbeat_deadline: Option<DateTime<Utc>>,
    close_deadline: Option<DateTime<Utc>>,
    should_cancel: bool,
    last_error: Option<ActivityError>,
    heartbeat_details: Option<serde_json::Value>,
}

impl TaskState {
    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            definition: self.definition.clone(),
            status: self.status,
            attempt: self.attempt,
            available_at: self.available_at,
            worker_id: self.worker_id.clone(),
            should_cancel: self.should_cancel,
            last_error: self.last_error.clone(),
        }
    }

    fn claimed(&self) -> ClaimedTask {
        ClaimedTask {
            id: self.id,
            run_id: self.definition.run_id,
            workflow_id: self.definition.workflow_id.clone(),
            activity_id: self.definition.activity_id.clone(),
            activity_type: self.definition.activity_type.clone(),
            task_queue: self.definition.task_queue.clone(),
            input: self.definition.input.clone(),
            options: self.definition.options.clone(),
            attempt: self.attempt,
            max_attempts: self.definition.options.retry_policy.max_attempts,
            heartbeat_details: self.heartbeat_details.clone(),
        }
    }

    fn release(&mut self, status: TaskStatus) {
        self.status = status;
        self.worker_id = None;
        self.heartbeat_deadline = None;
        self.close_deadline = None;
    }
}

struct TimerState {
    definition: TimerDefinition,
    lease: Option<TimerLease>,
}

struct TimerLease {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl TimerState {
    /// Owner of a lease that has not lapsed at `now`
    fn live_owner(&self, now: DateTime<Utc>) -> Option<&str> {
        self.lease
            .as_ref()
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.as_str())
    }
}

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunState>,
    workflows: HashMap<String, Vec<Uuid>>,
    tasks: HashMap<Uuid, TaskState>,
    timers: BTreeMap<(Uuid, String), TimerState>,
    next_task_seq: u64,
}

impl Inner {
    fn run(&self, run_id: Uuid) -> Result<&RunState, StoreError> {
        self.runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))
    }

    fn current_run_id(&self, workflow_id: &str) -> Option<Uuid> {
        self.workflows.get(workflow_id).and_then(|runs| runs.last().copied())
    }

    // =========================================================================
    // Validation (no mutation)
    // =========================================================================

    fn validate_new_run(&self, execution: &NewExecution, closing: Option<Uuid>) -> Result<(), StoreError> {
        if let Some(current) = self.current_run_id(&execution.workflow_id) {
            let running = self
                .runs
                .get(&current)
                .is_some_and(|r| r.info.status == WorkflowStatus::Running);
            if running && Some(current) != closing {
                return Err(StoreError::AlreadyRunning {
                    workflow_id: execution.workflow_id.clone(),
                    run_id: current,
                });
            }
        }
        Ok(())
    }

    fn validate_append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        batch: &AppendBatch,
    ) -> Result<(), StoreError> {
        let run = self.run(run_id)?;
        if run.info.status.is_terminal() {
            return Err(StoreError::ExecutionClosed {
                run_id,
                status: run.info.status,
            });
        }
        let actual = run.events.len() as u64;
        if expected_sequence != actual {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual,
            });
        }

        for finished in &batch.finished_tasks {
            let task = self
                .tasks
                .get(&finished.task_id)
                .ok_or(StoreError::TaskNotFound(finished.task_id))?;
            let current = match finished.attempt {
                Some(attempt) => task.status == TaskStatus::Claimed && task.attempt == attempt,
                None => !task.status.is_finished(),
            };
            if !current {
                return Err(StoreError::StaleAttempt {
                    task_id: finished.task_id,
                    expected: task.attempt,
                    actual: finished.attempt.unwrap_or(task.attempt),
                });
            }
        }

        for timer_id in &batch.fired_timers {
            if !self.timers.contains_key(&(run_id, timer_id.clone())) {
                return Err(StoreError::TimerNotFound {
                    run_id,
                    timer_id: timer_id.clone(),
                });
            }
        }

        for child in &batch.children {
            self.validate_new_run(child, None)?;
        }
        Ok(())
    }

    // =========================================================================
    // Mutation (after validation)
    // =========================================================================

    fn insert_run(&mut self, execution: NewExecution) {
        let started = RecordedEvent {
            sequence: 0,
            recorded_at: execution.created_at,
            event: execution.started_event(),
        };
        let info = ExecutionInfo {
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id,
            workflow_type: execution.workflow_type,
            status: WorkflowStatus::Running,
            input: execution.input,
            result: None,
            error: None,
            parent: execution.parent,
            continued_from: execution.continued_from,
            continued_to: None,
            event_count: 1,
            created_at: execution.created_at,
            closed_at: None,
        };
        self.workflows
            .entry(execution.workflow_id)
            .or_default()
            .push(execution.run_id);
        self.runs.insert(
            execution.run_id,
            RunState {
                info,
                events: vec![started],
            },
        );
    }

    fn apply_append(&mut self, run_id: Uuid, batch: AppendBatch) -> u64 {
        let AppendBatch {
            recorded_at,
            events,
            tasks,
            finished_tasks,
            timers,
            cancelled_timers,
            fired_timers,
            children,
            closure,
        } = batch;

        let count = match self.runs.get_mut(&run_id) {
            Some(run) => {
                for event in events {
                    let sequence = run.events.len() as u64;
                    run.events.push(RecordedEvent {
                        sequence,
                        recorded_at,
                        event,
                    });
                }
                run.info.event_count = run.events.len() as u64;
                run.info.event_count
            }
            None => 0,
        };

        for definition in tasks {
            let id = Uuid::now_v7();
            self.next_task_seq += 1;
            self.tasks.insert(
                id,
                TaskState {
                    id,
                    definition,
                    status: TaskStatus::Pending,
                    attempt: 0,
                    available_at: recorded_at,
                    enqueued_seq: self.next_task_seq,
                    worker_id: None,
                    heartbeat_deadline: None,
                    close_deadline: None,
                    should_cancel: false,
                    last_error: None,
                    heartbeat_details: None,
                },
            );
        }

        for finished in finished_tasks {
            if let Some(task) = self.tasks.get_mut(&finished.task_id) {
                task.release(finished.status);
            }
        }

        for timer in timers {
            self.timers.insert(
                (run_id, timer.timer_id.clone()),
                TimerState {
                    definition: timer,
                    lease: None,
                },
            );
        }
        for timer_id in cancelled_timers.into_iter().chain(fired_timers) {
            self.timers.remove(&(run_id, timer_id));
        }

        for child in children {
            self.insert_run(child);
        }

        if let Some(closure) = closure {
            self.close_run(run_id, closure, recorded_at);
        }
        count
    }

    fn close_run(&mut self, run_id: Uuid, closure: RunClosure, now: DateTime<Utc>) {
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.info.status = closure.status();
            run.info.closed_at = Some(now);
            match closure {
                RunClosure::Completed { result } => run.info.result = Some(result),
                RunClosure::Failed { error } => run.info.error = Some(error),
                RunClosure::Cancelled { reason } => {
                    run.info.error =
                        Some(WorkflowError::new(reason).with_code(error_codes::CANCELLED))
                }
                RunClosure::ContinuedAsNew { new_run_id } => {
                    run.info.continued_to = Some(new_run_id)
                }
            }
        }

        // A closed run resolves nothing more; workers still holding one of
        // its tasks learn it from a rejected heartbeat
        self.timers.retain(|(timer_run, _), _| *timer_run != run_id);
        self.tasks.retain(|_, task| task.definition.run_id != run_id);
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// Every mutating call takes a single write lock, so each batch is applied
/// atomically. Suitable for tests, simulations and single-process embedding.
///
/// # Example
///
/// ```
/// use ledgerflow_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Make every call fail with [`StoreError::Unavailable`] (for testing)
    pub fn simulate_outage(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        inner.validate_new_run(&execution, None)?;
        inner.insert_run(execution);
        Ok(())
    }

    async fn get_execution(&self, run_id: Uuid) -> Result<ExecutionInfo, StoreError> {
        self.check_available()?;
        Ok(self.inner.read().run(run_id)?.info.clone())
    }

    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionInfo, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let run_id = inner
            .current_run_id(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(inner.run(run_id)?.info.clone())
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Uuid>, StoreError> {
        self.check_available()?;
        self.inner
            .read()
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionInfo>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut result: Vec<ExecutionInfo> = inner
            .runs
            .values()
            .filter(|run| filter.matches(&run.info))
            .filter(|run| {
                !filter.current_only
                    || inner.current_run_id(&run.info.workflow_id) == Some(run.info.run_id)
            })
            .map(|run| run.info.clone())
            .collect();
        result.sort_by(|a, b| (a.created_at, a.run_id).cmp(&(b.created_at, b.run_id)));
        Ok(result)
    }

    async fn fail_execution(
        &self,
        run_id: Uuid,
        error: WorkflowError,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let status = inner.run(run_id)?.info.status;
        if status.is_terminal() {
            return Err(StoreError::ExecutionClosed { run_id, status });
        }
        inner.close_run(run_id, RunClosure::Failed { error }, now);
        Ok(())
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        batch: AppendBatch,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        inner.validate_append(run_id, expected_sequence, &batch)?;
        Ok(inner.apply_append(run_id, batch))
    }

    async fn load_events(
        &self,
        run_id: Uuid,
        from: u64,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let run = inner.run(run_id)?;
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(run.events.len());
        Ok(run.events[start..].iter().take(limit).cloned().collect())
    }

    async fn continue_as_new(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        batch: AppendBatch,
        successor: NewExecution,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        inner.validate_append(run_id, expected_sequence, &batch)?;
        let workflow_id = inner.run(run_id)?.info.workflow_id.clone();
        if successor.workflow_id != workflow_id {
            return Err(StoreError::WorkflowNotFound(successor.workflow_id));
        }
        inner.validate_new_run(&successor, Some(run_id))?;

        let mut batch = batch;
        batch.closure = Some(RunClosure::ContinuedAsNew {
            new_run_id: successor.run_id,
        });
        inner.apply_append(run_id, batch);
        inner.insert_run(successor);
        Ok(())
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        queues: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();

        let mut candidates: Vec<(i32, u64, Uuid)> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.available_at <= now
                    && queues.iter().any(|q| *q == t.definition.task_queue)
            })
            .map(|t| (t.definition.options.priority, t.enqueued_seq, t.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut claimed = Vec::new();
        for (_, _, id) in candidates.into_iter().take(max_tasks) {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.status = TaskStatus::Claimed;
                task.attempt += 1;
                task.worker_id = Some(worker_id.to_string());
                task.heartbeat_deadline = task
                    .definition
                    .options
                    .heartbeat_timeout
                    .map(|timeout| add_duration(now, timeout));
                task.close_deadline = Some(add_duration(
                    now,
                    task.definition.options.start_to_close_timeout,
                ));
                claimed.push(task.claimed());
            }
        }
        Ok(claimed)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskInfo, StoreError> {
        self.check_available()?;
        self.inner
            .read()
            .tasks
            .get(&task_id)
            .map(TaskState::info)
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn tasks_for_run(&self, run_id: Uuid) -> Result<Vec<TaskInfo>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut tasks: Vec<&TaskState> = inner
            .tasks
            .values()
            .filter(|t| t.definition.run_id == run_id)
            .collect();
        tasks.sort_by_key(|t| t.enqueued_seq);
        Ok(tasks.into_iter().map(TaskState::info).collect())
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(HeartbeatResponse {
                accepted: false,
                should_cancel: true,
            });
        };

        if task.status != TaskStatus::Claimed || task.attempt != attempt {
            return Ok(HeartbeatResponse {
                accepted: false,
                should_cancel: task.should_cancel || task.status.is_finished(),
            });
        }

        if let Some(timeout) = task.definition.options.heartbeat_timeout {
            task.heartbeat_deadline = Some(add_duration(now, timeout));
        }
        if details.is_some() {
            task.heartbeat_details = details;
        }
        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel: task.should_cancel,
        })
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        error: &ActivityError,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed || task.attempt != attempt {
            return Err(StoreError::StaleAttempt {
                task_id,
                expected: task.attempt,
                actual: attempt,
            });
        }
        task.release(TaskStatus::Pending);
        task.available_at = available_at;
        task.last_error = Some(error.clone());
        Ok(())
    }

    async fn finish_task(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if !task.status.is_finished() {
            task.release(status);
        }
        Ok(())
    }

    async fn request_task_cancellation(
        &self,
        run_id: Uuid,
        activity_id: &str,
    ) -> Result<CancelOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task = inner.tasks.values_mut().find(|t| {
            t.definition.run_id == run_id
                && t.definition.activity_id == activity_id
                && !t.status.is_finished()
        });

        Ok(match task {
            None => CancelOutcome::NotFound,
            Some(task) if task.status == TaskStatus::Pending => CancelOutcome::Pending {
                task_id: task.id,
                attempt: task.attempt,
            },
            Some(task) => {
                task.should_cancel = true;
                CancelOutcome::Claimed { task_id: task.id }
            }
        })
    }

    async fn expired_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut expired: Vec<(u64, ExpiredTask)> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Claimed)
            .filter_map(|t| {
                let timeout = if t.heartbeat_deadline.is_some_and(|d| d < now) {
                    TimeoutType::Heartbeat
                } else if t.close_deadline.is_some_and(|d| d < now) {
                    TimeoutType::StartToClose
                } else {
                    return None;
                };
                Some((
                    t.enqueued_seq,
                    ExpiredTask {
                        task: t.claimed(),
                        timeout,
                    },
                ))
            })
            .collect();
        expired.sort_by_key(|(seq, _)| *seq);
        Ok(expired.into_iter().map(|(_, task)| task).collect())
    }

    async fn claim_due_timers(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<TimerDefinition>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();

        let mut due: Vec<(DateTime<Utc>, (Uuid, String))> = inner
            .timers
            .iter()
            .filter(|(_, timer)| {
                timer.definition.fire_at <= now && timer.live_owner(now).is_none()
            })
            .map(|(key, timer)| (timer.definition.fire_at, key.clone()))
            .collect();
        due.sort();

        let expires_at = add_duration(now, lease);
        let mut claimed = Vec::new();
        for (_, key) in due.into_iter().take(limit) {
            if let Some(timer) = inner.timers.get_mut(&key) {
                timer.lease = Some(TimerLease {
                    owner: owner.to_string(),
                    expires_at,
                });
                claimed.push(timer.definition.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_timer(
        &self,
        run_id: Uuid,
        timer_id: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let key = (run_id, timer_id.to_string());
        let Some(timer) = inner.timers.get(&key) else {
            return Ok(());
        };
        if let Some(holder) = timer.live_owner(now).filter(|holder| *holder != owner) {
            return Err(StoreError::TimerLeased {
                run_id,
                timer_id: timer_id.to_string(),
                owner: holder.to_string(),
            });
        }
        inner.timers.remove(&key);
        Ok(())
    }

    async fn pending_timers(
        &self,
        run_id: Option<Uuid>,
    ) -> Result<Vec<TimerDefinition>, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut timers: Vec<TimerDefinition> = inner
            .timers
            .values()
            .filter(|t| run_id.map_or(true, |id| t.definition.run_id == id))
            .map(|t| t.definition.clone())
            .collect();
        timers.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        Ok(timers)
    }
}
