//! Deterministic replay of a workflow program over its history
//!
//! Replay rebuilds a program from scratch for every invocation: the program
//! is created from the started event's input, `on_start` runs, and then every
//! recorded event is fed back in sequence order. Command events are matched
//! against the intents the program produces; resolution events are delivered
//! to the matching callback. Whatever is left unmatched when the log runs out
//! is new work.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
use crate::clock::add_duration;
use crate::workflow::{
    error_codes, ActivityOptions, Marker, RecordedEvent, UpdateOutcome, WorkflowAction,
    WorkflowContext, WorkflowError, WorkflowEvent, WorkflowUpdate,
};

/// Request produced by one replay pass
///
/// Recording intents become command events. `CancelTimer` and
/// `CancelActivity` are never recorded and may be acted on repeatedly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    ScheduleActivity {
        activity_id: String,
        activity_type: String,
        task_queue: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },
    StartTimer {
        timer_id: String,
        fire_at: chrono::DateTime<chrono::Utc>,
    },
    CancelTimer {
        timer_id: String,
    },
    CancelActivity {
        activity_id: String,
    },
    RecordMarker {
        marker: Marker,
    },
    ScheduleChild {
        child_id: String,
        workflow_type: String,
        input: serde_json::Value,
    },
    CompleteUpdate {
        update_id: String,
        outcome: UpdateOutcome,
    },
    Complete {
        result: serde_json::Value,
    },
    Fail {
        error: WorkflowError,
    },
    Cancel {
        reason: String,
    },
    ContinueAsNew {
        input: serde_json::Value,
    },
}

impl Intent {
    /// Whether acting on this intent appends a command event
    pub fn is_recording(&self) -> bool {
        !matches!(self, Intent::CancelTimer { .. } | Intent::CancelActivity { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Intent::Complete { .. }
                | Intent::Fail { .. }
                | Intent::Cancel { .. }
                | Intent::ContinueAsNew { .. }
        )
    }

    /// Event kind and id this intent is matched against
    fn key(&self) -> (&'static str, String) {
        match self {
            Intent::ScheduleActivity { activity_id, .. } => {
                ("activity_scheduled", activity_id.clone())
            }
            Intent::StartTimer { timer_id, .. } => ("timer_started", timer_id.clone()),
            Intent::CancelTimer { timer_id } => ("cancel_timer", timer_id.clone()),
            Intent::CancelActivity { activity_id } => ("cancel_activity", activity_id.clone()),
            Intent::RecordMarker { marker } => ("marker_recorded", marker_key(marker)),
            Intent::ScheduleChild { child_id, .. } => {
                ("child_workflow_scheduled", child_id.clone())
            }
            Intent::CompleteUpdate { update_id, .. } => ("update_completed", update_id.clone()),
            Intent::Complete { .. } => ("workflow_completed", String::new()),
            Intent::Fail { .. } => ("workflow_failed", String::new()),
            Intent::Cancel { .. } => ("workflow_cancelled", String::new()),
            Intent::ContinueAsNew { .. } => ("workflow_continued_as_new", String::new()),
        }
    }
}

fn marker_key(marker: &Marker) -> String {
    format!("{}:{}", marker.kind.as_str(), marker.id)
}

fn command_key(event: &WorkflowEvent) -> (&'static str, String) {
    let id = match event {
        WorkflowEvent::ActivityScheduled { activity_id, .. } => activity_id.clone(),
        WorkflowEvent::TimerStarted { timer_id, .. } => timer_id.clone(),
        WorkflowEvent::MarkerRecorded { marker } => marker_key(marker),
        WorkflowEvent::ChildWorkflowScheduled { child_id, .. } => child_id.clone(),
        WorkflowEvent::UpdateCompleted { update_id, .. } => update_id.clone(),
        _ => String::new(),
    };
    (event.kind(), id)
}

fn describe((kind, id): &(&'static str, String)) -> String {
    if id.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}({id})")
    }
}

/// Terminal result of a program
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Completed { result: serde_json::Value },
    Failed { error: WorkflowError },
    Cancelled { reason: String },
    ContinuedAsNew { input: serde_json::Value },
}

/// Errors from a replay pass
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("history is empty")]
    EmptyHistory,

    #[error("first event must be workflow_started")]
    MissingStart,

    /// The program's commands diverged from recorded history
    #[error("non-deterministic replay at sequence {sequence}: program produced {expected}, history has {found}")]
    NonDeterminism {
        sequence: u64,
        expected: String,
        found: String,
    },

    /// The program hit an unrecoverable error (incompatible version, corrupt marker)
    #[error("fatal workflow error: {0}")]
    Fatal(WorkflowError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl ReplayError {
    /// Error to close the run with, for errors that make the run unrecoverable
    ///
    /// Returns `None` for errors that are problems of this process (missing
    /// registration) rather than of the run.
    pub fn fatal_error(&self) -> Option<WorkflowError> {
        match self {
            ReplayError::NonDeterminism { .. } => {
                Some(WorkflowError::new(self.to_string()).with_code(error_codes::NON_DETERMINISTIC))
            }
            ReplayError::Fatal(error) => Some(error.clone()),
            ReplayError::Registry(RegistryError::Deserialization(e)) => Some(
                WorkflowError::new(format!("recorded input does not deserialize: {e}"))
                    .with_code(error_codes::INVALID_INPUT),
            ),
            _ => None,
        }
    }
}

/// Error from a read-only handler (query or update validator)
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// The handler tried to record something
    Usage(WorkflowError),
    /// The handler returned an error
    Rejected(WorkflowError),
}

/// Result of one replay pass
pub struct ReplayOutcome {
    /// Actionable intents, in the order the program produced them
    pub intents: Vec<Intent>,
    /// The program is suspended waiting for a resolution
    pub blocked: bool,
    /// Terminal result, once the program produced one
    pub result: Option<ExecutionResult>,
    workflow: Box<dyn AnyWorkflow>,
    ctx: WorkflowContext,
}

impl fmt::Debug for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayOutcome")
            .field("workflow_type", &self.workflow.workflow_type())
            .field("intents", &self.intents)
            .field("blocked", &self.blocked)
            .field("result", &self.result)
            .finish()
    }
}

impl ReplayOutcome {
    /// Run a query against the replayed state
    pub fn query(
        &mut self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        self.ctx.enter_read_only();
        let answer = self.workflow.query(&mut self.ctx, name, args);
        if let Some(violation) = self.ctx.take_usage_violation() {
            return Err(HandlerError::Usage(violation));
        }
        answer.map_err(HandlerError::Rejected)
    }

    /// Run the update validator against the replayed state
    pub fn validate_update(&mut self, update: &WorkflowUpdate) -> Result<(), HandlerError> {
        self.ctx.enter_read_only();
        let verdict = self.workflow.validate_update(&mut self.ctx, update);
        if let Some(violation) = self.ctx.take_usage_violation() {
            return Err(HandlerError::Usage(violation));
        }
        verdict.map_err(HandlerError::Rejected)
    }
}

/// Replay `history` through the registered program
pub fn replay(
    registry: &WorkflowRegistry,
    workflow_id: &str,
    run_id: Uuid,
    history: &[RecordedEvent],
) -> Result<ReplayOutcome, ReplayError> {
    let first = history.first().ok_or(ReplayError::EmptyHistory)?;
    let WorkflowEvent::WorkflowStarted {
        workflow_type,
        input,
        ..
    } = &first.event
    else {
        return Err(ReplayError::MissingStart);
    };

    let workflow = registry.create(workflow_type, input.clone())?;
    let mut ctx = WorkflowContext::for_replay(workflow_id, run_id, workflow_type.clone(), history);
    ctx.set_position(first.sequence, first.recorded_at);

    let mut replayer = Replayer {
        workflow,
        ctx,
        pending: VecDeque::new(),
        matched: 0,
        activities: BTreeSet::new(),
        timers: BTreeSet::new(),
        children: BTreeSet::new(),
        seen_updates: BTreeSet::new(),
        open_updates: BTreeSet::new(),
        cancelled_timers: Vec::new(),
        cancelled_activities: Vec::new(),
        result: None,
    };

    replayer.deliver(|w, ctx| w.on_start(ctx))?;
    for recorded in &history[1..] {
        replayer.ctx.set_position(recorded.sequence, recorded.recorded_at);
        if recorded.event.is_command() {
            replayer.match_command(recorded)?;
        } else {
            replayer.resolve(&recorded.event)?;
        }
    }

    let outcome = replayer.finish();
    debug!(
        %run_id,
        events = history.len(),
        intents = outcome.intents.len(),
        terminal = outcome.result.is_some(),
        "replayed history"
    );
    Ok(outcome)
}

struct Replayer {
    workflow: Box<dyn AnyWorkflow>,
    ctx: WorkflowContext,
    pending: VecDeque<Intent>,
    /// Command events matched so far
    matched: usize,
    /// Scheduled and not yet resolved
    activities: BTreeSet<String>,
    timers: BTreeSet<String>,
    children: BTreeSet<String>,
    seen_updates: BTreeSet<String>,
    open_updates: BTreeSet<String>,
    /// Cancelled by the program and not yet resolved
    cancelled_timers: Vec<String>,
    cancelled_activities: Vec<String>,
    result: Option<ExecutionResult>,
}

impl Replayer {
    fn deliver<F>(&mut self, callback: F) -> Result<(), ReplayError>
    where
        F: FnOnce(&mut dyn AnyWorkflow, &mut WorkflowContext) -> Vec<WorkflowAction>,
    {
        if self.result.is_some() {
            return Ok(());
        }
        self.ctx.set_command_cursor(self.matched, self.pending.len());
        let actions = callback(self.workflow.as_mut(), &mut self.ctx);

        let markers = self.ctx.take_emitted();
        if let Some(error) = self.ctx.take_fatal() {
            return Err(ReplayError::Fatal(error));
        }
        for marker in markers {
            self.pending.push_back(Intent::RecordMarker { marker });
        }
        for action in actions {
            self.apply(action);
        }
        Ok(())
    }

    fn apply(&mut self, action: WorkflowAction) {
        if self.result.is_some() {
            debug!(?action, "dropping action after terminal result");
            return;
        }

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                options,
            } => {
                if !self.activities.insert(activity_id.clone()) {
                    return self.fail_duplicate("activity", &activity_id);
                }
                let task_queue = options.queue_for(&activity_type).to_string();
                self.pending.push_back(Intent::ScheduleActivity {
                    activity_id,
                    activity_type,
                    task_queue,
                    input,
                    options,
                });
            }
            WorkflowAction::StartTimer { timer_id, duration } => {
                if !self.timers.insert(timer_id.clone()) {
                    return self.fail_duplicate("timer", &timer_id);
                }
                self.cancelled_timers.retain(|t| *t != timer_id);
                let fire_at = add_duration(self.ctx.now(), duration);
                self.pending
                    .push_back(Intent::StartTimer { timer_id, fire_at });
            }
            WorkflowAction::CancelTimer { timer_id } => self.cancel_timer(&timer_id),
            WorkflowAction::CancelActivity { activity_id } => self.cancel_activity(&activity_id),
            WorkflowAction::ScheduleChildWorkflow {
                child_id,
                workflow_type,
                input,
            } => {
                if !self.children.insert(child_id.clone()) {
                    return self.fail_duplicate("child workflow", &child_id);
                }
                self.pending.push_back(Intent::ScheduleChild {
                    child_id,
                    workflow_type,
                    input,
                });
            }
            WorkflowAction::CompleteUpdate { update_id, outcome } => {
                if !self.open_updates.remove(&update_id) {
                    debug!(%update_id, "ignoring completion of an update that is not open");
                    return;
                }
                self.pending
                    .push_back(Intent::CompleteUpdate { update_id, outcome });
            }
            WorkflowAction::CompleteWorkflow { result } => self.terminate(
                Intent::Complete {
                    result: result.clone(),
                },
                ExecutionResult::Completed { result },
            ),
            WorkflowAction::FailWorkflow { error } => self.terminate(
                Intent::Fail {
                    error: error.clone(),
                },
                ExecutionResult::Failed { error },
            ),
            WorkflowAction::CancelWorkflow { reason } => self.terminate(
                Intent::Cancel {
                    reason: reason.clone(),
                },
                ExecutionResult::Cancelled { reason },
            ),
            WorkflowAction::ContinueAsNew { input } => self.terminate(
                Intent::ContinueAsNew {
                    input: input.clone(),
                },
                ExecutionResult::ContinuedAsNew { input },
            ),
            WorkflowAction::None => {}
        }
    }

    fn terminate(&mut self, intent: Intent, result: ExecutionResult) {
        self.pending.push_back(intent);
        self.result = Some(result);
    }

    fn fail_duplicate(&mut self, what: &str, id: &str) {
        let error = WorkflowError::new(format!("{what} id '{id}' is already in use"))
            .with_code(error_codes::DUPLICATE_ID);
        self.terminate(
            Intent::Fail {
                error: error.clone(),
            },
            ExecutionResult::Failed { error },
        );
    }

    fn cancel_timer(&mut self, timer_id: &str) {
        let before = self.pending.len();
        self.pending
            .retain(|i| !matches!(i, Intent::StartTimer { timer_id: t, .. } if t == timer_id));
        let was_pending = self.pending.len() != before;

        if self.timers.remove(timer_id)
            && !was_pending
            && !self.cancelled_timers.iter().any(|t| t == timer_id)
        {
            self.cancelled_timers.push(timer_id.to_string());
        }
    }

    fn cancel_activity(&mut self, activity_id: &str) {
        let before = self.pending.len();
        self.pending.retain(
            |i| !matches!(i, Intent::ScheduleActivity { activity_id: a, .. } if a == activity_id),
        );
        if self.pending.len() != before {
            self.activities.remove(activity_id);
            return;
        }

        if self.activities.contains(activity_id)
            && !self.cancelled_activities.iter().any(|a| a == activity_id)
        {
            self.cancelled_activities.push(activity_id.to_string());
        }
    }

    fn match_command(&mut self, recorded: &RecordedEvent) -> Result<(), ReplayError> {
        let found = command_key(&recorded.event);
        match self.pending.pop_front() {
            Some(intent) if intent.key() == found => {
                self.matched += 1;
                Ok(())
            }
            Some(intent) => Err(ReplayError::NonDeterminism {
                sequence: recorded.sequence,
                expected: describe(&intent.key()),
                found: describe(&found),
            }),
            None => Err(ReplayError::NonDeterminism {
                sequence: recorded.sequence,
                expected: "no command".to_string(),
                found: describe(&found),
            }),
        }
    }

    fn resolve(&mut self, event: &WorkflowEvent) -> Result<(), ReplayError> {
        match event {
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } => {
                if self.resolve_activity(activity_id) {
                    self.deliver(|w, ctx| w.on_activity_completed(ctx, activity_id, result.clone()))?;
                }
            }
            WorkflowEvent::ActivityFailed {
                activity_id, error, ..
            } => {
                if self.resolve_activity(activity_id) {
                    self.deliver(|w, ctx| w.on_activity_failed(ctx, activity_id, error))?;
                }
            }
            WorkflowEvent::TimerFired { timer_id } => {
                if let Some(pos) = self.cancelled_timers.iter().position(|t| t == timer_id) {
                    self.cancelled_timers.remove(pos);
                    debug!(%timer_id, "not delivering cancelled timer");
                } else if self.timers.remove(timer_id) {
                    self.deliver(|w, ctx| w.on_timer_fired(ctx, timer_id))?;
                } else {
                    debug!(%timer_id, "ignoring duplicate timer resolution");
                }
            }
            WorkflowEvent::SignalReceived { signal } => {
                self.deliver(|w, ctx| w.on_signal(ctx, signal))?;
            }
            WorkflowEvent::UpdateReceived { update } => {
                if self.seen_updates.insert(update.update_id.clone()) {
                    if self.result.is_none() {
                        self.open_updates.insert(update.update_id.clone());
                    }
                    self.deliver(|w, ctx| w.on_update(ctx, update))?;
                }
            }
            WorkflowEvent::ChildWorkflowCompleted { child_id, result } => {
                if self.children.remove(child_id) {
                    self.deliver(|w, ctx| w.on_child_completed(ctx, child_id, result.clone()))?;
                }
            }
            WorkflowEvent::ChildWorkflowFailed { child_id, error } => {
                if self.children.remove(child_id) {
                    self.deliver(|w, ctx| w.on_child_failed(ctx, child_id, error))?;
                }
            }
            WorkflowEvent::CancelRequested { reason } => {
                if self.ctx.is_cancel_requested() {
                    return Ok(());
                }
                self.ctx.mark_cancel_requested();
                if self.result.is_some() {
                    return Ok(());
                }
                let in_flight: Vec<String> = self.activities.iter().cloned().collect();
                for activity_id in in_flight {
                    self.cancel_activity(&activity_id);
                }
                self.deliver(|w, ctx| w.on_cancel_requested(ctx, reason))?;
            }
            other => debug!(kind = other.kind(), "ignoring unexpected event during replay"),
        }
        Ok(())
    }

    /// Returns false for a duplicate resolution
    fn resolve_activity(&mut self, activity_id: &str) -> bool {
        if !self.activities.remove(activity_id) {
            debug!(%activity_id, "ignoring duplicate activity resolution");
            return false;
        }
        self.cancelled_activities.retain(|a| a != activity_id);
        true
    }

    fn finish(self) -> ReplayOutcome {
        let mut intents: Vec<Intent> = self.pending.into_iter().collect();
        intents.extend(
            self.cancelled_timers
                .into_iter()
                .map(|timer_id| Intent::CancelTimer { timer_id }),
        );
        intents.extend(
            self.cancelled_activities
                .into_iter()
                .map(|activity_id| Intent::CancelActivity { activity_id }),
        );

        ReplayOutcome {
            intents,
            blocked: self.result.is_none(),
            result: self.result,
            workflow: self.workflow,
            ctx: self.ctx,
        }
    }
}
