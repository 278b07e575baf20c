//! Deterministic context handed to workflow callbacks
//!
//! Everything a workflow would otherwise read from the environment (time,
//! randomness, version decisions) comes from here. Values are either taken
//! from history or recorded as marker commands, so a replay observes exactly
//! what the live run observed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::{error_codes, Marker, MarkerKind, RecordedEvent, WorkflowError, WorkflowEvent};
use crate::engine::version::{self, VersionDecision, DEFAULT_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextMode {
    Execute,
    ReadOnly,
}

/// Per-run context passed to every [`Workflow`](super::Workflow) callback
#[derive(Debug)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: Uuid,
    workflow_type: String,
    now: DateTime<Utc>,
    sequence: u64,
    cancel_requested: bool,

    /// One entry per recorded command; version markers keep change id and value
    recorded_commands: Vec<Option<(String, serde_json::Value)>>,
    /// Commands already matched by the replay
    matched_commands: usize,
    /// Commands claimed by intents queued before the running callback
    queued_commands: usize,
    recorded_side_effects: HashMap<String, serde_json::Value>,
    recorded_mutable: HashMap<String, Vec<serde_json::Value>>,

    versions: HashMap<String, i32>,
    side_effect_counter: u64,
    mutable_cursor: HashMap<String, usize>,
    mutable_latest: HashMap<String, serde_json::Value>,

    emitted: Vec<Marker>,
    mode: ContextMode,
    fatal: Option<WorkflowError>,
    usage_violation: Option<WorkflowError>,
}

impl WorkflowContext {
    /// Build a context for replaying `history`
    ///
    /// Side-effect markers are indexed by id up front. Version markers stay
    /// in command order: a `get_version` call only picks up the marker sitting
    /// where its own marker command would be matched.
    pub(crate) fn for_replay(
        workflow_id: impl Into<String>,
        run_id: Uuid,
        workflow_type: impl Into<String>,
        history: &[RecordedEvent],
    ) -> Self {
        let mut ctx = Self {
            workflow_id: workflow_id.into(),
            run_id,
            workflow_type: workflow_type.into(),
            now: history.first().map(|e| e.recorded_at).unwrap_or_else(Utc::now),
            sequence: 0,
            cancel_requested: false,
            recorded_commands: Vec::new(),
            matched_commands: 0,
            queued_commands: 0,
            recorded_side_effects: HashMap::new(),
            recorded_mutable: HashMap::new(),
            versions: HashMap::new(),
            side_effect_counter: 0,
            mutable_cursor: HashMap::new(),
            mutable_latest: HashMap::new(),
            emitted: Vec::new(),
            mode: ContextMode::Execute,
            fatal: None,
            usage_violation: None,
        };

        for recorded in history {
            if !recorded.event.is_command() {
                continue;
            }
            let WorkflowEvent::MarkerRecorded { marker } = &recorded.event else {
                ctx.recorded_commands.push(None);
                continue;
            };
            let id = marker.id.clone();
            let value = marker.value.clone();
            match marker.kind {
                MarkerKind::Version => {
                    ctx.recorded_commands.push(Some((id, value)));
                    continue;
                }
                MarkerKind::SideEffect => {
                    ctx.recorded_side_effects.entry(id).or_insert(value);
                }
                MarkerKind::MutableSideEffect => {
                    ctx.recorded_mutable.entry(id).or_default().push(value);
                }
            }
            ctx.recorded_commands.push(None);
        }
        ctx
    }

    // =========================================================================
    // Read-only accessors
    // =========================================================================

    /// External workflow id
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Current run id
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Registered workflow type
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Deterministic "now": the recorded time of the event being handled
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Number of events up to and including the one being handled
    pub fn history_length(&self) -> u64 {
        self.sequence + 1
    }

    /// Whether cancellation of this run has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    // =========================================================================
    // Recorded values
    // =========================================================================

    /// Resolve the version to use for a change point
    ///
    /// The first live encounter records `max_supported`; replays return the
    /// recorded value. Runs whose history has some other command where this
    /// marker would go passed the point before the gate existed and get
    /// [`DEFAULT_VERSION`]. A value outside `min_supported..=max_supported`
    /// is fatal for the run.
    pub fn get_version(
        &mut self,
        change_id: &str,
        min_supported: i32,
        max_supported: i32,
    ) -> Result<i32, WorkflowError> {
        let resolved = match self.versions.get(change_id).copied() {
            Some(v) => v,
            None => {
                let position = self.next_command_position();
                let recorded = match self.recorded_version_marker(change_id, position) {
                    Some(value) => Some(self.recorded_version(change_id, &value)?),
                    None => None,
                };
                let replaying = position < self.recorded_commands.len();
                let resolved =
                    match version::decide(recorded, replaying, max_supported) {
                        VersionDecision::Recorded(v) => {
                            self.emit(MarkerKind::Version, change_id, v.into(), false)?;
                            v
                        }
                        VersionDecision::Record(v) => {
                            self.emit(MarkerKind::Version, change_id, v.into(), true)?;
                            v
                        }
                        VersionDecision::Default => DEFAULT_VERSION,
                    };
                self.versions.insert(change_id.to_string(), resolved);
                resolved
            }
        };

        version::check_supported(change_id, resolved, min_supported, max_supported)
            .map_err(|e| self.set_fatal(e))
    }

    /// Run `f` once and pin its result into history
    pub fn side_effect<T, F>(&mut self, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        self.side_effect_counter += 1;
        let id = self.side_effect_counter.to_string();

        if let Some(value) = self.recorded_side_effects.get(&id).cloned() {
            let typed = self.decode(MarkerKind::SideEffect, &id, value.clone())?;
            self.emit(MarkerKind::SideEffect, &id, value, false)?;
            return Ok(typed);
        }

        self.ensure_can_record("side_effect")?;
        let fresh = f();
        let value = self.encode(&fresh)?;
        self.emit(MarkerKind::SideEffect, &id, value, true)?;
        Ok(fresh)
    }

    /// Time-ordered random id, recorded as a side effect
    pub fn random_uuid(&mut self) -> Result<Uuid, WorkflowError> {
        self.side_effect(Uuid::now_v7)
    }

    /// Random number, recorded as a side effect
    pub fn random_u64(&mut self) -> Result<u64, WorkflowError> {
        self.side_effect(rand::random::<u64>)
    }

    /// Re-evaluate `f` on every call and record a new value only when it changed
    ///
    /// `eq` decides whether the fresh value equals the latest recorded one.
    /// On replay the recorded values win. If `eq` answers differently on
    /// replay than it did live, the marker commands no longer line up with
    /// history and the run fails as non-deterministic.
    pub fn mutable_side_effect<T, F, E>(&mut self, id: &str, f: F, eq: E) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
        E: Fn(&T, &T) -> bool,
    {
        let fresh = f();

        if let Some(latest) = self.mutable_latest.get(id).cloned() {
            let previous: T = self.decode(MarkerKind::MutableSideEffect, id, latest)?;
            if eq(&previous, &fresh) {
                return Ok(previous);
            }
        }

        let index = {
            let cursor = self.mutable_cursor.entry(id.to_string()).or_insert(0);
            let index = *cursor;
            *cursor += 1;
            index
        };
        let recorded = self
            .recorded_mutable
            .get(id)
            .and_then(|values| values.get(index))
            .cloned();

        let (value, is_new) = match recorded {
            Some(value) => (value, false),
            None => {
                self.ensure_can_record("mutable_side_effect")?;
                (self.encode(&fresh)?, true)
            }
        };
        self.emit(MarkerKind::MutableSideEffect, id, value.clone(), is_new)?;
        self.mutable_latest.insert(id.to_string(), value.clone());

        if is_new {
            Ok(fresh)
        } else {
            self.decode(MarkerKind::MutableSideEffect, id, value)
        }
    }

    // =========================================================================
    // Engine hooks
    // =========================================================================

    pub(crate) fn set_position(&mut self, sequence: u64, recorded_at: DateTime<Utc>) {
        self.sequence = sequence;
        self.now = recorded_at;
    }

    /// Where the command stream stands when a callback starts
    pub(crate) fn set_command_cursor(&mut self, matched: usize, queued: usize) {
        self.matched_commands = matched;
        self.queued_commands = queued;
    }

    pub(crate) fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    pub(crate) fn enter_read_only(&mut self) {
        self.mode = ContextMode::ReadOnly;
    }

    pub(crate) fn take_emitted(&mut self) -> Vec<Marker> {
        std::mem::take(&mut self.emitted)
    }

    pub(crate) fn take_fatal(&mut self) -> Option<WorkflowError> {
        self.fatal.take()
    }

    pub(crate) fn take_usage_violation(&mut self) -> Option<WorkflowError> {
        self.usage_violation.take()
    }

    /// Index in the command stream the next emitted marker will be matched at
    fn next_command_position(&self) -> usize {
        self.matched_commands + self.queued_commands + self.emitted.len()
    }

    /// Value of the version marker for `change_id` between the replay cursor
    /// and `position`
    ///
    /// A cancellation later in the same callback can drop queued intents and
    /// pull the marker ahead of `position`.
    fn recorded_version_marker(&self, change_id: &str, position: usize) -> Option<serde_json::Value> {
        let end = (position + 1).min(self.recorded_commands.len());
        let start = self.matched_commands.min(end);
        self.recorded_commands[start..end]
            .iter()
            .flatten()
            .find(|(id, _)| id == change_id)
            .map(|(_, value)| value.clone())
    }

    fn recorded_version(
        &mut self,
        change_id: &str,
        value: &serde_json::Value,
    ) -> Result<i32, WorkflowError> {
        match value.as_i64().and_then(|v| i32::try_from(v).ok()) {
            Some(v) => Ok(v),
            None => Err(self.set_fatal(
                WorkflowError::new(format!(
                    "version marker for '{change_id}' holds a non-integer value: {value}"
                ))
                .with_code(error_codes::NON_DETERMINISTIC),
            )),
        }
    }

    fn ensure_can_record(&mut self, operation: &str) -> Result<(), WorkflowError> {
        if self.mode == ContextMode::ReadOnly {
            return Err(self.set_usage(operation));
        }
        Ok(())
    }

    fn emit(
        &mut self,
        kind: MarkerKind,
        id: &str,
        value: serde_json::Value,
        is_new: bool,
    ) -> Result<(), WorkflowError> {
        if self.mode == ContextMode::ReadOnly {
            if is_new {
                return Err(self.set_usage("record marker"));
            }
            return Ok(());
        }
        self.emitted.push(Marker {
            kind,
            id: id.to_string(),
            value,
        });
        Ok(())
    }

    fn encode<T: Serialize>(&mut self, value: &T) -> Result<serde_json::Value, WorkflowError> {
        serde_json::to_value(value).map_err(|e| {
            self.set_fatal(
                WorkflowError::new(format!("failed to serialize side effect: {e}"))
                    .with_code(error_codes::SERIALIZATION),
            )
        })
    }

    fn decode<T: DeserializeOwned>(
        &mut self,
        kind: MarkerKind,
        id: &str,
        value: serde_json::Value,
    ) -> Result<T, WorkflowError> {
        serde_json::from_value(value).map_err(|e| {
            self.set_fatal(
                WorkflowError::new(format!(
                    "recorded {kind:?} marker '{id}' does not match the requested type: {e}"
                ))
                .with_code(error_codes::NON_DETERMINISTIC),
            )
        })
    }

    fn set_fatal(&mut self, error: WorkflowError) -> WorkflowError {
        self.fatal.get_or_insert_with(|| error.clone());
        error
    }

    fn set_usage(&mut self, operation: &str) -> WorkflowError {
        let error = WorkflowError::new(format!(
            "{operation} is not allowed in a read-only handler"
        ))
        .with_code(error_codes::USAGE);
        self.usage_violation.get_or_insert_with(|| error.clone());
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(sequence: u64, event: WorkflowEvent) -> RecordedEvent {
        RecordedEvent {
            sequence,
            recorded_at: Utc::now(),
            event,
        }
    }

    fn started() -> RecordedEvent {
        event(
            0,
            WorkflowEvent::WorkflowStarted {
                workflow_type: "test".to_string(),
                input: json!({}),
                parent: None,
                continued_from: None,
            },
        )
    }

    fn marker(sequence: u64, kind: MarkerKind, id: &str, value: serde_json::Value) -> RecordedEvent {
        event(
            sequence,
            WorkflowEvent::MarkerRecorded {
                marker: Marker {
                    kind,
                    id: id.to_string(),
                    value,
                },
            },
        )
    }

    fn ctx(history: &[RecordedEvent]) -> WorkflowContext {
        WorkflowContext::for_replay("wf-1", Uuid::now_v7(), "test", history)
    }

    #[test]
    fn test_get_version_records_max_when_live() {
        let mut ctx = ctx(&[started()]);

        assert_eq!(ctx.get_version("change", 1, 3).unwrap(), 3);
        let emitted = ctx.take_emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, MarkerKind::Version);
        assert_eq!(emitted[0].value, json!(3));

        // Same change id again: cached, nothing new recorded
        assert_eq!(ctx.get_version("change", 1, 3).unwrap(), 3);
        assert!(ctx.take_emitted().is_empty());
    }

    #[test]
    fn test_get_version_returns_recorded_value() {
        let history = vec![started(), marker(1, MarkerKind::Version, "change", json!(1))];
        let mut ctx = ctx(&history);

        assert_eq!(ctx.get_version("change", 1, 5).unwrap(), 1);
        assert!(ctx.take_fatal().is_none());
    }

    #[test]
    fn test_get_version_outside_range_is_fatal() {
        let history = vec![started(), marker(1, MarkerKind::Version, "change", json!(1))];
        let mut ctx = ctx(&history);

        let err = ctx.get_version("change", 2, 3).unwrap_err();
        assert!(err.has_code(error_codes::INCOMPATIBLE_VERSION));
        assert!(ctx.take_fatal().is_some());
    }

    #[test]
    fn test_get_version_defaults_when_point_already_decided() {
        let history = vec![
            started(),
            event(
                1,
                WorkflowEvent::TimerStarted {
                    timer_id: "t".to_string(),
                    fire_at: Utc::now(),
                },
            ),
        ];
        let mut ctx = ctx(&history);
        ctx.set_position(0, Utc::now());

        assert_eq!(ctx.get_version("change", DEFAULT_VERSION, 2).unwrap(), DEFAULT_VERSION);
        assert!(ctx.take_emitted().is_empty());
    }

    #[test]
    fn test_get_version_only_takes_marker_at_its_own_position() {
        let history = vec![
            started(),
            event(
                1,
                WorkflowEvent::TimerStarted {
                    timer_id: "cool-off".to_string(),
                    fire_at: Utc::now(),
                },
            ),
            event(
                2,
                WorkflowEvent::TimerFired {
                    timer_id: "cool-off".to_string(),
                },
            ),
            marker(3, MarkerKind::Version, "fee-rules", json!(2)),
        ];

        // Gate moved ahead of the timer: the timer sits where its marker would go
        let mut early = ctx(&history);
        early.set_command_cursor(0, 0);
        assert_eq!(early.get_version("fee-rules", DEFAULT_VERSION, 2).unwrap(), DEFAULT_VERSION);
        assert!(early.take_emitted().is_empty());
        assert!(early.take_fatal().is_none());

        // Gate where the run originally passed it
        let mut original = ctx(&history);
        original.set_command_cursor(1, 0);
        assert_eq!(original.get_version("fee-rules", DEFAULT_VERSION, 2).unwrap(), 2);
        assert_eq!(original.take_emitted().len(), 1);
    }

    #[test]
    fn test_side_effect_replays_recorded_value() {
        let history = vec![started(), marker(1, MarkerKind::SideEffect, "1", json!(42))];
        let mut ctx = ctx(&history);

        let value: u64 = ctx.side_effect(|| 7).unwrap();
        assert_eq!(value, 42);

        let value: u64 = ctx.side_effect(|| 7).unwrap();
        assert_eq!(value, 7);
        let emitted = ctx.take_emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].id, "2");
    }

    #[test]
    fn test_mutable_side_effect_records_only_changes() {
        let mut ctx = ctx(&[started()]);
        let same = |a: &u32, b: &u32| a == b;

        assert_eq!(ctx.mutable_side_effect("rate", || 5u32, same).unwrap(), 5);
        assert_eq!(ctx.mutable_side_effect("rate", || 5u32, same).unwrap(), 5);
        assert_eq!(ctx.mutable_side_effect("rate", || 6u32, same).unwrap(), 6);

        let values: Vec<_> = ctx.take_emitted().into_iter().map(|m| m.value).collect();
        assert_eq!(values, vec![json!(5), json!(6)]);
    }

    #[test]
    fn test_mutable_side_effect_prefers_recorded_values() {
        let history = vec![
            started(),
            marker(1, MarkerKind::MutableSideEffect, "rate", json!(5)),
        ];
        let mut ctx = ctx(&history);

        let value = ctx
            .mutable_side_effect("rate", || 9u32, |a, b| a == b)
            .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_read_only_context_rejects_recording() {
        let mut ctx = ctx(&[started()]);
        ctx.enter_read_only();

        let err = ctx.side_effect(|| 1u8).unwrap_err();
        assert!(err.has_code(error_codes::USAGE));
        assert!(ctx.take_usage_violation().is_some());
        assert!(ctx.take_emitted().is_empty());
    }
}
