//! Version gate
//!
//! Binds a run to the branch it took the first time it reached a change
//! point. The recording itself goes through
//! [`WorkflowContext::get_version`](crate::workflow::WorkflowContext::get_version);
//! this module holds the decision rules.

use crate::workflow::{error_codes, WorkflowError};

/// Version returned to runs that passed a change point before it existed
pub const DEFAULT_VERSION: i32 = -1;

/// How a `get_version` call is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// A marker exists; reuse its value
    Recorded(i32),
    /// Live first encounter; record this value
    Record(i32),
    /// Replaying a decision made before the gate existed
    Default,
}

/// Decide which version a call resolves to
pub fn decide(recorded: Option<i32>, replaying: bool, max_supported: i32) -> VersionDecision {
    match (recorded, replaying) {
        (Some(version), _) => VersionDecision::Recorded(version),
        (None, false) => VersionDecision::Record(max_supported),
        (None, true) => VersionDecision::Default,
    }
}

/// Fail when a resolved version is outside the supported range
pub fn check_supported(
    change_id: &str,
    version: i32,
    min_supported: i32,
    max_supported: i32,
) -> Result<i32, WorkflowError> {
    if version < min_supported || version > max_supported {
        return Err(WorkflowError::new(format!(
            "version {version} of change '{change_id}' is outside the supported range \
             [{min_supported}, {max_supported}]"
        ))
        .with_code(error_codes::INCOMPATIBLE_VERSION));
    }
    Ok(version)
}
