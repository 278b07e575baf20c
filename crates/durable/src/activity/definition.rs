//! Activities and the errors they report

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::workflow::TimeoutType;

/// Error types the engine assigns on its own
///
/// Anything else in [`ActivityError::error_type`] comes from activity code.
pub mod error_types {
    /// Cancelled by the workflow, either before a worker claimed the task or
    /// cooperatively while it ran
    pub const CANCELLED: &str = "CANCELLED";
    /// Worker could not decode the input or encode the output
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    /// No handler registered for the activity type
    pub const UNKNOWN_ACTIVITY: &str = "UNKNOWN_ACTIVITY";
    pub const TIMEOUT_START_TO_CLOSE: &str = "TIMEOUT_START_TO_CLOSE";
    pub const TIMEOUT_HEARTBEAT: &str = "TIMEOUT_HEARTBEAT";
}

/// Failure of one activity attempt
///
/// The dispatcher retries an attempt only when `retryable` is set and the
/// `error_type` is not listed in the task's
/// [`RetryPolicy::non_retryable_errors`](crate::RetryPolicy). The final
/// failure is recorded verbatim in `activity_failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub retryable: bool,
    /// Extra context; timeouts carry the last heartbeat details here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Transient failure, retried by the policy
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Permanent failure, recorded on the first occurrence
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The workflow no longer wants the result
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::non_retryable(reason).with_type(error_types::CANCELLED)
    }

    /// The claimed attempt missed a deadline
    ///
    /// Retryable: a timed-out attempt goes through the retry policy like any
    /// other transient failure. Heartbeat details reported before the deadline
    /// are kept so the workflow can see how far the activity got.
    pub fn timed_out(
        timeout: TimeoutType,
        activity_id: &str,
        attempt: u32,
        heartbeat_details: Option<serde_json::Value>,
    ) -> Self {
        let what = match timeout {
            TimeoutType::StartToClose => "did not finish in time",
            TimeoutType::Heartbeat => "stopped heartbeating",
        };
        Self {
            details: heartbeat_details,
            ..Self::retryable(format!("activity {activity_id} {what} on attempt {attempt}"))
                .with_type(timeout.error_type())
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_type(error_types::INVALID_INPUT)
    }

    pub(crate) fn unknown_activity(activity_type: &str) -> Self {
        Self::non_retryable(format!("no handler for activity type {activity_type}"))
            .with_type(error_types::UNKNOWN_ACTIVITY)
    }

    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_type(error_types::CANCELLED)
    }
}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Typed activity executed by a [`WorkerPool`](crate::WorkerPool)
///
/// The pool decodes `Input` from the task payload and encodes `Output` into
/// the `activity_completed` event; a payload that does not decode fails the
/// task with [`error_types::INVALID_INPUT`] without calling `execute`.
///
/// ```ignore
/// struct ChargeCard { gateway: Gateway }
///
/// #[async_trait]
/// impl Activity for ChargeCard {
///     const TYPE: &'static str = "charge_card";
///     type Input = Charge;
///     type Output = Receipt;
///
///     async fn execute(&self, ctx: &ActivityContext, charge: Charge) -> Result<Receipt, ActivityError> {
///         ctx.heartbeat(json!({"stage": "authorizing"})).await?;
///         self.gateway.charge(&charge).await.map_err(ActivityError::from)
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Activity type; also the default task queue
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;
    type Output: Serialize + DeserializeOwned + Send;

    /// Run one attempt
    ///
    /// Long-running attempts should heartbeat and watch
    /// [`ActivityContext::cancelled`] so a cancelled workflow stops them.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_retryable_keeps_message() {
        let error = ActivityError::non_retryable("card declined").with_type("CARD_DECLINED");
        assert!(!error.retryable);
        assert_eq!(error.to_string(), "card declined");
        assert!(error.is_type("CARD_DECLINED"));
    }

    #[test]
    fn test_cancelled_error_is_final() {
        let error = ActivityError::cancelled("workflow cancelled");
        assert!(!error.retryable);
        assert!(error.is_cancelled());
    }

    #[test]
    fn test_heartbeat_timeout_keeps_progress() {
        let error = ActivityError::timed_out(
            TimeoutType::Heartbeat,
            "export",
            2,
            Some(serde_json::json!({"rows": 400})),
        );

        assert!(error.retryable);
        assert!(error.is_type(error_types::TIMEOUT_HEARTBEAT));
        assert_eq!(error.details, Some(serde_json::json!({"rows": 400})));
        assert_eq!(error.to_string(), "activity export stopped heartbeating on attempt 2");
    }

    #[test]
    fn test_start_to_close_timeout_type() {
        let error = ActivityError::timed_out(TimeoutType::StartToClose, "export", 1, None);
        assert!(error.is_type(error_types::TIMEOUT_START_TO_CLOSE));
        assert!(error.details.is_none());
    }

    #[test]
    fn test_anyhow_errors_keep_their_context() {
        let err = anyhow::anyhow!("connection reset").context("calling ledger api");
        let error = ActivityError::from(err);
        assert!(error.retryable);
        assert_eq!(error.message, "calling ledger api: connection reset");
    }

    #[test]
    fn test_untyped_error_omits_optional_fields() {
        let json = serde_json::to_value(ActivityError::retryable("flaky")).unwrap();
        assert_eq!(json, serde_json::json!({"message": "flaky", "retryable": true}));
    }
}
