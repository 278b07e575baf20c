//! Activity execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (worker shut down or task finished)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - Heartbeat functionality for long-running activities
/// - Cooperative cancellation (set when the owning workflow is cancelled or
///   asks for the activity to stop)
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for i in 0..100 {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::cancelled("stopped on request"));
///         }
///
///         do_work(i).await?;
///
///         // Send heartbeat with progress
///         ctx.heartbeat(Some(json!({"progress": i}))).await?;
///     }
///
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Task id in the dispatcher's index
    pub task_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// External id of the owning workflow
    pub workflow_id: String,

    /// Run that scheduled the activity
    pub run_id: Uuid,

    /// Activity ID within the workflow
    pub activity_id: String,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,
    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        task_id: Uuid,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            attempt,
            max_attempts,
            workflow_id: workflow_id.into(),
            run_id,
            activity_id: activity_id.into(),
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Share an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this activity when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// Heartbeats serve two purposes:
    /// 1. Keep the activity alive (prevent heartbeat timeout)
    /// 2. Report progress to the workflow system
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the
    /// heartbeat channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::cancelled("stopped on request"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
