//! Seam between workers and the dispatcher
//!
//! Workers talk to the engine only through this trait, so the same pool runs
//! in-process against a [`TaskDispatcher`](crate::engine::TaskDispatcher) or
//! against a remote dispatcher behind any RPC layer.

use async_trait::async_trait;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{ClaimedTask, HeartbeatResponse};

/// Operations a worker needs from the dispatcher
#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    /// Claim up to `max_tasks` tasks from the given queues
    async fn poll_tasks(
        &self,
        worker_id: &str,
        queues: &[String],
        max_tasks: usize,
    ) -> anyhow::Result<Vec<ClaimedTask>>;

    /// Report a successful attempt
    async fn complete_task(
        &self,
        task_id: Uuid,
        attempt: u32,
        result: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Report a failed attempt
    async fn fail_task(&self, task_id: Uuid, attempt: u32, error: ActivityError)
        -> anyhow::Result<()>;

    /// Extend the attempt's heartbeat deadline
    async fn heartbeat(
        &self,
        task_id: Uuid,
        attempt: u32,
        details: Option<serde_json::Value>,
    ) -> anyhow::Result<HeartbeatResponse>;
}
