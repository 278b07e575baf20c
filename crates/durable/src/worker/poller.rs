//! Task polling with exponential backoff
//!
//! An idle worker backs off up to `max_interval`; the first non-empty poll
//! snaps back to `min_interval`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use super::transport::WorkerTransport;
use crate::config::duration_millis;
use crate::persistence::ClaimedTask;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while tasks keep arriving
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier after an empty poll
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Claims tasks for one worker through a [`WorkerTransport`]
pub struct TaskPoller {
    transport: Arc<dyn WorkerTransport>,
    worker_id: String,
    queues: Vec<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        worker_id: String,
        queues: Vec<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            worker_id,
            queues,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_tasks` (capped by the batch size)
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<ClaimedTask>, PollerError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let limit = max_tasks.min(self.config.batch_size);
        let tasks = self
            .transport
            .poll_tasks(&self.worker_id, &self.queues, limit)
            .await
            .map_err(PollerError::Transport)?;

        if tasks.is_empty() {
            let next = self.current_interval.as_secs_f64() * self.config.backoff_multiplier;
            self.current_interval = Duration::from_secs_f64(next).min(self.config.max_interval);
            trace!(interval_ms = self.current_interval.as_millis() as u64, "no tasks, backing off");
        } else {
            self.current_interval = self.config.min_interval;
            debug!(count = tasks.len(), "claimed tasks");
        }
        Ok(tasks)
    }

    /// Sleep for the current interval; `true` if shutdown interrupted it
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// The transport could not claim tasks
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::persistence::HeartbeatResponse;
    use crate::workflow::ActivityOptions;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    /// Hands out the queued batches in order, then nothing
    struct Scripted {
        batches: Mutex<Vec<usize>>,
        seen_limits: Mutex<Vec<usize>>,
    }

    fn task() -> ClaimedTask {
        ClaimedTask {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            activity_id: "a".to_string(),
            activity_type: "t".to_string(),
            task_queue: "t".to_string(),
            input: serde_json::Value::Null,
            options: ActivityOptions::default(),
            attempt: 1,
            max_attempts: 3,
            heartbeat_details: None,
        }
    }

    #[async_trait]
    impl WorkerTransport for Scripted {
        async fn poll_tasks(
            &self,
            _worker_id: &str,
            _queues: &[String],
            max_tasks: usize,
        ) -> anyhow::Result<Vec<ClaimedTask>> {
            self.seen_limits.lock().push(max_tasks);
            let mut batches = self.batches.lock();
            let count = if batches.is_empty() { 0 } else { batches.remove(0) };
            Ok((0..count).map(|_| task()).collect())
        }

        async fn complete_task(&self, _: Uuid, _: u32, _: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fail_task(&self, _: Uuid, _: u32, _: ActivityError) -> anyhow::Result<()> {
            Ok(())
        }

        async fn heartbeat(
            &self,
            _: Uuid,
            _: u32,
            _: Option<serde_json::Value>,
        ) -> anyhow::Result<HeartbeatResponse> {
            Ok(HeartbeatResponse {
                accepted: true,
                should_cancel: false,
            })
        }
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let transport = Arc::new(Scripted {
            batches: Mutex::new(vec![0, 0, 2]),
            seen_limits: Mutex::new(vec![]),
        });
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::default()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(200))
            .with_backoff_multiplier(2.0)
            .with_batch_size(4);
        let mut poller = TaskPoller::new(
            transport.clone(),
            "w".to_string(),
            vec!["t".to_string()],
            config,
            rx,
        );

        assert!(poller.poll(10).await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        assert!(poller.poll(10).await.unwrap().is_empty());
        // Capped
        assert_eq!(poller.current_interval(), Duration::from_millis(200));

        assert_eq!(poller.poll(10).await.unwrap().len(), 2);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
        assert_eq!(*transport.seen_limits.lock(), vec![4, 4, 4]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let transport = Arc::new(Scripted {
            batches: Mutex::new(vec![1]),
            seen_limits: Mutex::new(vec![]),
        });
        let (tx, rx) = watch::channel(false);
        let mut poller = TaskPoller::new(
            transport.clone(),
            "w".to_string(),
            vec![],
            PollerConfig::default(),
            rx,
        );

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(poller.poll(1).await.unwrap().is_empty());
        assert!(transport.seen_limits.lock().is_empty());
    }
}
