//! Worker pool for activity execution
//!
//! Manages concurrent activity execution with backpressure, heartbeat
//! forwarding, cooperative cancellation and graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
use super::poller::{PollerConfig, TaskPoller};
use crate::config::duration_millis;
use super::transport::WorkerTransport;
use crate::activity::{error_types, Activity, ActivityContext, ActivityError, HeartbeatPayload};
use crate::config::{env_millis, env_parse};
use crate::persistence::ClaimedTask;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queues to claim from; empty means one queue per registered activity type
    pub task_queues: Vec<String>,

    /// Maximum concurrent activity executions
    pub max_concurrency: usize,

    pub backpressure: BackpressureConfig,

    pub poller: PollerConfig,

    /// Minimum spacing between heartbeats sent for one attempt
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// How long shutdown waits for in-flight activities
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queues: vec![],
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Worker claiming from the given queues
    pub fn new(task_queues: Vec<String>) -> Self {
        Self {
            task_queues,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Reads `DURABLE_WORKER_ID`, `DURABLE_WORKER_QUEUES` (comma separated),
    /// `DURABLE_WORKER_MAX_CONCURRENCY` and
    /// `DURABLE_WORKER_HEARTBEAT_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let task_queues = std::env::var("DURABLE_WORKER_QUEUES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            worker_id: std::env::var("DURABLE_WORKER_ID").unwrap_or(defaults.worker_id),
            task_queues,
            max_concurrency: env_parse::<usize>("DURABLE_WORKER_MAX_CONCURRENCY")
                .map(|n| n.max(1))
                .unwrap_or(defaults.max_concurrency),
            heartbeat_interval: env_millis("DURABLE_WORKER_HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval),
            ..defaults
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Not started, or fully stopped
    Stopped,
    /// Claiming and executing activities
    Running,
    /// Finishing in-flight activities, not claiming new ones
    Draining,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with {0} activities in flight")]
    ShutdownTimeout(usize),

    #[error(transparent)]
    Backpressure(#[from] BackpressureError),
}

/// Type-erased activity implementation
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>
        + Send
        + Sync,
>;

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(dispatcher.clone(), WorkerPoolConfig::default());
/// pool.register(ChargeCard::new(gateway));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    transport: Arc<dyn WorkerTransport>,
    config: WorkerPoolConfig,
    backpressure: Arc<BackpressureState>,
    handlers: RwLock<HashMap<String, ActivityHandler>>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    tracker: TaskTracker,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(transport: Arc<dyn WorkerTransport>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.max_concurrency,
        ));

        Self {
            transport,
            config,
            backpressure,
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            tracker: TaskTracker::new(),
            poll_handle: Mutex::new(None),
        }
    }

    /// Register a typed activity
    pub fn register<A: Activity>(&self, activity: A) {
        let activity = Arc::new(activity);
        self.register_handler(A::TYPE, move |ctx, input| {
            let activity = Arc::clone(&activity);
            async move {
                let input: A::Input = serde_json::from_value(input)
                    .map_err(|e| ActivityError::invalid_input(format!("invalid input: {e}")))?;
                let output = activity.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::invalid_input(format!("failed to serialize output: {e}"))
                })
            }
        });
    }

    /// Register a handler closure for an activity type
    pub fn register_handler<F, Fut>(&self, activity_type: &str, handler: F)
    where
        F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler =
            Arc::new(move |ctx: ActivityContext, input: serde_json::Value| handler(ctx, input).boxed());
        self.handlers.write().insert(activity_type.to_string(), handler);
        debug!(activity_type, "registered activity handler");
    }

    /// Start claiming and executing activities
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        self.config.backpressure.validate()?;
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        let handlers = self.handlers.read().clone();
        let queues = if self.config.task_queues.is_empty() {
            let mut types: Vec<String> = handlers.keys().cloned().collect();
            types.sort();
            types
        } else {
            self.config.task_queues.clone()
        };

        info!(
            worker_id = %self.config.worker_id,
            ?queues,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        let mut poller = TaskPoller::new(
            Arc::clone(&self.transport),
            self.config.worker_id.clone(),
            queues,
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );
        let transport = Arc::clone(&self.transport);
        let backpressure = Arc::clone(&self.backpressure);
        let tracker = self.tracker.clone();
        let heartbeat_interval = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    break;
                }

                let slots = backpressure.admit();
                if slots > 0 {
                    match poller.poll(slots).await {
                        Ok(tasks) => {
                            for task in tasks {
                                let handler = handlers.get(&task.activity_type).cloned();
                                let in_flight = backpressure.track();
                                tracker.spawn(execute_task(
                                    Arc::clone(&transport),
                                    handler,
                                    task,
                                    heartbeat_interval,
                                    in_flight,
                                ));
                            }
                        }
                        Err(e) => error!(error = %e, "poll failed"),
                    }
                } else {
                    debug!(reason = ?backpressure.reason(), "under backpressure, not polling");
                }

                if poller.wait().await {
                    break;
                }
            }
            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop claiming and wait for in-flight activities
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }
        info!(worker_id = %self.config.worker_id, "draining worker pool");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll loop ended abnormally");
            }
        }

        self.tracker.close();
        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait()).await;
        self.tracker.reopen();
        *self.status.write() = WorkerPoolStatus::Stopped;

        if drained.is_err() {
            let remaining = self.backpressure.in_flight();
            warn!(remaining, "shutdown timeout reached");
            return Err(WorkerPoolError::ShutdownTimeout(remaining));
        }
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Activities currently executing
    pub fn in_flight(&self) -> usize {
        self.backpressure.in_flight()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }
}

/// Run one claimed attempt and report its outcome
async fn execute_task(
    transport: Arc<dyn WorkerTransport>,
    handler: Option<ActivityHandler>,
    task: ClaimedTask,
    heartbeat_interval: Duration,
    _in_flight: super::backpressure::InFlight,
) {
    let task_id = task.id;
    let attempt = task.attempt;

    let Some(handler) = handler else {
        warn!(activity_type = %task.activity_type, "no handler registered");
        let error = ActivityError::unknown_activity(&task.activity_type);
        if let Err(e) = transport.fail_task(task_id, attempt, error).await {
            error!(%task_id, error = %e, "failed to report missing handler");
        }
        return;
    };

    let token = CancellationToken::new();
    let (heartbeat_tx, heartbeat_rx) = mpsc::channel(16);
    let ctx = ActivityContext::new(
        task_id,
        task.workflow_id.clone(),
        task.run_id,
        task.activity_id.clone(),
        attempt,
        task.max_attempts,
    )
    .with_heartbeat(heartbeat_tx)
    .with_cancellation(token.clone());

    let forwarder = tokio::spawn(forward_heartbeats(
        Arc::clone(&transport),
        task_id,
        attempt,
        heartbeat_interval,
        heartbeat_rx,
        token.clone(),
    ));

    debug!(%task_id, activity_id = %task.activity_id, attempt, "executing activity");
    let result = handler(ctx, task.input).await;
    forwarder.abort();

    let reported = match result {
        Ok(output) => transport.complete_task(task_id, attempt, output).await,
        Err(error) => {
            if token.is_cancelled() {
                debug!(%task_id, "activity stopped after cancellation");
            }
            transport.fail_task(task_id, attempt, error).await
        }
    };
    if let Err(e) = reported {
        error!(%task_id, attempt, error = %e, "failed to report activity result");
    }
}

/// Forward activity heartbeats, at most one per `interval`
///
/// Details arriving inside the window are coalesced; the latest wins. The
/// token is cancelled once the dispatcher reports the attempt should stop.
async fn forward_heartbeats(
    transport: Arc<dyn WorkerTransport>,
    task_id: Uuid,
    attempt: u32,
    interval: Duration,
    mut heartbeats: mpsc::Receiver<HeartbeatPayload>,
    token: CancellationToken,
) {
    let mut pending: Option<Option<serde_json::Value>> = None;
    let mut next_send = tokio::time::Instant::now();

    loop {
        tokio::select! {
            payload = heartbeats.recv() => match payload {
                Some(payload) => pending = Some(payload.details),
                None => break,
            },
            _ = tokio::time::sleep_until(next_send), if pending.is_some() => {
                let details = pending.take().flatten();
                next_send = tokio::time::Instant::now() + interval;
                match transport.heartbeat(task_id, attempt, details).await {
                    Ok(response) if response.should_cancel || !response.accepted => {
                        debug!(%task_id, attempt, "dispatcher asked activity to stop");
                        token.cancel();
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%task_id, error = %e, "heartbeat failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::HeartbeatResponse;
    use crate::workflow::ActivityOptions;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Default)]
    struct Recorder {
        queue: Mutex<Vec<ClaimedTask>>,
        completed: Mutex<Vec<(Uuid, Value)>>,
        failed: Mutex<Vec<(Uuid, ActivityError)>>,
        heartbeats: Mutex<Vec<Option<Value>>>,
        cancel: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl WorkerTransport for Recorder {
        async fn poll_tasks(
            &self,
            _worker_id: &str,
            queues: &[String],
            max_tasks: usize,
        ) -> anyhow::Result<Vec<ClaimedTask>> {
            let mut queue = self.queue.lock();
            let mut claimed = Vec::new();
            while claimed.len() < max_tasks {
                match queue.iter().position(|t| queues.contains(&t.task_queue)) {
                    Some(i) => claimed.push(queue.remove(i)),
                    None => break,
                }
            }
            Ok(claimed)
        }

        async fn complete_task(&self, task_id: Uuid, _: u32, result: Value) -> anyhow::Result<()> {
            self.completed.lock().push((task_id, result));
            Ok(())
        }

        async fn fail_task(&self, task_id: Uuid, _: u32, error: ActivityError) -> anyhow::Result<()> {
            self.failed.lock().push((task_id, error));
            Ok(())
        }

        async fn heartbeat(
            &self,
            _: Uuid,
            _: u32,
            details: Option<Value>,
        ) -> anyhow::Result<HeartbeatResponse> {
            self.heartbeats.lock().push(details);
            Ok(HeartbeatResponse {
                accepted: true,
                should_cancel: self.cancel.load(std::sync::atomic::Ordering::SeqCst),
            })
        }
    }

    fn task(activity_type: &str, input: Value) -> ClaimedTask {
        ClaimedTask {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            activity_id: format!("{activity_type}-1"),
            activity_type: activity_type.to_string(),
            task_queue: activity_type.to_string(),
            input,
            options: ActivityOptions::default(),
            attempt: 1,
            max_attempts: 3,
            heartbeat_details: None,
        }
    }

    #[derive(Serialize, Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    struct Add;

    #[async_trait]
    impl Activity for Add {
        const TYPE: &'static str = "add";
        type Input = AddInput;
        type Output = i64;

        async fn execute(
            &self,
            ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            ctx.heartbeat(Some(json!({"step": "adding"})))
                .await
                .map_err(|e| ActivityError::retryable(e.to_string()))?;
            Ok(input.a + input.b)
        }
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_poller(
                PollerConfig::default()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_heartbeat_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.task_queues.is_empty());
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_executes_typed_activity() {
        let transport = Arc::new(Recorder::default());
        let job = task("add", json!({"a": 2, "b": 3}));
        let job_id = job.id;
        transport.queue.lock().push(job);

        let pool = WorkerPool::new(transport.clone(), fast_config());
        pool.register(Add);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        eventually(|| !transport.completed.lock().is_empty()).await;
        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);

        assert_eq!(*transport.completed.lock(), vec![(job_id, json!(5))]);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_bad_input_and_unknown_type_fail_permanently() {
        let transport = Arc::new(Recorder::default());
        transport.queue.lock().push(task("add", json!("nope")));
        transport.queue.lock().push(task("mystery", json!({})));

        let config = fast_config();
        let pool = WorkerPool::new(
            transport.clone(),
            WorkerPoolConfig {
                task_queues: vec!["add".to_string(), "mystery".to_string()],
                ..config
            },
        );
        pool.register(Add);
        pool.start().unwrap();

        eventually(|| transport.failed.lock().len() == 2).await;
        pool.shutdown().await.unwrap();

        let failed = transport.failed.lock();
        assert!(failed.iter().all(|(_, e)| !e.retryable));
        assert!(failed
            .iter()
            .any(|(_, e)| e.is_type(error_types::UNKNOWN_ACTIVITY)));
        assert!(failed.iter().any(|(_, e)| e.is_type(error_types::INVALID_INPUT)));
    }

    #[tokio::test]
    async fn test_cancellation_reaches_activity() {
        let transport = Arc::new(Recorder::default());
        transport
            .cancel
            .store(true, std::sync::atomic::Ordering::SeqCst);
        transport.queue.lock().push(task("wait", json!(null)));

        let pool = WorkerPool::new(transport.clone(), fast_config());
        pool.register_handler("wait", |ctx, _input| async move {
            loop {
                if ctx.heartbeat(None).await.is_err() {
                    return Err::<Value, _>(ActivityError::cancelled("stopped by dispatcher"));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        pool.start().unwrap();

        eventually(|| !transport.failed.lock().is_empty()).await;
        pool.shutdown().await.unwrap();

        let failed = transport.failed.lock();
        assert!(failed[0].1.is_type(error_types::CANCELLED));
        assert!(!transport.heartbeats.lock().is_empty());
    }
}
