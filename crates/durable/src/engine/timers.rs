//! Durable timers
//!
//! Timers are armed by the executor in the same batch as their
//! `timer_started` event. The manager leases due timers, appends
//! `timer_fired` (which disarms the timer in the same batch) and drives the
//! run. A process that dies holding a lease leaves the timer armed; another
//! manager picks it up once the lease runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::executor::{ExecutorError, WorkflowExecutor};
use crate::config::{env_millis, env_parse};
use crate::persistence::{AppendBatch, StoreError, WorkflowEventStore};
use crate::workflow::WorkflowEvent;

/// Timer manager configuration
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// How often due timers are collected
    pub sweep_interval: Duration,

    /// How long a claimed timer stays invisible to other managers
    pub lease: Duration,

    /// Maximum timers fired per sweep
    pub batch_size: usize,

    /// Lease owner name
    pub owner: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
            batch_size: 100,
            owner: format!("timers-{}", Uuid::now_v7()),
        }
    }
}

impl TimerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval: env_millis("DURABLE_TIMER_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval),
            lease: env_millis("DURABLE_TIMER_LEASE_MS").unwrap_or(defaults.lease),
            batch_size: env_parse("DURABLE_TIMER_BATCH_SIZE").unwrap_or(defaults.batch_size),
            owner: defaults.owner,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }
}

/// Fires due timers into their runs
pub struct TimerManager<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    config: TimerConfig,
}

impl<S: WorkflowEventStore> TimerManager<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>) -> Self {
        Self::with_config(executor, TimerConfig::default())
    }

    pub fn with_config(executor: Arc<WorkflowExecutor<S>>, config: TimerConfig) -> Self {
        Self { executor, config }
    }

    /// Fire every due timer; returns how many fired
    ///
    /// A timer cancelled between the claim and the append is skipped, so a
    /// cancelled timer never produces `timer_fired`.
    #[instrument(skip(self), fields(owner = %self.config.owner))]
    pub async fn fire_due_timers(&self) -> Result<usize, ExecutorError> {
        let store = &self.executor.store;
        let due = store
            .claim_due_timers(
                &self.config.owner,
                self.executor.now(),
                self.config.lease,
                self.config.batch_size,
            )
            .await?;

        let mut fired = 0;
        for timer in due {
            let run_id = timer.run_id;
            let timer_id = timer.timer_id.clone();
            let now = self.executor.now();
            let appended = self
                .executor
                .append_with_retry(run_id, |_| {
                    AppendBatch::event(
                        now,
                        WorkflowEvent::TimerFired {
                            timer_id: timer_id.clone(),
                        },
                    )
                    .with_fired_timer(timer_id.clone())
                })
                .await;

            match appended {
                Ok(_) => {
                    fired += 1;
                    debug!(%run_id, %timer_id, fire_at = %timer.fire_at, "timer fired");
                    if let Err(e) = self.executor.process_workflow(run_id).await {
                        warn!(%run_id, error = %e, "failed to drive run after timer");
                    }
                }
                Err(ExecutorError::Store(StoreError::TimerNotFound { .. })) => {
                    debug!(%run_id, %timer_id, "timer disarmed before firing");
                }
                Err(ExecutorError::Store(StoreError::ExecutionClosed { .. })) => {
                    store
                        .complete_timer(run_id, &timer_id, &self.config.owner, self.executor.now())
                        .await?;
                }
                Err(e) => error!(%run_id, %timer_id, error = %e, "failed to fire timer"),
            }
        }
        Ok(fired)
    }

    /// Fire timers until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        info!(owner = %self.config.owner, "timer manager started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.fire_due_timers().await {
                        error!(error = %e, "timer sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("timer manager exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use crate::clock::{Clock, ManualClock};
    use crate::persistence::{InMemoryWorkflowEventStore, WorkflowStatus};
    use crate::workflow::{Workflow, WorkflowAction, WorkflowContext};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    /// Sleeps for a minute, then completes with the workflow time
    struct Nap;

    impl Workflow for Nap {
        const TYPE: &'static str = "nap";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::timer("wake", Duration::from_secs(60))]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, _timer_id: &str) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(json!(ctx.now().to_rfc3339()))]
        }
    }

    fn setup(config: TimerConfig) -> (Arc<ManualClock>, TimerManager<InMemoryWorkflowEventStore>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new())
            .with_clock(clock.clone());
        executor.register::<Nap>();
        (clock, TimerManager::with_config(Arc::new(executor), config))
    }

    #[tokio::test]
    async fn test_timer_fires_only_when_due() {
        let (clock, timers) = setup(TimerConfig::default());
        let executor = timers.executor.clone();
        executor
            .start_workflow_by_type("nap-1", Nap::TYPE, json!({}))
            .await
            .unwrap();

        assert_eq!(timers.fire_due_timers().await.unwrap(), 0);

        clock.advance(Duration::from_secs(60));
        assert_eq!(timers.fire_due_timers().await.unwrap(), 1);

        let info = executor.describe("nap-1").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        // Workflow time at delivery is the recording time of timer_fired
        assert_eq!(info.result, Some(json!("2024-01-01T00:01:00+00:00")));

        assert_eq!(timers.fire_due_timers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lease_from_dead_manager_expires() {
        let (clock, timers) = setup(TimerConfig::default().with_lease(Duration::from_secs(10)));
        let executor = timers.executor.clone();
        let run_id = executor
            .start_workflow_by_type("nap-2", Nap::TYPE, json!({}))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(60));

        // A manager claims the timer and dies before firing it
        let claimed = executor
            .store()
            .claim_due_timers("crashed", clock.now(), Duration::from_secs(10), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(timers.fire_due_timers().await.unwrap(), 0);

        clock.advance(Duration::from_secs(11));
        assert_eq!(timers.fire_due_timers().await.unwrap(), 1);
        assert_eq!(
            executor.store().get_execution(run_id).await.unwrap().status,
            WorkflowStatus::Completed
        );
    }
}
