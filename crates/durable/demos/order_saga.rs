//! Order Saga Example - every engine component in one process
//!
//! Two orders go through reserve -> charge -> ship. The second order's card
//! is declined, so the workflow releases the reserved stock and fails with
//! the original error.
//!
//! Configuration comes from the environment (and `.env`, if present); see
//! `DurableConfig::from_env` and `TelemetryConfig::from_env`.
//!
//! Run with: cargo run -p ledgerflow-durable --example order_saga

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledgerflow_durable::prelude::*;
use ledgerflow_durable::telemetry::{init_telemetry, TelemetryConfig};
use ledgerflow_durable::workflow::Saga;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;

// ============================================================================
// Workflow
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    order_id: String,
    sku: String,
    quantity: u32,
    amount_cents: u64,
}

struct OrderSaga {
    order: Order,
    saga: Saga,
}

impl Workflow for OrderSaga {
    const TYPE: &'static str = "order_saga";
    type Input = Order;
    type Output = Value;

    fn new(order: Self::Input) -> Self {
        Self {
            order,
            saga: Saga::new(),
        }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_activity(
            "reserve",
            ReserveStock::TYPE,
            json!({ "sku": self.order.sku, "quantity": self.order.quantity }),
        )]
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        if self.saga.owns(activity_id) {
            return self.saga.on_compensation_result(activity_id, None).into_actions();
        }

        match activity_id {
            "reserve" => {
                self.saga.add_compensation(
                    ReleaseStock::TYPE,
                    json!({ "sku": self.order.sku, "quantity": self.order.quantity }),
                );
                vec![WorkflowAction::schedule_activity_with(
                    "charge",
                    ChargeCard::TYPE,
                    json!({ "order_id": self.order.order_id, "amount_cents": self.order.amount_cents }),
                    ActivityOptions::default()
                        .with_retry(RetryPolicy::exponential().with_max_attempts(3).with_jitter(0.2)),
                )]
            }
            "charge" => vec![WorkflowAction::complete(json!({
                "order_id": self.order.order_id,
                "payment": result,
            }))],
            _ => vec![],
        }
    }

    fn on_activity_failed(
        &mut self,
        _ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        if self.saga.owns(activity_id) {
            return self
                .saga
                .on_compensation_result(activity_id, Some(error))
                .into_actions();
        }
        let cause = WorkflowError::new(format!("{activity_id} failed: {}", error.message));
        self.saga.compensate(cause).into_actions()
    }
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StockRequest {
    sku: String,
    quantity: u32,
}

struct ReserveStock;

#[async_trait]
impl Activity for ReserveStock {
    const TYPE: &'static str = "reserve_stock";
    type Input = StockRequest;
    type Output = Value;

    async fn execute(&self, ctx: &ActivityContext, input: StockRequest) -> Result<Value, ActivityError> {
        ctx.heartbeat(Some(json!({ "sku": input.sku })))
            .await
            .map_err(|e| ActivityError::cancelled(e.to_string()))?;
        tracing::info!(sku = %input.sku, quantity = input.quantity, "stock reserved");
        Ok(json!({ "reserved": input.quantity }))
    }
}

struct ReleaseStock;

#[async_trait]
impl Activity for ReleaseStock {
    const TYPE: &'static str = "release_stock";
    type Input = StockRequest;
    type Output = Value;

    async fn execute(&self, _ctx: &ActivityContext, input: StockRequest) -> Result<Value, ActivityError> {
        tracing::info!(sku = %input.sku, quantity = input.quantity, "stock released");
        Ok(json!({ "released": input.quantity }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChargeRequest {
    order_id: String,
    amount_cents: u64,
}

/// Declines anything above the card limit
struct ChargeCard {
    limit_cents: u64,
}

#[async_trait]
impl Activity for ChargeCard {
    const TYPE: &'static str = "charge_card";
    type Input = ChargeRequest;
    type Output = Value;

    async fn execute(&self, ctx: &ActivityContext, input: ChargeRequest) -> Result<Value, ActivityError> {
        if input.amount_cents > self.limit_cents {
            return Err(ActivityError::non_retryable("card declined")
                .with_type("CARD_DECLINED")
                .with_details(json!({ "limit_cents": self.limit_cents })));
        }
        Ok(json!({
            "tx_id": format!("tx-{}-{}", input.order_id, ctx.attempt),
            "amount_cents": input.amount_cents,
        }))
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _telemetry = init_telemetry(TelemetryConfig::from_env());
    let config = DurableConfig::from_env();

    let mut executor =
        WorkflowExecutor::with_config(InMemoryWorkflowEventStore::new(), config.executor.clone());
    executor.register::<OrderSaga>();
    let executor = Arc::new(executor);

    let dispatcher = Arc::new(TaskDispatcher::with_config(
        executor.clone(),
        config.dispatcher.clone(),
    ));
    let timers = Arc::new(TimerManager::with_config(executor.clone(), config.timers.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = {
        let dispatcher = dispatcher.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { dispatcher.run(rx).await })
    };
    let timer_loop = {
        let timers = timers.clone();
        tokio::spawn(async move { timers.run(shutdown_rx).await })
    };

    let pool = WorkerPool::new(dispatcher.clone(), config.worker.clone());
    pool.register(ReserveStock);
    pool.register(ReleaseStock);
    pool.register(ChargeCard { limit_cents: 50_000 });
    pool.start()?;

    executor.recover().await?;

    let orders = [
        Order {
            order_id: "A-100".to_string(),
            sku: "espresso-machine".to_string(),
            quantity: 1,
            amount_cents: 24_900,
        },
        Order {
            order_id: "A-101".to_string(),
            sku: "grand-piano".to_string(),
            quantity: 1,
            amount_cents: 1_250_000,
        },
    ];
    for order in &orders {
        executor
            .start_workflow::<OrderSaga>(&order.order_id, order.clone())
            .await?;
    }

    for order in &orders {
        let status = wait_for_close(&executor, &order.order_id).await?;
        let info = executor.describe(&order.order_id).await?;
        match status {
            WorkflowStatus::Completed => {
                tracing::info!(order_id = %order.order_id, result = ?info.result, "order completed")
            }
            other => tracing::warn!(
                order_id = %order.order_id,
                status = %other,
                error = ?info.error,
                "order did not complete"
            ),
        }
        for event in executor.history(&order.order_id).await? {
            tracing::info!(order_id = %order.order_id, seq = event.sequence, kind = event.event.kind());
        }
    }

    pool.shutdown().await?;
    shutdown_tx.send(true)?;
    sweeper.await?;
    timer_loop.await?;
    Ok(())
}

async fn wait_for_close(
    executor: &WorkflowExecutor<InMemoryWorkflowEventStore>,
    workflow_id: &str,
) -> anyhow::Result<WorkflowStatus> {
    for _ in 0..500 {
        let status = executor.get_execution_status(workflow_id).await?;
        if status.is_terminal() {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("workflow {workflow_id} did not close in time")
}
