//! Worker pool for activity execution
//!
//! This module provides:
//! - [`WorkerPool`] - claims tasks and runs registered activities concurrently
//! - [`WorkerTransport`] - the calls a worker makes to the dispatcher
//! - [`BackpressureConfig`] - watermark-based admission
//! - [`PollerConfig`] - polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     WorkerPool                        │
//! │  ┌─────────────┐       ┌──────────────────────────┐  │
//! │  │ TaskPoller  │──────▶│    BackpressureState     │  │
//! │  │  (backoff)  │       │ (high/low watermarks)    │  │
//! │  └──────┬──────┘       └──────────────────────────┘  │
//! │         ▼                                             │
//! │  ┌───────────────────────────────────────────────┐   │
//! │  │  Activity tasks (TaskTracker, drained on stop) │   │
//! │  │  heartbeat forwarder ─▶ CancellationToken      │   │
//! │  └───────────────────────────────────────────────┘   │
//! └─────────────────────────┬────────────────────────────┘
//!                           ▼
//!                    WorkerTransport
//!             (TaskDispatcher in-process)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ledgerflow_durable::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new(vec!["charge_card".to_string()])
//!     .with_worker_id("payments-1")
//!     .with_max_concurrency(20);
//!
//! let pool = WorkerPool::new(dispatcher.clone(), config);
//! pool.register(ChargeCard::new(gateway));
//! pool.register_handler("send_receipt", |_ctx, input| async move {
//!     Ok(json!({"sent": true, "to": input["email"]}))
//! });
//!
//! pool.start()?;
//! // ...
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod poller;
mod pool;
mod transport;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState, InFlight};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{ActivityHandler, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use transport::WorkerTransport;
