//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to indicate liveness
//! - Support cooperative cancellation via tokens

mod context;
mod definition;

pub use context::{ActivityContext, HeartbeatError, HeartbeatPayload};
pub use definition::{error_types, Activity, ActivityError};
