//! Configuration loaded from environment variables
//!
//! Each component owns a plain config struct with `Default`, `with_*`
//! builders and `from_env()`. [`DurableConfig`] collects them so an
//! embedding binary can configure the whole engine in one call.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{DispatcherConfig, ExecutorConfig, TimerConfig};
use crate::worker::WorkerPoolConfig;

/// Configuration of every engine component
#[derive(Debug, Clone, Default)]
pub struct DurableConfig {
    pub executor: ExecutorConfig,
    pub dispatcher: DispatcherConfig,
    pub timers: TimerConfig,
    pub worker: WorkerPoolConfig,
}

impl DurableConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DURABLE_MAX_EVENTS`: history length guard per run (default: 10000)
    /// - `DURABLE_MAX_APPEND_RETRIES`: retries after a concurrency conflict (default: 5)
    /// - `DURABLE_UPDATE_TIMEOUT_MS`: how long `update` waits for its outcome (default: 30000)
    /// - `DURABLE_HISTORY_PAGE_SIZE`: events fetched per page on replay (default: 256)
    /// - `DURABLE_PROCESS_ON_SIGNAL`: drive the run right after a signal (default: true)
    /// - `DURABLE_TASK_SWEEP_INTERVAL_MS`: expired-task sweep period (default: 1000)
    /// - `DURABLE_TIMER_SWEEP_INTERVAL_MS`: due-timer sweep period (default: 1000)
    /// - `DURABLE_TIMER_LEASE_MS`: lease on a claimed timer (default: 30000)
    /// - `DURABLE_TIMER_BATCH_SIZE`: timers fired per sweep (default: 100)
    /// - `DURABLE_WORKER_ID`: worker identity (default: `worker-<uuid>`)
    /// - `DURABLE_WORKER_QUEUES`: comma separated queues (default: registered activity types)
    /// - `DURABLE_WORKER_MAX_CONCURRENCY`: concurrent activities per worker (default: 10)
    /// - `DURABLE_WORKER_HEARTBEAT_INTERVAL_MS`: worker heartbeat period (default: 5000)
    pub fn from_env() -> Self {
        Self {
            executor: ExecutorConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            timers: TimerConfig::from_env(),
            worker: WorkerPoolConfig::from_env(),
        }
    }
}

/// Parse an environment variable, ignoring unset or malformed values
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Duration given in milliseconds
pub(crate) fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

pub(crate) fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Durations serialize as whole milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => super::duration_millis::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
