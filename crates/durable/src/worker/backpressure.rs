//! Load-aware admission for worker pools
//!
//! A worker stops claiming once its in-flight activities reach the high
//! watermark and resumes only after dropping to the low watermark, so it does
//! not flap around a single threshold.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use ledgerflow_durable::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop claiming when in-flight / capacity reaches this ratio
    pub high_watermark: f64,

    /// Resume claiming when in-flight / capacity drops to this ratio
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// In-flight accounting for one worker
pub struct BackpressureState {
    config: BackpressureConfig,
    capacity: usize,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, capacity: usize) -> Self {
        Self {
            config,
            capacity: capacity.max(1),
            in_flight: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            reason: Mutex::new(None),
        }
    }

    /// How many tasks the worker may claim right now
    ///
    /// Zero while under pressure.
    pub fn admit(&self) -> usize {
        let load = self.in_flight.load(Ordering::Acquire);
        let ratio = load as f64 / self.capacity as f64;

        if self.accepting.load(Ordering::Acquire) {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Release);
                *self.reason.lock() = Some(format!(
                    "load {:.0}% at or above high watermark",
                    ratio * 100.0
                ));
                return 0;
            }
        } else if ratio <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Release);
            *self.reason.lock() = None;
        } else {
            return 0;
        }
        self.capacity.saturating_sub(load)
    }

    /// Count one activity as in flight until the guard drops
    pub fn track(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            state: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Why the worker stopped claiming, if it did
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Stop claiming regardless of load
    pub fn pause(&self, reason: &str) {
        self.accepting.store(false, Ordering::Release);
        *self.reason.lock() = Some(reason.to_string());
    }
}

/// Guard returned by [`BackpressureState::track`]
pub struct InFlight {
    state: Arc<BackpressureState>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
