//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - exponential backoff and the retry decision the
//!   dispatcher takes after every failed attempt

mod retry;

pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
