//! Retry decisions and backoff timing.

use std::time::Duration;

use crate::config::DownloadConfig;
use crate::error::{Error, ErrorKind};

/// Growth factor between consecutive backoff waits.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Verification failures tolerated before a task is given up.
pub const MAX_VERIFICATION_FAILURES: u32 = 2;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after waiting this long.
    Retry(Duration),
    /// The task has failed for good.
    GiveUp,
}

/// Bounded retries with exponential backoff and jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Wait before the first retry, before jitter.
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
    }

    /// Total attempts a task may make.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Jittered wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with_jitter(attempt, rand::random::<f64>())
    }

    /// Wait after failed attempt `attempt` for a jitter sample in `[0, 1)`.
    ///
    /// The result is `base * 1.5^(attempt - 1) * (0.8 + 0.4 * unit)`.
    #[must_use]
    pub fn backoff_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.5 };
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let jitter = 0.4f64.mul_add(unit, 0.8);
        let secs = self.base_delay.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent) * jitter;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Decides what follows failed attempt `attempt` (1-based).
    ///
    /// `verification_failures` counts verification failures so far, including
    /// this one if `error` is one.
    #[must_use]
    pub fn decide(&self, error: &Error, attempt: u32, verification_failures: u32) -> RetryDecision {
        match error.kind() {
            ErrorKind::Fatal | ErrorKind::Cancelled => return RetryDecision::GiveUp,
            ErrorKind::Verification if verification_failures >= MAX_VERIFICATION_FAILURES => {
                return RetryDecision::GiveUp;
            }
            _ => {}
        }
        if attempt >= self.max_attempts() {
            return RetryDecision::GiveUp;
        }
        match error {
            Error::RateLimited { retry_after } => RetryDecision::Retry(*retry_after),
            _ => RetryDecision::Retry(self.backoff(attempt)),
        }
    }
}
