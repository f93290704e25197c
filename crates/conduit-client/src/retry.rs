//! Backoff between retry attempts.
//!
//! The executor makes `max_retries + 1` attempts and sleeps
//! [`Backoff::delay`] before each retry. Which failures are retried is not
//! decided here: only transport errors and 5xx statuses ever are.

use std::time::Duration;

/// Default unit for linear backoff.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep `k * unit` before retry `k`: 1 unit before the second attempt,
    /// 2 before the third, and so on.
    Linear { unit: Duration },
    /// Sleep `initial * 2^(k-1)` before retry `k`, never more than `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn linear(unit: Duration) -> Self {
        Backoff::Linear { unit }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff::Exponential { initial, max }
    }

    /// Delay before retry number `retry` (1-based). Retry 0 is the first
    /// attempt and never waits.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        match *self {
            Backoff::Linear { unit } => unit.saturating_mul(retry),
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(retry - 1);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Every sleep the executor makes for a given retry budget, in order.
    pub fn schedule(&self, max_retries: u32) -> Vec<Duration> {
        (1..=max_retries).map(|retry| self.delay(retry)).collect()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear {
            unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}
