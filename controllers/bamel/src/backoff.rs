//! # Exponential Backoff
//!
//! Per-key retry delays for the work queues: the first failure waits
//! `min`, every further consecutive failure doubles the wait, capped at
//! `max`.

use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `min` and never exceeding `max`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max: max.max(min) }
    }

    /// Delay before retrying after `failures` consecutive failures (stateless)
    ///
    /// Zero and one failure both wait `min`; the sequence is
    /// `min, min, 2*min, 4*min, ...` capped at `max`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return self.min;
        }
        let exponent = (failures - 1).min(31);
        self.min
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}
