//! Backoff schedules for retry policies and the outbox dispatcher.

use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// `min(max, initial * multiplier^(n-1))` for attempt n (1-indexed).
    Exponential { initial: Duration, multiplier: f64, max: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Backoff::Exponential { initial, multiplier: multiplier.max(1.0), max }
    }

    /// Doubling schedule, the common case.
    pub fn doubling(initial: Duration, max: Duration) -> Self {
        Self::exponential(initial, 2.0, max)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` attempts have
    /// already failed (so the first sleep is `delay(1)`).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { initial, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(63) as i32;
                let millis = initial.as_millis() as f64 * multiplier.powi(exponent);
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64).min(*max)
                }
            }
        }
    }
}
