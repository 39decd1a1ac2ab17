//! Jitter strategies to keep retries and scheduler ticks from synchronizing.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing delays.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the exact delay.
    None,
    /// Random between 0 and the delay.
    Full,
    /// Random between half the delay and the delay.
    Equal,
    /// Multiply the delay by a uniform factor in `[lo, hi)`.
    Ranged { lo: f64, hi: f64 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// The provider-retry default: a uniform factor in `[0.5, 1.5)`.
    pub fn ranged() -> Self {
        Jitter::Ranged { lo: 0.5, hi: 1.5 }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.gen_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.gen_range(millis / 2..=millis))
            }
            Jitter::Ranged { lo, hi } => {
                if millis == 0 || lo >= hi {
                    return delay;
                }
                let factor = rng.gen_range(*lo..*hi);
                Duration::from_millis((millis as f64 * factor) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn full_stays_within_zero_and_delay() {
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = Jitter::full().apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn equal_stays_within_half_and_delay() {
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = Jitter::equal().apply(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn ranged_stays_within_factor_bounds() {
        let delay = Duration::from_millis(1_000);
        for _ in 0..100 {
            let jittered = Jitter::ranged().apply(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered < Duration::from_millis(1_500));
        }
    }

    #[test]
    fn deterministic_with_seeded_rng() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(800);
        assert_eq!(
            Jitter::ranged().apply_with_rng(delay, &mut a),
            Jitter::ranged().apply_with_rng(delay, &mut b)
        );
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::full().apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::ranged().apply(Duration::ZERO), Duration::ZERO);
    }
}
