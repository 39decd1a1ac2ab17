//! Retry policy with backoff, jitter, a retry predicate, and a wall-clock
//! budget so retries never outlive the caller's deadline.

use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::{Backoff, Jitter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Declarative retry settings, as carried by a provider descriptor.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: Send,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Policy matching a `RetryConfig`: exponential backoff with the
    /// configured multiplier and the ranged 0.5–1.5 jitter factor.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::builder()
            .max_attempts(config.max_attempts.max(1))
            .backoff(Backoff::exponential(
                config.initial_delay,
                config.multiplier,
                config.max_delay,
            ))
            .with_jitter(Jitter::ranged())
            .build()
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// A `budget`, when given, bounds total wall clock: once the next sleep
    /// would cross it the last error is returned without sleeping. The
    /// predicate decides retryability; the first non-retryable error is
    /// returned as-is.
    pub async fn execute<T, Fut, Op>(
        &self,
        budget: Option<Duration>,
        mut operation: Op,
    ) -> Result<T, E>
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = self.clock.now_millis();
        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.should_retry)(&e) || attempt == self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    if let Some(budget) = budget {
                        let elapsed = Duration::from_millis(
                            self.clock.now_millis().saturating_sub(started),
                        );
                        if elapsed + delay >= budget {
                            tracing::debug!(
                                attempt,
                                ?elapsed,
                                ?budget,
                                "retry budget exhausted; surfacing last error"
                            );
                            return Err(e);
                        }
                    }
                    self.sleeper.sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop returns from the final attempt")
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl<E> RetryPolicyBuilder<E> {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::doubling(Duration::from_millis(100), Duration::from_secs(5)),
            jitter: Jitter::ranged(),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Values below 1 are clamped to a single attempt.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            clock: self.clock,
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn success_on_first_attempt_runs_once() {
        let policy: RetryPolicy<TestError> =
            RetryPolicy::builder().max_attempts(3).with_sleeper(InstantSleeper).build();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let result = policy
            .execute(None, || {
                let count = count2.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy: RetryPolicy<TestError> =
            RetryPolicy::builder().max_attempts(5).with_sleeper(InstantSleeper).build();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let result = policy
            .execute(None, || {
                let count = count2.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError("transient".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let policy: RetryPolicy<TestError> =
            RetryPolicy::builder().max_attempts(3).with_sleeper(InstantSleeper).build();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let result: Result<(), _> = policy
            .execute(None, || {
                let count = count2.clone();
                async move {
                    let n = count.fetch_add(1, Ordering::SeqCst);
                    Err(TestError(format!("attempt {}", n)))
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), TestError("attempt 2".into()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(5)
            .with_sleeper(InstantSleeper)
            .should_retry(|e: &TestError| e.0 != "fatal")
            .build();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let result: Result<(), _> = policy
            .execute(None, || {
                let count = count2.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("fatal".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_schedule_is_followed() {
        let sleeper = TrackingSleeper::new();
        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(4)
            .backoff(Backoff::doubling(Duration::from_millis(100), Duration::from_secs(10)))
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .build();

        let _: Result<(), _> =
            policy.execute(None, || async { Err(TestError("always".into())) }).await;

        assert_eq!(
            sleeper.calls(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test]
    async fn budget_stops_retries_early() {
        let clock = ManualClock::new();
        let sleeper = TrackingSleeper::new();
        let policy: RetryPolicy<TestError> = RetryPolicy::builder()
            .max_attempts(10)
            .backoff(Backoff::constant(Duration::from_millis(600)))
            .with_jitter(Jitter::None)
            .with_sleeper(sleeper.clone())
            .with_clock(clock.clone())
            .build();

        // A 1s budget fits one 600ms sleep but not two.
        let budget = Some(Duration::from_secs(1));
        let clock2 = clock.clone();
        let result: Result<(), _> = policy
            .execute(budget, || {
                // Each attempt consumes 500ms of virtual time.
                clock2.advance(500);
                async { Err(TestError("slow".into())) }
            })
            .await;

        assert!(result.is_err());
        // First attempt at t=500 could not sleep 600ms within the 1s budget.
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn from_config_respects_attempt_count() {
        let config = RetryConfig { max_attempts: 2, ..RetryConfig::default() };
        let policy: RetryPolicy<TestError> = RetryPolicy::from_config(&config);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let _: Result<(), _> = policy
            .execute(None, || {
                let count = count2.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("x".into()))
                }
            })
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
