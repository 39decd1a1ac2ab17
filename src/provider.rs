//! External data providers and the guarded call path around them.
//!
//! Each resource kind owns an ordered chain of providers. A single guarded
//! call wraps the provider in, from the outside in: retry with backoff and
//! jitter (bounded by the caller's budget), breaker admission, a
//! per-attempt timeout, and a payload sanity predicate.

use crate::breaker::{Breaker, BreakerConfig, BreakerRegistry};
use crate::clock::Clock;
use crate::error::FetchError;
use crate::fingerprint::Params;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::sleeper::Sleeper;
use crate::telemetry::Emitter;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Error returned by a provider implementation for one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The upstream did not answer in time.
    Timeout,
    /// The connection dropped mid-flight.
    ConnectionReset,
    /// The upstream is unreachable (DNS, refused connection, broker down).
    Unavailable(String),
    /// HTTP-style status from the upstream.
    Status(u16),
    /// The response arrived but could not be decoded.
    Malformed(String),
    /// Credentials were rejected.
    Auth(String),
}

impl ProviderError {
    /// Transient conditions worth retrying: timeouts, resets, unreachable
    /// upstreams, 5xx, and 429. Everything else fails the provider fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionReset | Self::Unavailable(_) => true,
            Self::Status(code) => *code == 429 || (500..=599).contains(code),
            Self::Malformed(_) | Self::Auth(_) => false,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "provider call timed out"),
            Self::ConnectionReset => write!(f, "connection reset by upstream"),
            Self::Unavailable(detail) => write!(f, "upstream unavailable: {}", detail),
            Self::Status(code) => write!(f, "upstream returned status {}", code),
            Self::Malformed(detail) => write!(f, "malformed payload: {}", detail),
            Self::Auth(detail) => write!(f, "authentication failed: {}", detail),
        }
    }
}

impl std::error::Error for ProviderError {}

/// A source of values for one or more resource kinds.
#[async_trait]
pub trait Provider<T>: Send + Sync {
    fn id(&self) -> &str;
    async fn fetch(&self, params: &Params) -> Result<T, ProviderError>;
}

/// Closure-backed provider, handy for tests and thin adapters.
pub struct FnProvider<T> {
    id: String,
    f: Arc<dyn Fn(Params) -> BoxFuture<'static, Result<T, ProviderError>> + Send + Sync>,
}

impl<T> FnProvider<T> {
    pub fn new<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Params) -> BoxFuture<'static, Result<T, ProviderError>> + Send + Sync + 'static,
    {
        Self { id: id.into(), f: Arc::new(f) }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Provider<T> for FnProvider<T> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, params: &Params) -> Result<T, ProviderError> {
        (self.f)(params.clone()).await
    }
}

/// Position of a provider in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderRole {
    Primary,
    Fallback,
}

/// Immutable call policy for one registered provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub role: ProviderRole,
    /// Lower runs earlier within the same role.
    pub priority: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            role: ProviderRole::Primary,
            priority: 0,
            timeout,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }

    pub fn fallback(mut self) -> Self {
        self.role = ProviderRole::Fallback;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

/// Per-attempt outcome inside the guarded call.
#[derive(Debug, Clone)]
enum AttemptError {
    BreakerOpen,
    Validation,
    Provider(ProviderError),
}

/// A provider bound to its breaker, retry policy, and validation predicate.
pub struct RegisteredProvider<T> {
    descriptor: ProviderDescriptor,
    provider: Arc<dyn Provider<T>>,
    breaker: Breaker,
    retry: RetryPolicy<AttemptError>,
    validate: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    clock: Arc<dyn Clock>,
}

impl<T> fmt::Debug for RegisteredProvider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> RegisteredProvider<T> {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    /// One fully guarded provider call within `budget` of wall clock.
    pub async fn call(&self, params: &Params, budget: Duration) -> Result<T, FetchError> {
        let started = self.clock.now_millis();
        let result = self
            .retry
            .execute(Some(budget), || async move {
                let elapsed =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                let remaining = budget.saturating_sub(elapsed);
                if remaining.is_zero() {
                    return Err(AttemptError::Provider(ProviderError::Timeout));
                }

                let admission = match self.breaker.try_admit() {
                    Some(admission) => admission,
                    None => return Err(AttemptError::BreakerOpen),
                };

                let attempt_timeout = self.descriptor.timeout.min(remaining);
                match tokio::time::timeout(attempt_timeout, self.provider.fetch(params)).await {
                    Err(_) => {
                        self.breaker.record(admission, false);
                        Err(AttemptError::Provider(ProviderError::Timeout))
                    }
                    Ok(Err(e)) => {
                        self.breaker.record(admission, false);
                        Err(AttemptError::Provider(e))
                    }
                    Ok(Ok(value)) => {
                        if let Some(validate) = &self.validate {
                            if !validate(&value) {
                                self.breaker.record(admission, false);
                                return Err(AttemptError::Validation);
                            }
                        }
                        self.breaker.record(admission, true);
                        Ok(value)
                    }
                }
            })
            .await;

        result.map_err(|e| match e {
            AttemptError::BreakerOpen => {
                FetchError::BreakerOpen { provider: self.descriptor.id.clone() }
            }
            AttemptError::Validation => {
                FetchError::Validation { provider: self.descriptor.id.clone() }
            }
            AttemptError::Provider(e) => FetchError::Provider {
                provider: self.descriptor.id.clone(),
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
        })
    }
}

/// Catalog of providers, organized into per-kind chains.
///
/// Registration happens once at startup; descriptors are immutable after
/// that. The registry owns the breaker registry backing the
/// `Breaker.Snapshot` observability surface.
pub struct ProviderRegistry<T> {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    emitter: Emitter,
    breakers: BreakerRegistry,
    chains: Mutex<HashMap<String, Vec<Arc<RegisteredProvider<T>>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ProviderRegistry<T> {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(crate::clock::MonotonicClock::default()),
            sleeper: Arc::new(crate::sleeper::TokioSleeper),
            emitter: Emitter::disabled(),
            breakers: BreakerRegistry::new(),
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Register a provider at the end of a kind's chain.
    pub fn register(
        &self,
        kind: &str,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn Provider<T>>,
    ) -> Arc<RegisteredProvider<T>> {
        self.register_validated_inner(kind, descriptor, provider, None)
    }

    /// Register a provider with a payload sanity predicate.
    pub fn register_validated<F>(
        &self,
        kind: &str,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn Provider<T>>,
        validate: F,
    ) -> Arc<RegisteredProvider<T>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register_validated_inner(kind, descriptor, provider, Some(Arc::new(validate)))
    }

    fn register_validated_inner(
        &self,
        kind: &str,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn Provider<T>>,
        validate: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    ) -> Arc<RegisteredProvider<T>> {
        let breaker = Breaker::new(descriptor.id.clone(), descriptor.breaker.clone())
            .with_clock(SharedClock(Arc::clone(&self.clock)))
            .with_emitter(self.emitter.clone());
        self.breakers.register(breaker.clone());

        let retry = RetryPolicy::builder()
            .max_attempts(descriptor.retry.max_attempts)
            .backoff(crate::Backoff::exponential(
                descriptor.retry.initial_delay,
                descriptor.retry.multiplier,
                descriptor.retry.max_delay,
            ))
            .with_jitter(crate::Jitter::ranged())
            .with_sleeper(SharedSleeper(Arc::clone(&self.sleeper)))
            .with_clock(SharedClock(Arc::clone(&self.clock)))
            .should_retry(|e: &AttemptError| {
                matches!(e, AttemptError::Provider(p) if p.is_retryable())
            })
            .build();

        let registered = Arc::new(RegisteredProvider {
            descriptor,
            provider,
            breaker,
            retry,
            validate,
            clock: Arc::clone(&self.clock),
        });

        let mut chains = self.chains.lock().unwrap_or_else(|p| p.into_inner());
        let chain = chains.entry(kind.to_string()).or_default();
        chain.push(Arc::clone(&registered));
        chain.sort_by_key(|p| (p.descriptor.role, p.descriptor.priority));
        registered
    }

    /// Ordered chain for a kind: primaries before fallbacks, then priority.
    pub fn chain(&self, kind: &str) -> Vec<Arc<RegisteredProvider<T>>> {
        self.chains
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Breaker snapshots for observability.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }
}

// Newtype adapters so an already-shared clock/sleeper can be handed to
// builders that take ownership.
#[derive(Clone)]
struct SharedClock(Arc<dyn Clock>);

impl fmt::Debug for SharedClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedClock")
    }
}

impl Clock for SharedClock {
    fn now_millis(&self) -> u64 {
        self.0.now_millis()
    }
}

#[derive(Clone)]
struct SharedSleeper(Arc<dyn Sleeper>);

impl fmt::Debug for SharedSleeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSleeper")
    }
}

#[async_trait]
impl Sleeper for SharedSleeper {
    async fn sleep(&self, duration: Duration) {
        self.0.sleep(duration).await
    }
}
