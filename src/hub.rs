//! The data hub: typed fetch over cache, coalescer, and provider chains.
//!
//! Per resource kind the hub is configured with freshness windows, a
//! deadline, an ordered provider chain, and the stale-while-revalidate
//! flag. The cache knows nothing about the coalescer and vice versa; this
//! module owns the orchestration between them.

use crate::cache::{CacheConfig, CacheStore, EntryStatus};
use crate::clock::{Clock, MonotonicClock};
use crate::coalesce::Coalescer;
use crate::error::FetchError;
use crate::fingerprint::{Fingerprint, Params};
use crate::provider::RegisteredProvider;
use crate::telemetry::{CoreEvent, Emitter, FetchStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Per-kind fetch policy.
#[derive(Debug, Clone)]
pub struct KindConfig {
    pub name: String,
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    /// Deadline for the provider chain walk (the coalescer primary).
    pub deadline: Duration,
    /// Serve stale immediately and refresh in the background.
    pub swr: bool,
    /// Cap on concurrent provider calls for this kind.
    pub max_concurrent: Option<usize>,
}

impl KindConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fresh_ttl: Duration::from_secs(30),
            stale_ttl: Duration::from_secs(300),
            deadline: Duration::from_secs(5),
            swr: true,
            max_concurrent: None,
        }
    }

    pub fn ttls(mut self, fresh: Duration, stale: Duration) -> Self {
        self.fresh_ttl = fresh;
        self.stale_ttl = stale;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn swr(mut self, swr: bool) -> Self {
        self.swr = swr;
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit);
        self
    }
}

/// How a fetched value came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMeta {
    /// The value came out of the cache rather than a provider call.
    pub cached: bool,
    /// A stale value was served because the whole chain failed.
    pub degraded: bool,
    /// Provider id that produced the value.
    pub source: String,
    /// Monotonic millis at which the value was produced.
    pub fetched_at: u64,
}

/// Value produced by one chain walk, as broadcast through the coalescer.
#[derive(Debug, Clone)]
struct Fetched<T> {
    value: T,
    source: String,
    fetched_at: u64,
}

struct Kind<T> {
    config: KindConfig,
    chain: Vec<Arc<RegisteredProvider<T>>>,
    limiter: Option<Arc<Semaphore>>,
}

/// Composes the cache, the coalescer, and provider chains into
/// `fetch`/`invalidate`/`probe`.
pub struct DataHub<T> {
    cache: Arc<CacheStore<T>>,
    coalescer: Arc<Coalescer<Fetched<T>>>,
    kinds: Mutex<HashMap<String, Arc<Kind<T>>>>,
    clock: Arc<dyn Clock>,
    emitter: Emitter,
}

/// Builder mirroring how the rest of the core is assembled.
pub struct DataHubBuilder {
    cache: CacheConfig,
    max_inflight_age: Duration,
    emitter: Emitter,
}

impl Default for DataHubBuilder {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            max_inflight_age: Duration::from_secs(60),
            emitter: Emitter::disabled(),
        }
    }
}

impl DataHubBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    /// Watchdog bound for coalescer slots.
    pub fn max_inflight_age(mut self, age: Duration) -> Self {
        self.max_inflight_age = age;
        self
    }

    pub fn emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn build<T: Clone + Send + Sync + 'static>(self) -> DataHub<T> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        self.build_with_clock(clock)
    }

    /// Build against a shared clock (deterministic tests).
    pub fn build_with_clock<T: Clone + Send + Sync + 'static>(
        self,
        clock: Arc<dyn Clock>,
    ) -> DataHub<T> {
        DataHub {
            cache: Arc::new(
                CacheStore::new(self.cache)
                    .with_clock(HubClock(Arc::clone(&clock)))
                    .with_emitter(self.emitter.clone()),
            ),
            coalescer: Arc::new(
                Coalescer::new(self.max_inflight_age).with_clock(HubClock(Arc::clone(&clock))),
            ),
            kinds: Mutex::new(HashMap::new()),
            clock,
            emitter: self.emitter,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DataHub<T> {
    pub fn builder() -> DataHubBuilder {
        DataHubBuilder::new()
    }

    /// Register (or replace) a kind with its provider chain.
    pub fn register_kind(&self, config: KindConfig, chain: Vec<Arc<RegisteredProvider<T>>>) {
        let limiter = config.max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let name = config.name.clone();
        let kind = Arc::new(Kind { config, chain, limiter });
        self.kinds.lock().unwrap_or_else(|p| p.into_inner()).insert(name, kind);
    }

    /// Direct access to the cache store (stats, sweeping, seeding).
    pub fn cache(&self) -> &CacheStore<T> {
        &self.cache
    }

    /// Fetch a value for `(kind, params)` within `deadline`.
    pub async fn fetch(
        &self,
        kind: &str,
        params: &Params,
        deadline: Duration,
    ) -> Result<(T, FetchMeta), FetchError> {
        let kind = self.kind(kind)?;
        let key = Fingerprint::new(&kind.config.name, params);

        match self.cache.get(&key) {
            (Some(entry), EntryStatus::FreshHit) => {
                return Ok((entry.value.clone(), Self::cached_meta(&entry, false)));
            }
            (Some(entry), EntryStatus::StaleHit) if kind.config.swr => {
                self.spawn_refresh(Arc::clone(&kind), key, params.clone());
                return Ok((entry.value.clone(), Self::cached_meta(&entry, false)));
            }
            _ => {}
        }

        let compute = self.chain_compute(Arc::clone(&kind), key.clone(), params.clone());
        let result = self
            .coalescer
            .run(&key, deadline, kind.config.deadline, move || compute)
            .await;

        match result {
            Ok(fetched) => Ok((
                fetched.value,
                FetchMeta {
                    cached: false,
                    degraded: false,
                    source: fetched.source,
                    fetched_at: fetched.fetched_at,
                },
            )),
            Err(err) if err.is_all_sources_failed() => {
                // Degrade to a stale entry if one is still serveable.
                if let (Some(entry), EntryStatus::StaleHit) = self.cache.get(&key) {
                    self.emitter.emit(CoreEvent::Fetch {
                        source: entry.source.clone(),
                        key: key.to_string(),
                        status: FetchStatus::Stale,
                        latency_ms: 0,
                        details: Some(err.to_string()),
                    });
                    tracing::warn!(key = %key, error = %err, "serving stale value, all providers failed");
                    Ok((entry.value.clone(), Self::cached_meta(&entry, true)))
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Drop any cached value for `(kind, params)`.
    pub fn invalidate(&self, kind: &str, params: &Params) -> Result<bool, FetchError> {
        let kind = self.kind(kind)?;
        Ok(self.cache.invalidate(&Fingerprint::new(&kind.config.name, params)))
    }

    /// Walk the provider chain once, bypassing cache reads.
    ///
    /// Startup readiness hook: embedders gate traffic until one probe per
    /// kind succeeds. A successful probe warms the cache.
    pub async fn probe(&self, kind: &str, params: &Params) -> Result<(), FetchError> {
        let kind = self.kind(kind)?;
        let key = Fingerprint::new(&kind.config.name, params);
        let compute = self.chain_compute(Arc::clone(&kind), key.clone(), params.clone());
        let deadline = kind.config.deadline;
        self.coalescer.run(&key, deadline, deadline, move || compute).await.map(|_| ())
    }

    fn kind(&self, name: &str) -> Result<Arc<Kind<T>>, FetchError> {
        self.kinds
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| FetchError::UnknownKind { kind: name.to_string() })
    }

    fn cached_meta(entry: &crate::cache::CacheEntry<T>, degraded: bool) -> FetchMeta {
        FetchMeta {
            cached: true,
            degraded,
            source: entry.source.clone(),
            fetched_at: entry.created_at,
        }
    }

    /// Best-effort background refresh through the coalescer; failures are
    /// logged and swallowed.
    fn spawn_refresh(&self, kind: Arc<Kind<T>>, key: Fingerprint, params: Params) {
        let coalescer = Arc::clone(&self.coalescer);
        let deadline = kind.config.deadline;
        let compute = self.chain_compute(kind, key.clone(), params);
        tokio::spawn(async move {
            if let Err(err) = coalescer.run(&key, deadline, deadline, move || compute).await {
                tracing::debug!(key = %key, error = %err, "background refresh failed");
            }
        });
    }

    /// The coalesced computation: walk the chain in order, cache the first
    /// success, emit one fetch event per provider attempt.
    fn chain_compute(
        &self,
        kind: Arc<Kind<T>>,
        key: Fingerprint,
        params: Params,
    ) -> impl std::future::Future<Output = Result<Fetched<T>, FetchError>> + Send + 'static {
        let cache = Arc::clone(&self.cache);
        let clock = Arc::clone(&self.clock);
        let emitter = self.emitter.clone();
        async move {
            let budget = kind.config.deadline;
            let mut last_error = None;
            for registered in &kind.chain {
                let _permit = match &kind.limiter {
                    Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                    None => None,
                };

                let started = clock.now_millis();
                match registered.call(&params, budget).await {
                    Ok(value) => {
                        let now = clock.now_millis();
                        cache.put(
                            &key,
                            value.clone(),
                            kind.config.fresh_ttl,
                            kind.config.stale_ttl,
                            registered.id(),
                            None,
                        );
                        emitter.emit(CoreEvent::Fetch {
                            source: registered.id().to_string(),
                            key: key.to_string(),
                            status: FetchStatus::Ok,
                            latency_ms: now.saturating_sub(started),
                            details: None,
                        });
                        return Ok(Fetched {
                            value,
                            source: registered.id().to_string(),
                            fetched_at: now,
                        });
                    }
                    Err(err) => {
                        let status = match &err {
                            FetchError::Timeout { .. } => FetchStatus::Timeout,
                            _ => FetchStatus::Error,
                        };
                        emitter.emit(CoreEvent::Fetch {
                            source: registered.id().to_string(),
                            key: key.to_string(),
                            status,
                            latency_ms: clock.now_millis().saturating_sub(started),
                            details: Some(err.to_string()),
                        });
                        tracing::warn!(
                            provider = registered.id(),
                            key = %key,
                            error = %err,
                            "provider failed, trying next in chain"
                        );
                        last_error = Some(err.to_string());
                    }
                }
            }
            Err(FetchError::AllSourcesFailed {
                kind: kind.config.name.clone(),
                providers_tried: kind.chain.len(),
                last_error,
            })
        }
    }
}

// Adapter so the hub's shared clock can be installed into components whose
// builders take ownership of a concrete Clock.
#[derive(Clone)]
struct HubClock(Arc<dyn Clock>);

impl std::fmt::Debug for HubClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HubClock")
    }
}

impl Clock for HubClock {
    fn now_millis(&self) -> u64 {
        self.0.now_millis()
    }
}
