//! End-to-end fetch scenarios: coalescing, failure propagation, breaker
//! fallback, and stale-while-revalidate.

mod common;

use adit::provider::{FnProvider, Provider, ProviderDescriptor, ProviderRegistry};
use adit::telemetry::{Emitter, MemorySink};
use adit::{
    BreakerConfig, CircuitState, CoreEvent, DataHub, FetchError, KindConfig, ManualClock, Params,
    RetryConfig,
};
use common::wait_until;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

fn no_retry(id: &str) -> ProviderDescriptor {
    ProviderDescriptor::new(id, Duration::from_secs(2))
        .retry(RetryConfig { max_attempts: 1, ..RetryConfig::default() })
}

fn slow_value_provider(
    id: &str,
    delay: Duration,
    value: i64,
    calls: Arc<AtomicUsize>,
) -> Arc<dyn Provider<i64>> {
    Arc::new(FnProvider::new(id, move |_params| {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }))
}

// Ten concurrent fetches of a cold key share a single provider call and
// all observe its value.
#[tokio::test]
async fn coalesces_ten_concurrent_fetches_into_one_provider_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry: ProviderRegistry<i64> = ProviderRegistry::new();
    registry.register(
        "btc-price",
        no_retry("spot"),
        slow_value_provider("spot", Duration::from_millis(200), 62_000, Arc::clone(&calls)),
    );

    let hub: Arc<DataHub<i64>> = Arc::new(DataHub::<i64>::builder().build());
    hub.register_kind(KindConfig::new("btc-price"), registry.chain("btc-price"));

    let started = Instant::now();
    let fetches = (0..10).map(|_| {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { hub.fetch("btc-price", &Params::new(), DEADLINE).await })
    });
    let results = join_all(fetches).await;
    let elapsed = started.elapsed();

    for result in results {
        let (value, _meta) = result.unwrap().unwrap();
        assert_eq!(value, 62_000);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one provider invocation");
    assert!(
        elapsed < Duration::from_secs(1),
        "ten coalesced fetches should take one provider round trip, took {:?}",
        elapsed
    );
}

// A failing primary propagates one identical error to every concurrent
// caller, and nothing is cached.
#[tokio::test]
async fn primary_failure_propagates_identically_to_all_callers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let registry: ProviderRegistry<i64> = ProviderRegistry::new();
    registry.register(
        "btc-price",
        no_retry("spot"),
        Arc::new(FnProvider::new("spot", move |_params| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err(adit::ProviderError::Malformed("boom".into()))
            })
        })),
    );

    let hub: Arc<DataHub<i64>> = Arc::new(DataHub::<i64>::builder().build());
    hub.register_kind(KindConfig::new("btc-price"), registry.chain("btc-price"));

    let fetches = (0..5).map(|_| {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move { hub.fetch("btc-price", &Params::new(), DEADLINE).await })
    });
    let errors: Vec<FetchError> = join_all(fetches)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap_err())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one provider invocation");
    for err in &errors {
        assert_eq!(*err, errors[0], "all callers receive the identical error");
        assert!(err.is_all_sources_failed());
        assert!(err.to_string().contains("boom"));
    }
    assert_eq!(hub.cache().stats().entries, 0, "failures must not be cached");
}

// Once the primary's breaker opens, the chain skips straight to the
// fallback without contacting the primary.
#[tokio::test]
async fn open_breaker_falls_back_without_calling_primary() {
    let a_calls = Arc::new(AtomicUsize::new(0));
    let a_calls2 = Arc::clone(&a_calls);
    let b_calls = Arc::new(AtomicUsize::new(0));

    let sink = MemorySink::new();
    let emitter = Emitter::new(sink.clone(), 256);

    let registry: ProviderRegistry<i64> =
        ProviderRegistry::new().with_emitter(emitter.clone());
    registry.register(
        "network-stats",
        no_retry("provider-a").breaker(BreakerConfig {
            threshold: 5,
            cool_down: Duration::from_secs(60),
            half_open: 1,
        }),
        Arc::new(FnProvider::new("provider-a", move |_params| {
            a_calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(adit::ProviderError::Status(500)) })
        })),
    );
    registry.register(
        "network-stats",
        no_retry("provider-b").fallback(),
        slow_value_provider("provider-b", Duration::ZERO, 42, Arc::clone(&b_calls)),
    );

    let hub: DataHub<i64> = DataHub::<i64>::builder().emitter(emitter).build();
    // Zero TTLs: every fetch walks the chain again.
    hub.register_kind(
        KindConfig::new("network-stats").ttls(Duration::ZERO, Duration::ZERO).swr(false),
        registry.chain("network-stats"),
    );

    // Five failures trip the breaker; the fallback still answers each time.
    for _ in 0..5 {
        let (value, meta) = hub.fetch("network-stats", &Params::new(), DEADLINE).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(meta.source, "provider-b");
    }
    assert_eq!(a_calls.load(Ordering::SeqCst), 5);

    // The sixth fetch finds the breaker open: A is not contacted.
    let (value, meta) = hub.fetch("network-stats", &Params::new(), DEADLINE).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(meta.source, "provider-b");
    assert_eq!(a_calls.load(Ordering::SeqCst), 5, "open breaker must not admit calls");
    assert_eq!(b_calls.load(Ordering::SeqCst), 6);

    assert_eq!(
        registry.breakers().snapshot()[0].state,
        CircuitState::Open,
        "provider-a breaker should be open"
    );

    // The transition was emitted for observability.
    let sink2 = sink.clone();
    assert!(
        wait_until(Duration::from_secs(1), move || {
            sink2.events().iter().any(|e| {
                matches!(
                    e,
                    CoreEvent::BreakerTransition { provider, from: CircuitState::Closed, to: CircuitState::Open }
                    if provider == "provider-a"
                )
            })
        })
        .await,
        "expected a CLOSED -> OPEN transition event for provider-a"
    );
}

// A stale entry is served immediately and refreshed in the background
// through the coalescer.
#[tokio::test]
async fn stale_entry_is_served_and_refreshed_in_background() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry: ProviderRegistry<i64> = ProviderRegistry::new();
    registry.register(
        "btc-price",
        no_retry("spot"),
        slow_value_provider("spot", Duration::from_millis(20), 200, Arc::clone(&calls)),
    );

    let clock = Arc::new(ManualClock::new());
    let hub: DataHub<i64> = DataHub::<i64>::builder().build_with_clock(clock.clone());
    hub.register_kind(
        KindConfig::new("btc-price")
            .ttls(Duration::from_secs(5), Duration::from_secs(60))
            .swr(true),
        registry.chain("btc-price"),
    );

    // Seed an entry that is already past its fresh window but within the
    // stale window: fresh_until = t0, stale_until = t0 + 60s.
    let key = adit::Fingerprint::new("btc-price", &Params::new());
    assert!(hub.cache().put(
        &key,
        100,
        Duration::ZERO,
        Duration::from_secs(60),
        "seed",
        None,
    ));

    // Ten (virtual) seconds later the entry is stale but serveable.
    clock.advance(10_000);
    let (value, meta) = hub.fetch("btc-price", &Params::new(), DEADLINE).await.unwrap();
    assert_eq!(value, 100, "stale value is returned immediately");
    assert!(meta.cached);
    assert!(!meta.degraded);
    assert_eq!(meta.source, "seed");

    // The background refresh lands a newer entry produced by the provider.
    let hub2 = &hub;
    assert!(
        wait_until(Duration::from_secs(2), || {
            let (entry, _) = hub2.cache().get(&key);
            entry.map(|e| e.value) == Some(200)
        })
        .await,
        "background refresh should replace the stale value"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (entry, status) = hub.cache().get(&key);
    assert_eq!(status, adit::EntryStatus::FreshHit);
    assert_eq!(entry.unwrap().source, "spot");
}

// When every provider fails but a stale entry survives, the hub serves it
// flagged as degraded.
#[tokio::test]
async fn degraded_stale_serve_when_all_sources_fail() {
    let registry: ProviderRegistry<i64> = ProviderRegistry::new();
    registry.register(
        "btc-price",
        no_retry("spot"),
        Arc::new(FnProvider::new("spot", |_params| {
            Box::pin(async { Err(adit::ProviderError::Status(503)) })
        })),
    );

    let clock = Arc::new(ManualClock::new());
    let hub: DataHub<i64> = DataHub::<i64>::builder().build_with_clock(clock.clone());
    // SWR off: a stale hit goes through the provider chain synchronously.
    hub.register_kind(
        KindConfig::new("btc-price")
            .ttls(Duration::from_secs(1), Duration::from_secs(60))
            .swr(false),
        registry.chain("btc-price"),
    );

    let key = adit::Fingerprint::new("btc-price", &Params::new());
    hub.cache().put(&key, 61_500, Duration::from_secs(1), Duration::from_secs(60), "spot", None);

    clock.advance(5_000);
    let (value, meta) = hub.fetch("btc-price", &Params::new(), DEADLINE).await.unwrap();
    assert_eq!(value, 61_500);
    assert!(meta.cached);
    assert!(meta.degraded, "a chain-wide failure must flag the stale serve");
}
