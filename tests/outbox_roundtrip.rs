//! Outbox-to-consumer delivery: producer dedupe, at-least-once delivery
//! with consumer-side idempotency, and DLQ replay end to end.

use adit::backoff::Backoff;
use adit::dispatch::{
    replay_dlq, Dispatcher, DispatcherConfig, MemoryPublisher, ReplayFilter,
};
use adit::store::{InboxStore, MemoryInboxStore, MemoryOutboxStore, NewEvent, OutboxStore};
use adit::InstantSleeper;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn event(key: &str, partition: &str) -> NewEvent {
    NewEvent {
        kind: "invoice.created".into(),
        partition_key: partition.into(),
        payload: br#"{"invoice_id": 7, "total_usd": "129.00"}"#.to_vec(),
        idempotency_key: key.into(),
    }
}

fn dispatcher(store: &MemoryOutboxStore, publisher: &MemoryPublisher) -> Dispatcher {
    Dispatcher::new(
        Arc::new(store.clone()),
        Arc::new(publisher.clone()),
        DispatcherConfig {
            max_attempts: 3,
            backoff: Backoff::constant(Duration::ZERO),
            ..DispatcherConfig::default()
        },
    )
    .with_sleeper(InstantSleeper)
}

/// A consumer that performs its side effect only when the inbox says the
/// delivery is new.
struct Consumer {
    inbox: MemoryInboxStore,
    group: String,
    side_effects: AtomicUsize,
}

impl Consumer {
    fn new(group: &str) -> Self {
        Self {
            inbox: MemoryInboxStore::new(),
            group: group.into(),
            side_effects: AtomicUsize::new(0),
        }
    }

    async fn deliver(&self, event_id: &str) {
        if self.inbox.mark_if_new(event_id, &self.group).await.unwrap() {
            self.side_effects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// Two business transactions with the same idempotency key produce one
// outbox row; double delivery of the published event produces one consumer
// side effect.
#[tokio::test]
async fn at_least_once_delivery_with_dedupe_on_both_sides() {
    let store = MemoryOutboxStore::new();
    let publisher = MemoryPublisher::new();
    let dispatcher = dispatcher(&store, &publisher);

    // Producer side: the second enqueue under key K is dropped.
    let first = store.enqueue(event("K", "tenant-9")).await.unwrap();
    let second = store.enqueue(event("K", "tenant-9")).await.unwrap();
    assert!(first.is_some());
    assert!(second.is_none(), "unique constraint must drop the duplicate");
    assert_eq!(store.records().len(), 1);

    dispatcher.tick().await.unwrap();
    let published = publisher.published();
    assert_eq!(published.len(), 1, "broker receives exactly one publish for K");

    // Consumer side: the same event delivered twice has one effect.
    let consumer = Consumer::new("billing");
    consumer.deliver(&published[0].idempotency_key).await;
    consumer.deliver(&published[0].idempotency_key).await;
    assert_eq!(consumer.side_effects.load(Ordering::SeqCst), 1);

    // A different consumer group is independent.
    let reporting = Consumer::new("reporting");
    reporting.deliver(&published[0].idempotency_key).await;
    assert_eq!(reporting.side_effects.load(Ordering::SeqCst), 1);
}

// A record that keeps failing transits retry -> DLQ -> replay -> publish,
// with the replayed record carrying a salted idempotency key.
#[tokio::test]
async fn failed_event_round_trips_through_dlq_and_replay() {
    let store = MemoryOutboxStore::new();
    let publisher = MemoryPublisher::new();
    let dispatcher = dispatcher(&store, &publisher);

    store.enqueue(event("K", "tenant-9")).await.unwrap();
    publisher.fail_next(10);

    // max_attempts = 3: two retries, then dead-lettered.
    assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
    assert_eq!(dispatcher.tick().await.unwrap().retried, 1);
    assert_eq!(dispatcher.tick().await.unwrap().dead_lettered, 1);
    assert!(store.records().is_empty());

    let dlq = store.dlq();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].event_id, "K");
    assert_eq!(dlq[0].retry_count, 2);
    assert!(dlq[0].replayed_at.is_none());

    // Broker recovered; replay the window.
    publisher.fail_next(0);
    let report = replay_dlq(&store, &ReplayFilter::default()).await.unwrap();
    assert_eq!(report.requeued, 1);

    dispatcher.tick().await.unwrap();
    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert!(published[0].idempotency_key.starts_with("K:replay:"));
    assert_eq!(published[0].payload, event("K", "tenant-9").payload);
    assert!(store.dlq()[0].replayed_at.is_some());
}

// Partition order survives a multi-partition backlog with interleaved ids.
#[tokio::test]
async fn partition_order_is_preserved_across_ticks() {
    let store = MemoryOutboxStore::new();
    let publisher = MemoryPublisher::new();
    let dispatcher = dispatcher(&store, &publisher);

    for i in 0..10 {
        let partition = if i % 2 == 0 { "rig-a" } else { "rig-b" };
        store
            .enqueue(NewEvent {
                kind: "telemetry.sample".into(),
                partition_key: partition.into(),
                payload: format!("{{\"seq\": {}}}", i).into_bytes(),
                idempotency_key: format!("sample-{}", i),
            })
            .await
            .unwrap();
    }

    // A transient failure in the middle defers the rest of rig-a.
    publisher.fail_next(1);
    dispatcher.tick().await.unwrap();
    dispatcher.tick().await.unwrap();

    let published = publisher.published();
    assert_eq!(published.len(), 10);
    for partition in ["rig-a", "rig-b"] {
        let sequence: Vec<String> = published
            .iter()
            .filter(|e| e.partition_key == partition)
            .map(|e| e.idempotency_key.clone())
            .collect();
        let mut sorted = sequence.clone();
        sorted.sort_by_key(|k| {
            k.rsplit('-').next().and_then(|n| n.parse::<u32>().ok()).unwrap_or(0)
        });
        assert_eq!(sequence, sorted, "per-partition id order must hold for {}", partition);
    }
}
