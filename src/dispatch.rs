//! Outbox dispatcher: committed rows become at-least-once bus events.
//!
//! Each tick claims a batch of unprocessed records in id order, groups them
//! by partition key, and publishes partitions concurrently while keeping
//! the records within a partition strictly sequential — per-key order is
//! the contract. Transient broker failures reschedule the record with
//! exponential backoff; poison records and records out of attempts go to
//! the dead-letter queue. Consumers dedupe via the inbox, so a crash
//! between publish and status update only ever causes duplicates, never
//! loss.

use crate::backoff::Backoff;
use crate::ident;
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{DlqRecord, OutboxRecord, OutboxStore, StoreError};
use crate::telemetry::{CoreEvent, Emitter, PublishStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

/// Failure classification for one publish attempt.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Broker unavailable or throttling; worth retrying later.
    #[error("transient broker error: {0}")]
    Transient(String),
    /// The record can never be published (serialization, invariant).
    #[error("poison record: {0}")]
    Poison(String),
}

/// Message bus seam. Production implementations wrap a broker client;
/// brokers are expected to dedupe on the idempotency key as a second line
/// of defense behind the consumer inbox.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        kind: &str,
        partition_key: &str,
        payload: &[u8],
        idempotency_key: &str,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Attempts before a record is dead-lettered.
    pub max_attempts: u32,
    /// Partitions published concurrently per tick.
    pub max_concurrent_partitions: usize,
    pub backoff: Backoff,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_attempts: 10,
            max_concurrent_partitions: 8,
            backoff: Backoff::doubling(Duration::from_millis(500), Duration::from_secs(60)),
        }
    }
}

/// Outcome counts for one dispatcher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn Publisher>,
    config: DispatcherConfig,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    emitter: Emitter,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn Publisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            jitter: Jitter::ranged(),
            sleeper: Arc::new(TokioSleeper),
            emitter: Emitter::disabled(),
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Poll loop; exits when `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick().await {
                Ok(report) if report.claimed > 0 => {
                    tracing::debug!(?report, "dispatcher tick");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "dispatcher tick failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Claim one batch and resolve every record in it.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let batch = self.store.claim_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(TickReport::default());
        }

        // Group into partitions, preserving id order within each.
        let mut partitions: BTreeMap<String, Vec<OutboxRecord>> = BTreeMap::new();
        for record in batch {
            partitions.entry(record.partition_key.clone()).or_default().push(record);
        }

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_partitions.max(1)));
        let report = Arc::new(Mutex::new(TickReport::default()));
        let mut tasks = Vec::new();
        for (_, records) in partitions {
            let limiter = Arc::clone(&limiter);
            let report = Arc::clone(&report);
            {
                let mut r = report.lock().unwrap_or_else(|p| p.into_inner());
                r.claimed += records.len();
            }
            tasks.push(async move {
                let _permit = limiter.acquire_owned().await;
                for (index, record) in records.iter().enumerate() {
                    let outcome = self.resolve(record).await;
                    {
                        let mut r = report.lock().unwrap_or_else(|p| p.into_inner());
                        match outcome {
                            Resolution::Published => r.published += 1,
                            Resolution::Retried => r.retried += 1,
                            Resolution::DeadLettered => r.dead_lettered += 1,
                        }
                    }
                    if matches!(outcome, Resolution::Retried) {
                        // Order within the partition: once a record is
                        // deferred, later records must wait for it. Hand
                        // their claims back so the next tick sees them.
                        for deferred in &records[index + 1..] {
                            if let Err(err) = self.store.release_claim(deferred.id).await {
                                tracing::warn!(id = deferred.id, error = %err, "failed to release claim");
                            }
                        }
                        tracing::debug!(id = record.id, "partition deferred after transient failure");
                        return;
                    }
                }
            });
        }
        futures::future::join_all(tasks).await;

        let report = *report.lock().unwrap_or_else(|p| p.into_inner());
        Ok(report)
    }

    async fn resolve(&self, record: &OutboxRecord) -> Resolution {
        let started = Instant::now();
        let publish = self
            .publisher
            .publish(&record.kind, &record.partition_key, &record.payload, &record.idempotency_key)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match publish {
            Ok(()) => {
                // A failed status update must not re-publish: the broker
                // dedupes on the idempotency key and consumers dedupe via
                // the inbox, so we only retry the update itself.
                self.with_update_retries(|| self.store.mark_processed(record.id)).await;
                self.emit(record.id, &record.kind, PublishStatus::Ok, record.attempts + 1, latency_ms);
                Resolution::Published
            }
            Err(PublishError::Poison(reason)) => {
                tracing::error!(id = record.id, kind = %record.kind, %reason, "poison record, dead-lettering");
                self.with_update_retries(|| self.store.move_to_dlq(record.id, &reason)).await;
                self.emit(record.id, &record.kind, PublishStatus::Dlq, record.attempts + 1, latency_ms);
                Resolution::DeadLettered
            }
            Err(PublishError::Transient(reason)) => {
                let attempts = record.attempts + 1;
                if attempts >= self.config.max_attempts {
                    tracing::warn!(
                        id = record.id,
                        kind = %record.kind,
                        attempts,
                        %reason,
                        "attempts exhausted, dead-lettering"
                    );
                    self.with_update_retries(|| self.store.move_to_dlq(record.id, &reason)).await;
                    self.emit(record.id, &record.kind, PublishStatus::Dlq, attempts, latency_ms);
                    Resolution::DeadLettered
                } else {
                    let retry_in = self.jitter.apply(self.config.backoff.delay(attempts as usize));
                    tracing::debug!(
                        id = record.id,
                        attempts,
                        ?retry_in,
                        %reason,
                        "transient publish failure, rescheduling"
                    );
                    self.with_update_retries(|| {
                        let reason = reason.clone();
                        async move {
                            self.store.mark_failed(record.id, &reason, retry_in).await.map(|_| ())
                        }
                    })
                    .await;
                    self.emit(record.id, &record.kind, PublishStatus::Retry, attempts, latency_ms);
                    Resolution::Retried
                }
            }
        }
    }

    /// Status updates retry in place a few times; a record left claimed
    /// after that becomes visible again when the claim expires.
    async fn with_update_retries<F, Fut>(&self, mut update: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        for attempt in 1..=3 {
            match update().await {
                Ok(()) => return,
                Err(err) if attempt < 3 => {
                    tracing::warn!(error = %err, attempt, "status update failed, retrying");
                    self.sleeper.sleep(Duration::from_millis(50 * attempt)).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "status update failed after retries");
                }
            }
        }
    }

    fn emit(&self, id: i64, kind: &str, status: PublishStatus, attempts: u32, latency_ms: u64) {
        self.emitter.emit(CoreEvent::OutboxPublish {
            id,
            kind: kind.to_string(),
            status,
            attempts,
            latency_ms,
        });
    }
}

#[derive(Clone, Copy)]
enum Resolution {
    Published,
    Retried,
    DeadLettered,
}

/// Filter for DLQ inspection and replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    /// Only entries that failed at or after this instant.
    pub failed_since: Option<DateTime<Utc>>,
    pub kind: Option<String>,
    /// Maximum entries to replay; `None` lists without bound.
    pub limit: Option<usize>,
    pub dry_run: bool,
}

/// Outcome of a replay invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub matched: usize,
    pub requeued: usize,
    /// Entries that failed to re-enqueue (store errors, key collisions).
    pub failed: usize,
}

/// List matching DLQ entries and, unless `dry_run`, re-enqueue each under
/// a fresh idempotency key derived from the original plus a random salt.
pub async fn replay_dlq(
    store: &dyn OutboxStore,
    filter: &ReplayFilter,
) -> Result<ReplayReport, StoreError> {
    let limit = filter.limit.unwrap_or(usize::MAX);
    let entries = store
        .dlq_list(filter.failed_since, filter.kind.as_deref(), limit)
        .await?;
    let mut report = ReplayReport { matched: entries.len(), ..ReplayReport::default() };
    if filter.dry_run {
        return Ok(report);
    }

    for entry in &entries {
        if entry.replayed_at.is_some() {
            continue;
        }
        let new_key = replay_key(entry);
        match store.requeue_from_dlq(entry.id, &new_key).await {
            Ok(Some(outbox_id)) => {
                tracing::info!(dlq_id = entry.id, outbox_id, key = %new_key, "replayed DLQ entry");
                report.requeued += 1;
            }
            Ok(None) => {
                tracing::warn!(dlq_id = entry.id, key = %new_key, "replay key collided");
                report.failed += 1;
            }
            Err(err) => {
                tracing::warn!(dlq_id = entry.id, error = %err, "replay failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn replay_key(entry: &DlqRecord) -> String {
    format!("{}:replay:{}", entry.event_id, ident::nonce(12))
}

/// In-memory publisher with broker-style dedupe on the idempotency key.
/// Ships with the crate so embedders and tests can run the dispatcher
/// without a broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    inner: Arc<Mutex<MemoryPublisherInner>>,
}

#[derive(Debug, Default)]
struct MemoryPublisherInner {
    published: Vec<PublishedEvent>,
    seen_keys: std::collections::HashSet<String>,
    transient_failures: u32,
    poison_kinds: std::collections::HashSet<String>,
}

/// One event accepted by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub kind: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
    pub idempotency_key: String,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events accepted so far (dedupe already applied).
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).published.clone()
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).transient_failures = n;
    }

    /// Treat every event of `kind` as poison.
    pub fn poison_kind(&self, kind: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .poison_kinds
            .insert(kind.to_string());
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        kind: &str,
        partition_key: &str,
        payload: &[u8],
        idempotency_key: &str,
    ) -> Result<(), PublishError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.poison_kinds.contains(kind) {
            return Err(PublishError::Poison(format!("unpublishable kind {}", kind)));
        }
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(PublishError::Transient("broker unavailable".into()));
        }
        if inner.seen_keys.insert(idempotency_key.to_string()) {
            inner.published.push(PublishedEvent {
                kind: kind.to_string(),
                partition_key: partition_key.to_string(),
                payload: payload.to_vec(),
                idempotency_key: idempotency_key.to_string(),
            });
        }
        Ok(())
    }
}
