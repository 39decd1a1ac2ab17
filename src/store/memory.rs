//! In-memory store implementations.
//!
//! Cloned handles share state through an `Arc`, which is how one "database"
//! gets shared between the simulated processes of a failover test.

use super::{
    DlqRecord, InboxStore, LeaderLease, LeaseStore, NewEvent, OutboxRecord, OutboxStore,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLAIM_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct OutboxInner {
    next_id: i64,
    next_dlq_id: i64,
    records: Vec<OutboxRecord>,
    dlq: Vec<DlqRecord>,
    keys: HashSet<String>,
    /// id -> claim expiry.
    claims: HashMap<i64, DateTime<Utc>>,
    /// id -> not-before time for retry scheduling.
    not_before: HashMap<i64, DateTime<Utc>>,
}

/// Outbox + DLQ backed by process memory.
#[derive(Debug, Clone)]
pub struct MemoryOutboxStore {
    inner: Arc<Mutex<OutboxInner>>,
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutboxInner {
                next_id: 1,
                next_dlq_id: 1,
                records: Vec::new(),
                dlq: Vec::new(),
                keys: HashSet::new(),
                claims: HashMap::new(),
                not_before: HashMap::new(),
            })),
        }
    }

    /// All records, for assertions.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).records.clone()
    }

    pub fn dlq(&self) -> Vec<DlqRecord> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).dlq.clone()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, event: NewEvent) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if !inner.keys.insert(event.idempotency_key.clone()) {
            return Ok(None);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.push(OutboxRecord {
            id,
            kind: event.kind,
            partition_key: event.partition_key,
            payload: event.payload,
            idempotency_key: event.idempotency_key,
            created_at: Utc::now(),
            processed_at: None,
            attempts: 0,
            last_error: None,
        });
        Ok(Some(id))
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut claimed = Vec::new();
        let candidate_ids: Vec<i64> = inner
            .records
            .iter()
            .filter(|r| r.processed_at.is_none())
            .map(|r| r.id)
            .collect();
        for id in candidate_ids {
            if claimed.len() >= limit {
                break;
            }
            let claim_live = inner.claims.get(&id).is_some_and(|until| *until > now);
            let due = inner.not_before.get(&id).map_or(true, |at| *at <= now);
            if claim_live || !due {
                continue;
            }
            inner.claims.insert(
                id,
                now + chrono::Duration::from_std(CLAIM_TTL).unwrap_or(chrono::Duration::zero()),
            );
            if let Some(record) = inner.records.iter().find(|r| r.id == id) {
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.claims.remove(&id);
        inner.not_before.remove(&id);
        match inner.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.processed_at = Some(Utc::now());
                Ok(())
            }
            None => Err(StoreError::Other(format!("outbox record {} not found", id))),
        }
    }

    async fn release_claim(&self, id: i64) -> Result<(), StoreError> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).claims.remove(&id);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_in: Duration,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.claims.remove(&id);
        inner.not_before.insert(
            id,
            Utc::now()
                + chrono::Duration::from_std(retry_in).unwrap_or(chrono::Duration::zero()),
        );
        match inner.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.attempts += 1;
                record.last_error = Some(error.to_string());
                Ok(record.attempts)
            }
            None => Err(StoreError::Other(format!("outbox record {} not found", id))),
        }
    }

    async fn move_to_dlq(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.claims.remove(&id);
        inner.not_before.remove(&id);
        let position = inner
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::Other(format!("outbox record {} not found", id)))?;
        let record = inner.records.remove(position);
        let dlq_id = inner.next_dlq_id;
        inner.next_dlq_id += 1;
        inner.dlq.push(DlqRecord {
            id: dlq_id,
            event_id: record.idempotency_key,
            kind: record.kind,
            partition_key: record.partition_key,
            payload: record.payload,
            error_message: error.to_string(),
            retry_count: record.attempts,
            failed_at: Utc::now(),
            replayed_at: None,
        });
        Ok(())
    }

    async fn dlq_list(
        &self,
        failed_since: Option<DateTime<Utc>>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqRecord>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<DlqRecord> = inner
            .dlq
            .iter()
            .filter(|d| failed_since.map_or(true, |since| d.failed_at >= since))
            .filter(|d| kind.map_or(true, |k| d.kind == k))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn requeue_from_dlq(
        &self,
        dlq_id: i64,
        new_idempotency_key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let event = {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let entry = inner
                .dlq
                .iter()
                .find(|d| d.id == dlq_id)
                .ok_or_else(|| StoreError::Other(format!("dlq record {} not found", dlq_id)))?;
            NewEvent {
                kind: entry.kind.clone(),
                partition_key: entry.partition_key.clone(),
                payload: entry.payload.clone(),
                idempotency_key: new_idempotency_key.to_string(),
            }
        };
        let outbox_id = self.enqueue(event).await?;
        if outbox_id.is_some() {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = inner.dlq.iter_mut().find(|d| d.id == dlq_id) {
                entry.replayed_at = Some(Utc::now());
            }
        }
        Ok(outbox_id)
    }
}

/// Consumer dedupe ledger backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryInboxStore {
    seen: Arc<Mutex<HashSet<(String, String)>>>,
}

impl MemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for MemoryInboxStore {
    async fn mark_if_new(
        &self,
        event_id: &str,
        consumer_group: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((event_id.to_string(), consumer_group.to_string())))
    }
}

/// Lease table backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, LeaderLease>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(lease: &LeaderLease, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(lease.ttl).unwrap_or(chrono::Duration::zero());
        lease.heartbeat_at + ttl <= now
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        job: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        match leases.get_mut(job) {
            Some(lease) if lease.holder_id == holder => {
                lease.heartbeat_at = now;
                lease.ttl = ttl;
                Ok(true)
            }
            Some(lease) if Self::expired(lease, now) => {
                *lease = LeaderLease {
                    job_name: job.to_string(),
                    holder_id: holder.to_string(),
                    acquired_at: now,
                    heartbeat_at: now,
                    ttl,
                };
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                leases.insert(
                    job.to_string(),
                    LeaderLease {
                        job_name: job.to_string(),
                        holder_id: holder.to_string(),
                        acquired_at: now,
                        heartbeat_at: now,
                        ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn heartbeat(&self, job: &str, holder: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        match leases.get_mut(job) {
            Some(lease) if lease.holder_id == holder && !Self::expired(lease, now) => {
                lease.heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job: &str, holder: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        if leases.get(job).is_some_and(|l| l.holder_id == holder) {
            leases.remove(job);
        }
        Ok(())
    }

    async fn current(&self, job: &str) -> Result<Option<LeaderLease>, StoreError> {
        Ok(self.leases.lock().unwrap_or_else(|p| p.into_inner()).get(job).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, partition: &str) -> NewEvent {
        NewEvent {
            kind: "invoice.created".into(),
            partition_key: partition.into(),
            payload: br#"{"amount": 10}"#.to_vec(),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_dropped() {
        let store = MemoryOutboxStore::new();
        assert!(store.enqueue(event("K", "t1")).await.unwrap().is_some());
        assert!(store.enqueue(event("K", "t1")).await.unwrap().is_none());
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn claim_returns_unprocessed_in_id_order_and_hides_claimed() {
        let store = MemoryOutboxStore::new();
        for i in 0..3 {
            store.enqueue(event(&format!("k{}", i), "t1")).await.unwrap();
        }

        let batch = store.claim_batch(2).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        // Claimed rows are invisible to a second dispatcher.
        let second = store.claim_batch(10).await.unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn mark_processed_removes_from_future_claims() {
        let store = MemoryOutboxStore::new();
        store.enqueue(event("k", "t1")).await.unwrap();
        let batch = store.claim_batch(1).await.unwrap();
        store.mark_processed(batch[0].id).await.unwrap();

        assert!(store.claim_batch(10).await.unwrap().is_empty());
        assert!(store.records()[0].processed_at.is_some());
    }

    #[tokio::test]
    async fn mark_failed_backs_off_and_counts_attempts() {
        let store = MemoryOutboxStore::new();
        store.enqueue(event("k", "t1")).await.unwrap();
        let batch = store.claim_batch(1).await.unwrap();

        let attempts = store
            .mark_failed(batch[0].id, "broker down", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        // Not due yet.
        assert!(store.claim_batch(10).await.unwrap().is_empty());

        let record = &store.records()[0];
        assert_eq!(record.last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn failed_record_is_reclaimable_after_backoff() {
        let store = MemoryOutboxStore::new();
        store.enqueue(event("k", "t1")).await.unwrap();
        let batch = store.claim_batch(1).await.unwrap();
        store.mark_failed(batch[0].id, "transient", Duration::ZERO).await.unwrap();

        let again = store.claim_batch(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 1);
    }

    #[tokio::test]
    async fn dlq_roundtrip_with_filters_and_replay() {
        let store = MemoryOutboxStore::new();
        store.enqueue(event("k1", "t1")).await.unwrap();
        store
            .enqueue(NewEvent { kind: "report.ready".into(), ..event("k2", "t2") })
            .await
            .unwrap();
        store.move_to_dlq(1, "poison payload").await.unwrap();
        store.move_to_dlq(2, "poison payload").await.unwrap();

        let all = store.dlq_list(None, None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
        let filtered = store.dlq_list(None, Some("report.ready"), 100).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].event_id, "k2");

        // Replay under a fresh key lands back in the outbox.
        let new_id = store.requeue_from_dlq(filtered[0].id, "k2:replay:abc").await.unwrap();
        assert!(new_id.is_some());
        let replayed = store.dlq_list(None, Some("report.ready"), 100).await.unwrap();
        assert!(replayed[0].replayed_at.is_some());
        assert_eq!(store.records().len(), 1);

        // Replaying under the original key would collide.
        let dlq = store.dlq_list(None, Some("invoice.created"), 100).await.unwrap();
        let collided = store.requeue_from_dlq(dlq[0].id, "k2:replay:abc").await.unwrap();
        assert!(collided.is_none());
    }

    #[tokio::test]
    async fn inbox_dedupes_per_consumer_group() {
        let inbox = MemoryInboxStore::new();
        assert!(inbox.mark_if_new("evt-1", "billing").await.unwrap());
        assert!(!inbox.mark_if_new("evt-1", "billing").await.unwrap());
        // Another group processes the same event independently.
        assert!(inbox.mark_if_new("evt-1", "reporting").await.unwrap());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expired() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_millis(50);

        assert!(store.try_acquire("telemetry", "p1", ttl).await.unwrap());
        assert!(!store.try_acquire("telemetry", "p2", ttl).await.unwrap());
        // Reentrant for the holder.
        assert!(store.try_acquire("telemetry", "p1", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.try_acquire("telemetry", "p2", ttl).await.unwrap());
        assert_eq!(store.current("telemetry").await.unwrap().unwrap().holder_id, "p2");
    }

    #[tokio::test]
    async fn heartbeat_fails_after_takeover() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_millis(50);

        store.try_acquire("job", "p1", ttl).await.unwrap();
        assert!(store.heartbeat("job", "p1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        store.try_acquire("job", "p2", ttl).await.unwrap();
        assert!(!store.heartbeat("job", "p1").await.unwrap());
        assert!(store.heartbeat("job", "p2").await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_lease_only_for_the_holder() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(30);

        store.try_acquire("job", "p1", ttl).await.unwrap();
        store.release("job", "p2").await.unwrap();
        assert!(store.current("job").await.unwrap().is_some());

        store.release("job", "p1").await.unwrap();
        assert!(store.current("job").await.unwrap().is_none());
        assert!(store.try_acquire("job", "p2", ttl).await.unwrap());
    }
}
