//! Persistent records shared across processes: outbox, inbox, DLQ, and
//! leader leases.
//!
//! The traits here are the seam between the scheduler/dispatcher and the
//! relational store. Production uses the Postgres implementations; tests
//! and embedders without a database use the in-memory ones, which share
//! state between cloned handles the way a database is shared between
//! processes.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryInboxStore, MemoryLeaseStore, MemoryOutboxStore};
#[cfg(feature = "postgres")]
pub use postgres::{ensure_schema, PgInboxStore, PgLeaseStore, PgOutboxStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A uniqueness constraint rejected the write.
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("store error: {0}")]
    Other(String),
}

/// An event to be enqueued in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub kind: String,
    /// Per-key publish order is preserved for events sharing this key.
    pub partition_key: String,
    pub payload: Vec<u8>,
    /// Producer-supplied token; a second enqueue with the same key is
    /// dropped by the uniqueness constraint.
    pub idempotency_key: String,
}

/// One committed outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: i64,
    pub kind: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A dead-lettered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqRecord {
    pub id: i64,
    /// Idempotency key of the original outbox record.
    pub event_id: String,
    pub kind: String,
    pub partition_key: String,
    pub payload: Vec<u8>,
    pub error_message: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

/// A leader lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderLease {
    pub job_name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Outbox persistence: enqueue, claim, resolve, dead-letter, replay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert an event. Returns the new row id, or `None` when the
    /// idempotency key already exists and the insert was dropped.
    ///
    /// For transactional enqueue alongside a business write, use the
    /// store-specific transaction hook (`PgOutboxStore::enqueue_in`).
    async fn enqueue(&self, event: NewEvent) -> Result<Option<i64>, StoreError>;

    /// Claim up to `limit` unprocessed, unclaimed, due records in id order.
    /// Claimed records are invisible to other dispatchers until resolved
    /// or until the claim expires.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Mark a record delivered.
    async fn mark_processed(&self, id: i64) -> Result<(), StoreError>;

    /// Hand back an unresolved claim so the record is immediately visible
    /// to the next claim (e.g. records deferred to preserve partition
    /// order).
    async fn release_claim(&self, id: i64) -> Result<(), StoreError>;

    /// Record a failed attempt and schedule the next one after `retry_in`.
    /// Returns the new attempt count.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_in: Duration,
    ) -> Result<u32, StoreError>;

    /// Move a record to the dead-letter queue.
    async fn move_to_dlq(&self, id: i64, error: &str) -> Result<(), StoreError>;

    /// List dead-lettered events, newest first, filtered by failure time
    /// and kind.
    async fn dlq_list(
        &self,
        failed_since: Option<DateTime<Utc>>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqRecord>, StoreError>;

    /// Re-enqueue a dead-lettered event under a fresh idempotency key and
    /// stamp `replayed_at`. Returns the new outbox id, or `None` when the
    /// key collided.
    async fn requeue_from_dlq(
        &self,
        dlq_id: i64,
        new_idempotency_key: &str,
    ) -> Result<Option<i64>, StoreError>;
}

/// Consumer-side dedupe ledger.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Record `(event_id, consumer_group)` as processed. Returns true when
    /// this call was the first; callers perform side effects only then.
    async fn mark_if_new(&self, event_id: &str, consumer_group: &str)
        -> Result<bool, StoreError>;
}

/// Lease persistence backing leader election.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease for `job` if it is free, expired, or already held
    /// by `holder`. Returns whether `holder` now holds it.
    async fn try_acquire(
        &self,
        job: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Refresh the heartbeat. Returns false when the lease is no longer
    /// held by `holder` — leadership is lost the moment this is observed.
    async fn heartbeat(&self, job: &str, holder: &str) -> Result<bool, StoreError>;

    /// Give the lease up voluntarily.
    async fn release(&self, job: &str, holder: &str) -> Result<(), StoreError>;

    /// Current lease row for a job, if any.
    async fn current(&self, job: &str) -> Result<Option<LeaderLease>, StoreError>;
}
