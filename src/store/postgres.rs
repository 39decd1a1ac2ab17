//! Postgres store implementations over `sqlx`.
//!
//! Queries are runtime-bound (no compile-time schema dependency). The
//! dispatcher claim uses `FOR UPDATE SKIP LOCKED` over unprocessed rows
//! plus a `claimed_at` column so multiple dispatcher processes can share
//! one outbox without double-publishing inside a claim window.

#![cfg(feature = "postgres")]

use super::{
    DlqRecord, InboxStore, LeaderLease, LeaseStore, NewEvent, OutboxRecord, OutboxStore,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;

const SCHEMA: &str = include_str!("../../schema.sql");

/// Create the outbox/inbox/DLQ/lease tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await.map_err(map_err)?;
    Ok(())
}

fn map_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            StoreError::Duplicate(db_err.message().to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Other(err.to_string()),
    }
}

fn outbox_row(row: &PgRow) -> Result<OutboxRecord, sqlx::Error> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        partition_key: row.try_get("partition_key")?,
        payload: row.try_get("payload")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
    })
}

fn dlq_row(row: &PgRow) -> Result<DlqRecord, sqlx::Error> {
    Ok(DlqRecord {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        kind: row.try_get("kind")?,
        partition_key: row.try_get("partition_key")?,
        payload: row.try_get("payload")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        failed_at: row.try_get("failed_at")?,
        replayed_at: row.try_get("replayed_at")?,
    })
}

/// Outbox + DLQ over Postgres.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    /// A claim left unresolved this long becomes visible again.
    claim_ttl: Duration,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, claim_ttl: Duration::from_secs(60) }
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    /// Enqueue inside the caller's transaction, so the event commits or
    /// rolls back together with the business write.
    pub async fn enqueue_in(
        conn: &mut PgConnection,
        event: &NewEvent,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "INSERT INTO event_outbox (kind, partition_key, payload, idempotency_key) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING id",
        )
        .bind(&event.kind)
        .bind(&event.partition_key)
        .bind(&event.payload)
        .bind(&event.idempotency_key)
        .fetch_optional(conn)
        .await
        .map_err(map_err)?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, event: NewEvent) -> Result<Option<i64>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(map_err)?;
        Self::enqueue_in(&mut conn, &event).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(
            "UPDATE event_outbox SET claimed_at = now() \
             WHERE id IN ( \
                 SELECT id FROM event_outbox \
                 WHERE processed_at IS NULL \
                   AND (claimed_at IS NULL OR claimed_at < now() - $2 * interval '1 second') \
                   AND (next_attempt_at IS NULL OR next_attempt_at <= now()) \
                 ORDER BY id \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING *",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(self.claim_ttl.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut records: Vec<OutboxRecord> = rows
            .iter()
            .map(outbox_row)
            .collect::<Result<_, _>>()
            .map_err(map_err)?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn mark_processed(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE event_outbox \
             SET processed_at = now(), claimed_at = NULL, next_attempt_at = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn release_claim(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE event_outbox SET claimed_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_in: Duration,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE event_outbox \
             SET attempts = attempts + 1, \
                 last_error = $2, \
                 claimed_at = NULL, \
                 next_attempt_at = now() + $3 * interval '1 second' \
             WHERE id = $1 \
             RETURNING attempts",
        )
        .bind(id)
        .bind(error)
        .bind(retry_in.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row.get::<i32, _>("attempts") as u32)
    }

    async fn move_to_dlq(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let moved = sqlx::query(
            "INSERT INTO event_dlq \
                 (event_id, kind, partition_key, payload, error_message, retry_count) \
             SELECT idempotency_key, kind, partition_key, payload, $2, attempts \
             FROM event_outbox WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        if moved.rows_affected() == 0 {
            return Err(StoreError::Other(format!("outbox record {} not found", id)));
        }
        sqlx::query("DELETE FROM event_outbox WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn dlq_list(
        &self,
        failed_since: Option<DateTime<Utc>>,
        kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM event_dlq \
             WHERE ($1::timestamptz IS NULL OR failed_at >= $1) \
               AND ($2::text IS NULL OR kind = $2) \
             ORDER BY failed_at DESC \
             LIMIT $3",
        )
        .bind(failed_since)
        .bind(kind)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter().map(dlq_row).collect::<Result<_, _>>().map_err(map_err)
    }

    async fn requeue_from_dlq(
        &self,
        dlq_id: i64,
        new_idempotency_key: &str,
    ) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let inserted = sqlx::query(
            "INSERT INTO event_outbox (kind, partition_key, payload, idempotency_key) \
             SELECT kind, partition_key, payload, $2 \
             FROM event_dlq WHERE id = $1 \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING id",
        )
        .bind(dlq_id)
        .bind(new_idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let outbox_id = match inserted {
            Some(row) => {
                sqlx::query("UPDATE event_dlq SET replayed_at = now() WHERE id = $1")
                    .bind(dlq_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_err)?;
                Some(row.get::<i64, _>("id"))
            }
            None => None,
        };
        tx.commit().await.map_err(map_err)?;
        Ok(outbox_id)
    }
}

/// Consumer dedupe ledger over Postgres.
#[derive(Debug, Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn mark_if_new(
        &self,
        event_id: &str,
        consumer_group: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO event_inbox (event_id, consumer_group) VALUES ($1, $2) \
             ON CONFLICT (event_id, consumer_group) DO NOTHING",
        )
        .bind(event_id)
        .bind(consumer_group)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Lease table over Postgres. Exclusivity rides on the primary key row;
/// the conditional upsert succeeds only when the lease is free, expired,
/// or already ours.
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_acquire(
        &self,
        job: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO scheduler_leader_lease \
                 (job_name, holder_id, acquired_at, heartbeat_at, ttl_seconds) \
             VALUES ($1, $2, now(), now(), $3) \
             ON CONFLICT (job_name) DO UPDATE \
             SET holder_id = $2, acquired_at = now(), heartbeat_at = now(), ttl_seconds = $3 \
             WHERE scheduler_leader_lease.holder_id = $2 \
                OR scheduler_leader_lease.heartbeat_at \
                   + scheduler_leader_lease.ttl_seconds * interval '1 second' <= now()",
        )
        .bind(job)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, job: &str, holder: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduler_leader_lease \
             SET heartbeat_at = now() \
             WHERE job_name = $1 \
               AND holder_id = $2 \
               AND heartbeat_at + ttl_seconds * interval '1 second' > now()",
        )
        .bind(job)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, job: &str, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM scheduler_leader_lease WHERE job_name = $1 AND holder_id = $2")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn current(&self, job: &str) -> Result<Option<LeaderLease>, StoreError> {
        let row = sqlx::query(
            "SELECT job_name, holder_id, acquired_at, heartbeat_at, ttl_seconds \
             FROM scheduler_leader_lease WHERE job_name = $1",
        )
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.map(|row| -> Result<LeaderLease, sqlx::Error> {
            Ok(LeaderLease {
                job_name: row.try_get("job_name")?,
                holder_id: row.try_get("holder_id")?,
                acquired_at: row.try_get("acquired_at")?,
                heartbeat_at: row.try_get("heartbeat_at")?,
                ttl: Duration::from_secs_f64(row.try_get::<f64, _>("ttl_seconds")?),
            })
        })
        .transpose()
        .map_err(map_err)
    }
}
