//! Observability events for the data core.
//!
//! Every component emits structured [`CoreEvent`]s describing its behavior:
//! fetch outcomes, cache operations, breaker transitions, outbox publishes,
//! and lease changes. Events flow through sinks implementing
//! `tower_service::Service<CoreEvent>`; the [`Emitter`] decouples hot paths
//! from sink latency with a bounded queue, and emission is always
//! best-effort — a slow or failing sink never affects caller outcomes.
//!
//! The JSON-lines encoding produced by [`event_to_json`] is the stable wire
//! format: one record per line, `ts` in unix milliseconds, and a `type`
//! discriminator (`datahub.fetch`, `cache.op`, `breaker.transition`,
//! `outbox.publish`, `scheduler.lease`).

pub mod sinks;

pub use sinks::{EventSink, JsonlSink, LogSink, MemorySink, NullSink};

use crate::breaker::CircuitState;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome classification for a `datahub.fetch` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    Timeout,
    Error,
    /// A stale entry was served because the whole provider chain failed.
    Stale,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Stale => "stale",
        }
    }
}

/// Cache operation classification for a `cache.op` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOpKind {
    HitFresh,
    HitStale,
    Miss,
    Put,
    Evict,
}

impl CacheOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HitFresh => "hit-fresh",
            Self::HitStale => "hit-stale",
            Self::Miss => "miss",
            Self::Put => "put",
            Self::Evict => "evict",
        }
    }
}

/// Publish outcome for an `outbox.publish` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    Ok,
    Retry,
    Dlq,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Retry => "retry",
            Self::Dlq => "dlq",
        }
    }
}

/// Lease lifecycle step for a `scheduler.lease` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEventKind {
    Acquired,
    Renewed,
    Lost,
}

impl LeaseEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Renewed => "renewed",
            Self::Lost => "lost",
        }
    }
}

/// Structured observability events emitted by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// Outcome of one provider attempt (or a degraded stale serve) in the hub.
    Fetch {
        source: String,
        key: String,
        status: FetchStatus,
        latency_ms: u64,
        details: Option<String>,
    },
    /// A cache lookup, replacement, or removal.
    CacheOp { op: CacheOpKind, key: String },
    /// A circuit breaker changed state.
    BreakerTransition { provider: String, from: CircuitState, to: CircuitState },
    /// The dispatcher resolved one outbox record.
    OutboxPublish { id: i64, kind: String, status: PublishStatus, attempts: u32, latency_ms: u64 },
    /// A leader lease was acquired, renewed, or lost.
    Lease { job: String, event: LeaseEventKind },
}

impl fmt::Display for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { source, key, status, latency_ms, .. } => {
                write!(f, "fetch({}, {}, {}, {}ms)", key, source, status.as_str(), latency_ms)
            }
            Self::CacheOp { op, key } => write!(f, "cache({}, {})", op.as_str(), key),
            Self::BreakerTransition { provider, from, to } => {
                write!(f, "breaker({}, {} -> {})", provider, from, to)
            }
            Self::OutboxPublish { id, kind, status, attempts, .. } => {
                write!(f, "outbox(#{}, {}, {}, attempt {})", id, kind, status.as_str(), attempts)
            }
            Self::Lease { job, event } => write!(f, "lease({}, {})", job, event.as_str()),
        }
    }
}

/// Encode an event as one JSON-lines record, stamping `ts` at encode time.
pub fn event_to_json(event: &CoreEvent) -> serde_json::Value {
    let ts = chrono::Utc::now().timestamp_millis();
    match event {
        CoreEvent::Fetch { source, key, status, latency_ms, details } => json!({
            "ts": ts,
            "type": "datahub.fetch",
            "source": source,
            "key": key,
            "status": status.as_str(),
            "latency_ms": latency_ms,
            "details": details,
        }),
        CoreEvent::CacheOp { op, key } => json!({
            "ts": ts,
            "type": "cache.op",
            "op": op.as_str(),
            "key": key,
        }),
        CoreEvent::BreakerTransition { provider, from, to } => json!({
            "ts": ts,
            "type": "breaker.transition",
            "provider": provider,
            "from": from.as_str(),
            "to": to.as_str(),
        }),
        CoreEvent::OutboxPublish { id, kind, status, attempts, latency_ms } => json!({
            "ts": ts,
            "type": "outbox.publish",
            "id": id,
            "kind": kind,
            "status": status.as_str(),
            "attempts": attempts,
            "latency_ms": latency_ms,
        }),
        CoreEvent::Lease { job, event } => json!({
            "ts": ts,
            "type": "scheduler.lease",
            "job": job,
            "event": event.as_str(),
        }),
    }
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: CoreEvent)
where
    S: tower_service::Service<CoreEvent, Response = ()> + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send,
{
    use tower::ServiceExt;

    match sink.ready_oneshot().await {
        Ok(mut ready) => {
            if let Err(e) = ready.call(event).await {
                tracing::debug!(error = %e, "telemetry sink rejected event");
            }
        }
        Err(e) => tracing::debug!(error = %e, "telemetry sink not ready"),
    }
}

/// Non-blocking handle components emit through.
///
/// Events are pushed onto a bounded queue drained by a background worker
/// into the wrapped sink; when the queue is full the event is counted as
/// dropped rather than blocking the hot path.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: Option<mpsc::Sender<CoreEvent>>,
    dropped: Arc<AtomicU64>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Emitter {
    /// An emitter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Wrap a sink with a bounded queue and a background drain worker.
    ///
    /// Must be called with a tokio runtime available.
    pub fn new<S>(sink: S, capacity: usize) -> Self
    where
        S: tower_service::Service<CoreEvent, Response = ()> + Send + 'static,
        S::Error: std::fmt::Display + Send,
        S::Future: Send,
    {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(event) = rx.recv().await {
                use tower::ServiceExt;
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(event).await {
                            tracing::debug!(error = %e, "telemetry sink error");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "telemetry sink not ready"),
                }
            }
        });
        Self { tx: Some(tx), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Fire-and-forget; never blocks, never fails.
    pub fn emit(&self, event: CoreEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
