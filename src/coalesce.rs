//! Request coalescing: at most one in-flight computation per fingerprint.
//!
//! The first caller for a fingerprint becomes the primary and its compute
//! runs inside a spawned task with its own deadline, so a caller giving up
//! early never cancels work that other waiters depend on. Every caller —
//! primary included — waits on a broadcast channel carrying the single
//! published outcome, which makes "identical result to every waiter" hold
//! by construction. Panics in the compute surface as `PrimaryFailed`; the
//! publish-and-remove path runs regardless of how the compute ended.

use crate::clock::{Clock, MonotonicClock};
use crate::error::FetchError;
use crate::fingerprint::Fingerprint;
use crate::ident;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

struct Slot<T> {
    tx: broadcast::Sender<Result<T, FetchError>>,
    started_at: u64,
    waiters: usize,
    primary_id: String,
}

type SlotTable<T> = Arc<Mutex<HashMap<Fingerprint, Slot<T>>>>;

pub struct Coalescer<T> {
    slots: SlotTable<T>,
    clock: Arc<dyn Clock>,
    /// Watchdog bound on slot lifetime; protects against a primary that
    /// disappears without publishing.
    max_inflight_age: Duration,
}

impl<T: Clone + Send + 'static> Coalescer<T> {
    pub fn new(max_inflight_age: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
            max_inflight_age,
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Number of computations currently in flight.
    pub fn inflight(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Remove slots older than `max_inflight_age`. Dropping a slot closes
    /// its channel, waking any waiters with `PrimaryFailed`.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now_millis();
        let max_age = self.max_inflight_age.as_millis() as u64;
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        let stale: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| cutoff.saturating_sub(slot.started_at) > max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(slot) = slots.remove(key) {
                tracing::warn!(
                    key = %key,
                    primary = %slot.primary_id,
                    waiters = slot.waiters,
                    "removing overdue in-flight slot"
                );
            }
        }
        stale.len()
    }

    /// Run `compute` for `fingerprint`, joining an in-flight computation if
    /// one exists.
    ///
    /// `wait_deadline` bounds how long this caller waits for the outcome;
    /// its expiry returns `CoalesceTimeout` without disturbing the primary.
    /// `primary_deadline` bounds the compute itself and only applies when
    /// this caller starts the computation.
    pub async fn run<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        wait_deadline: Duration,
        primary_deadline: Duration,
        compute: F,
    ) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        self.sweep();

        let (mut rx, is_primary) = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(slot) = slots.get_mut(fingerprint) {
                slot.waiters += 1;
                tracing::debug!(key = %fingerprint, waiters = slot.waiters, "joined in-flight computation");
                (slot.tx.subscribe(), false)
            } else {
                let (tx, rx) = broadcast::channel(1);
                slots.insert(
                    fingerprint.clone(),
                    Slot {
                        tx,
                        started_at: self.clock.now_millis(),
                        waiters: 0,
                        primary_id: ident::new_id(),
                    },
                );
                (rx, true)
            }
        };

        if is_primary {
            self.spawn_primary(fingerprint.clone(), primary_deadline, compute());
        }

        match tokio::time::timeout(wait_deadline, rx.recv()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(FetchError::PrimaryFailed {
                message: "in-flight computation vanished before publishing".into(),
            }),
            Err(_elapsed) => {
                Err(FetchError::CoalesceTimeout { fingerprint: fingerprint.to_string() })
            }
        }
    }

    fn spawn_primary<Fut>(&self, fingerprint: Fingerprint, deadline: Duration, compute: Fut)
    where
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let handle = tokio::spawn(compute);
        let abort = handle.abort_handle();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(deadline, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    let message = if join_err.is_panic() {
                        format!("computation panicked: {}", panic_message(join_err.into_panic()))
                    } else {
                        "computation task was cancelled".to_string()
                    };
                    Err(FetchError::PrimaryFailed { message })
                }
                Err(_) => {
                    abort.abort();
                    Err(FetchError::Timeout { elapsed: deadline, limit: deadline })
                }
            };

            let slot = slots.lock().unwrap_or_else(|p| p.into_inner()).remove(&fingerprint);
            if let Some(slot) = slot {
                // Receivers subscribed before this send still get the value
                // even though the slot is gone from the table.
                let _ = slot.tx.send(outcome);
            }
        });
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
