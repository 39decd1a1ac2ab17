//! Leader election over a database-backed lease row.
//!
//! One elector exists per (process, job). Acquisition is a conditional
//! upsert that only succeeds when the lease is free, expired, or already
//! ours; the row itself serializes contention, so no in-process locks are
//! needed. Leadership is exposed as a `watch` channel: the scheduler gates
//! job ticks on it, and handlers can observe it for cooperative
//! cancellation. A heartbeat that matches zero rows means another process
//! took over — leadership drops the moment that is observed.

use crate::ident;
use crate::store::LeaseStore;
use crate::telemetry::{CoreEvent, Emitter, LeaseEventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    job: String,
    holder: String,
    ttl: Duration,
    heartbeat_interval: Duration,
    emitter: Emitter,
    leadership: watch::Sender<bool>,
}

impl LeaderElector {
    /// A heartbeat interval above `ttl / 3` is clamped down to it, so a
    /// holder always gets at least two renewal chances before expiry.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        job: impl Into<String>,
        ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        let max_interval = ttl / 3;
        let heartbeat_interval = if heartbeat_interval > max_interval {
            tracing::warn!(
                ?heartbeat_interval,
                ?ttl,
                "heartbeat interval above ttl/3; clamping"
            );
            max_interval
        } else {
            heartbeat_interval
        };
        let (leadership, _) = watch::channel(false);
        Self {
            store,
            job: job.into(),
            holder: ident::holder_id(),
            ttl,
            heartbeat_interval,
            emitter: Emitter::disabled(),
            leadership,
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Fix the holder id (tests).
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn holder_id(&self) -> &str {
        &self.holder
    }

    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    /// Leadership signal: true while this process holds the lease.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.leadership.subscribe()
    }

    /// One election step: heartbeat when leading, try to acquire when not.
    /// Returns the resulting leadership state.
    pub async fn step(&self) -> bool {
        if self.is_leader() {
            match self.store.heartbeat(&self.job, &self.holder).await {
                Ok(true) => {
                    self.emit(LeaseEventKind::Renewed);
                    true
                }
                Ok(false) => {
                    tracing::warn!(job = %self.job, holder = %self.holder, "lease lost");
                    self.set_leader(false);
                    self.emit(LeaseEventKind::Lost);
                    false
                }
                Err(err) => {
                    // The lease may expire during a store outage; assume the
                    // worst so the singleton property holds.
                    tracing::warn!(job = %self.job, error = %err, "heartbeat failed; dropping leadership");
                    self.set_leader(false);
                    self.emit(LeaseEventKind::Lost);
                    false
                }
            }
        } else {
            match self.store.try_acquire(&self.job, &self.holder, self.ttl).await {
                Ok(true) => {
                    tracing::info!(job = %self.job, holder = %self.holder, "lease acquired");
                    self.set_leader(true);
                    self.emit(LeaseEventKind::Acquired);
                    true
                }
                Ok(false) => false,
                Err(err) => {
                    tracing::debug!(job = %self.job, error = %err, "lease acquisition failed");
                    false
                }
            }
        }
    }

    /// Election loop: steps every `heartbeat_interval` until `shutdown`
    /// turns true, then releases the lease if held.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.step().await;
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.resign().await;
    }

    /// Voluntarily give up the lease.
    pub async fn resign(&self) {
        if !self.is_leader() {
            return;
        }
        self.set_leader(false);
        self.emit(LeaseEventKind::Lost);
        if let Err(err) = self.store.release(&self.job, &self.holder).await {
            tracing::warn!(job = %self.job, error = %err, "failed to release lease");
        }
    }

    fn set_leader(&self, leader: bool) {
        let _ = self.leadership.send(leader);
    }

    fn emit(&self, event: LeaseEventKind) {
        self.emitter.emit(CoreEvent::Lease { job: self.job.clone(), event });
    }
}
