//! Periodic jobs gated on leader election.
//!
//! Each registered job gets two tasks: a [`LeaderElector`] loop renewing
//! the lease, and a ticker that fires the handler only while this process
//! leads. Overlapping runs are prevented by a per-job mutex; a tick that
//! finds the previous run still in flight is skipped, never queued.

use crate::ident;
use crate::jitter::Jitter;
use crate::lease::LeaderElector;
use crate::store::LeaseStore;
use crate::telemetry::Emitter;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type JobError = Box<dyn std::error::Error + Send + Sync>;
pub type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Handed to each handler invocation for cooperative cancellation.
#[derive(Debug, Clone)]
pub struct JobContext {
    leadership: watch::Receiver<bool>,
}

impl JobContext {
    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    /// Resolves when this process stops leading the job. Long handlers
    /// select against this at their suspension points.
    pub async fn cancelled(&mut self) {
        while *self.leadership.borrow_and_update() {
            if self.leadership.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One periodic job.
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    /// Random addition to each tick, spreading fleet-wide alignment.
    pub jitter: Duration,
    /// Handler runtime bound per invocation.
    pub deadline: Duration,
    pub handler: JobHandler,
}

impl JobSpec {
    pub fn new<F>(name: impl Into<String>, interval: Duration, handler: F) -> Self
    where
        F: Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            interval,
            jitter: Duration::ZERO,
            deadline: Duration::from_secs(60),
            handler: Arc::new(handler),
        }
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

struct JobEntry {
    elector: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// Registers jobs and runs them while leading.
pub struct Scheduler {
    store: Arc<dyn LeaseStore>,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
    emitter: Emitter,
    holder: String,
    jobs: Mutex<HashMap<String, JobEntry>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn LeaseStore>, lease_ttl: Duration, heartbeat_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            lease_ttl,
            heartbeat_interval,
            emitter: Emitter::disabled(),
            holder: ident::holder_id(),
            jobs: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Fix the holder id shared by this scheduler's electors (tests).
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder
    }

    /// Register and start a job. Idempotent by name: re-registering an
    /// existing job is a no-op returning false.
    pub fn register(&self, spec: JobSpec) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        if jobs.contains_key(&spec.name) {
            tracing::debug!(job = %spec.name, "job already registered");
            return false;
        }

        let elector = Arc::new(
            LeaderElector::new(
                Arc::clone(&self.store),
                spec.name.clone(),
                self.lease_ttl,
                self.heartbeat_interval,
            )
            .with_holder(self.holder.clone())
            .with_emitter(self.emitter.clone()),
        );
        let leadership = elector.watch();

        let elector_handle = {
            let elector = Arc::clone(&elector);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { elector.run(shutdown).await })
        };
        let ticker_handle = {
            let shutdown = self.shutdown.subscribe();
            let spec = spec.clone();
            tokio::spawn(async move { ticker(spec, leadership, shutdown).await })
        };

        tracing::info!(job = %spec.name, interval = ?spec.interval, "job registered");
        jobs.insert(
            spec.name.clone(),
            JobEntry { elector: elector_handle, ticker: ticker_handle },
        );
        true
    }

    /// Whether this process currently leads a job.
    pub fn is_registered(&self, name: &str) -> bool {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).contains_key(name)
    }

    /// Stop ticking, release every lease, and wait for the loops to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let entries: Vec<JobEntry> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.elector.await;
            let _ = entry.ticker.await;
        }
    }
}

async fn ticker(spec: JobSpec, leadership: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
    let running = Arc::new(tokio::sync::Mutex::new(()));
    let mut leadership_changes = leadership.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !*leadership_changes.borrow_and_update() {
            tokio::select! {
                changed = leadership_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        let delay = spec.interval + Jitter::full().apply(spec.jitter);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() || !*leadership_changes.borrow() {
            continue;
        }

        // Missed-tick policy: skip when the previous run is still going.
        match Arc::clone(&running).try_lock_owned() {
            Ok(guard) => {
                let ctx = JobContext { leadership: leadership.clone() };
                let handler = Arc::clone(&spec.handler);
                let name = spec.name.clone();
                let deadline = spec.deadline;
                tokio::spawn(async move {
                    let _guard = guard;
                    match tokio::time::timeout(deadline, (handler)(ctx)).await {
                        Ok(Ok(())) => tracing::debug!(job = %name, "job run completed"),
                        Ok(Err(err)) => tracing::warn!(job = %name, error = %err, "job run failed"),
                        Err(_) => tracing::warn!(job = %name, ?deadline, "job run exceeded deadline"),
                    }
                });
            }
            Err(_) => {
                tracing::debug!(job = %spec.name, "previous run still in flight; skipping tick");
            }
        }
    }
    // Drain any in-flight run so shutdown implies quiescence.
    let _ = running.lock().await;
}
