//! Circuit breaker state machine with lock-free atomics.
//!
//! One breaker exists per (process, provider). State lives in a single
//! atomic word; transitions serialize through compare-and-swap so exactly
//! one caller performs each transition and emits its event.
//!
//! The admission API is split from outcome recording because the guarded
//! provider call sits between them (timeout, fetch, validation). Every
//! successful [`Breaker::try_admit`] must be paired with exactly one
//! [`Breaker::record`].

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{CoreEvent, Emitter};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Externally visible breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning knobs, carried by a provider descriptor.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub threshold: usize,
    /// How long to fail fast before probing again.
    pub cool_down: Duration,
    /// Concurrent probe calls admitted while half-open.
    pub half_open: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { threshold: 5, cool_down: Duration::from_secs(30), half_open: 1 }
    }
}

impl BreakerConfig {
    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { threshold: usize::MAX, cool_down: Duration::ZERO, half_open: usize::MAX }
    }
}

/// Read-only view of one breaker, for observability surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    /// Monotonic millis at which the breaker last opened, while open.
    pub opened_at_millis: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_inflight: AtomicUsize,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_inflight: AtomicUsize::new(0),
        }
    }
}

/// Token returned by a successful admission. Hand it back via `record`.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    half_open: bool,
}

/// Per-provider circuit breaker.
#[derive(Clone)]
pub struct Breaker {
    provider: String,
    inner: Arc<BreakerInner>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    emitter: Emitter,
}

impl fmt::Debug for Breaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .finish()
    }
}

impl Breaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            inner: Arc::new(BreakerInner::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
            emitter: Emitter::disabled(),
        }
    }

    /// Override the clock (deterministic cool-down in tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        BreakerSnapshot {
            provider: self.provider.clone(),
            state,
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Acquire),
            opened_at_millis: match state {
                CircuitState::Closed => None,
                _ => Some(self.inner.opened_at_millis.load(Ordering::Acquire)),
            },
        }
    }

    /// Force the breaker back to closed, clearing counters.
    pub fn reset(&self) {
        let before = self.state();
        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        self.inner.consecutive_failures.store(0, Ordering::Release);
        self.inner.opened_at_millis.store(0, Ordering::Release);
        self.inner.half_open_inflight.store(0, Ordering::Release);
        if before != CircuitState::Closed {
            self.transition(before, CircuitState::Closed);
        }
    }

    /// Ask to pass one call through. `None` means fail fast.
    pub fn try_admit(&self) -> Option<Admission> {
        loop {
            match self.inner.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.inner.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.cool_down.as_millis() as u64 {
                        return None;
                    }
                    // Cool-down over: race to become the first probe.
                    match self.inner.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.inner.half_open_inflight.store(1, Ordering::Release);
                            self.transition(CircuitState::Open, CircuitState::HalfOpen);
                            return Some(Admission { half_open: true });
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let current = self.inner.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open {
                        self.inner.half_open_inflight.fetch_sub(1, Ordering::Release);
                        return None;
                    }
                    tracing::debug!(
                        provider = %self.provider,
                        in_flight = current + 1,
                        "admitting half-open probe"
                    );
                    return Some(Admission { half_open: true });
                }
                _ => return Some(Admission { half_open: false }),
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, admission: Admission, ok: bool) {
        if admission.half_open {
            self.inner.half_open_inflight.fetch_sub(1, Ordering::Release);
        }
        if ok {
            self.on_success();
        } else {
            self.on_failure();
        }
    }

    /// Return an admission without an outcome (the call was never made).
    pub fn release(&self, admission: Admission) {
        if admission.half_open {
            self.inner.half_open_inflight.fetch_sub(1, Ordering::Release);
        }
    }

    fn on_success(&self) {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.consecutive_failures.store(0, Ordering::Release);
                    self.inner.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(provider = %self.provider, "breaker closed after probe success");
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            STATE_CLOSED => {
                self.inner.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.inner.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(provider = %self.provider, failures, "probe failed; breaker reopened");
                    self.transition(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.threshold
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        provider = %self.provider,
                        failures,
                        threshold = self.config.threshold,
                        "breaker opened"
                    );
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        self.emitter.emit(CoreEvent::BreakerTransition {
            provider: self.provider.clone(),
            from,
            to,
        });
    }
}

/// Registry keyed by provider id, for the observability snapshot surface.
#[derive(Default, Clone, Debug)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, Breaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its provider id, replacing any previous one.
    pub fn register(&self, breaker: Breaker) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(breaker.provider().to_string(), breaker);
    }

    pub fn get(&self, provider: &str) -> Option<Breaker> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(provider).cloned()
    }

    /// Snapshot of every registered breaker, sorted by provider id.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<_> = map.values().map(Breaker::snapshot).collect();
        entries.sort_by(|a, b| a.provider.cmp(&b.provider));
        entries
    }
}
