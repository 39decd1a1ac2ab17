//! Error taxonomy for the fetch path.
//!
//! Every variant is the single surfaced outcome of a layer that has already
//! exhausted its own recovery (retries, fallbacks, degraded serves). The type
//! is `Clone` so the coalescer can broadcast one outcome to every waiter.

use std::fmt;
use std::time::Duration;

/// Unified error returned by the data hub and its inner layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The operation exceeded its deadline.
    Timeout { elapsed: Duration, limit: Duration },
    /// The provider's circuit breaker is open; the call was not attempted.
    BreakerOpen { provider: String },
    /// The provider responded but the payload failed its sanity predicate.
    Validation { provider: String },
    /// The provider failed after its retry policy was exhausted.
    Provider { provider: String, message: String, retryable: bool },
    /// A coalescer waiter's deadline elapsed; the primary keeps running.
    CoalesceTimeout { fingerprint: String },
    /// The coalesced computation ended with a panic or vanished primary.
    PrimaryFailed { message: String },
    /// Every provider in the chain failed and no stale entry was serveable.
    AllSourcesFailed { kind: String, providers_tried: usize, last_error: Option<String> },
    /// The requested resource kind was never registered with the hub.
    UnknownKind { kind: String },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, limit } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, limit)
            }
            Self::BreakerOpen { provider } => {
                write!(f, "circuit breaker open for provider {}", provider)
            }
            Self::Validation { provider } => {
                write!(f, "provider {} returned a payload that failed validation", provider)
            }
            Self::Provider { provider, message, retryable } => {
                write!(
                    f,
                    "provider {} failed ({}): {}",
                    provider,
                    if *retryable { "retryable" } else { "non-retryable" },
                    message
                )
            }
            Self::CoalesceTimeout { fingerprint } => {
                write!(f, "timed out waiting for in-flight computation of {}", fingerprint)
            }
            Self::PrimaryFailed { message } => {
                write!(f, "coalesced computation failed: {}", message)
            }
            Self::AllSourcesFailed { kind, providers_tried, last_error } => {
                write!(f, "all {} providers failed for kind {}", providers_tried, kind)?;
                if let Some(last) = last_error {
                    write!(f, ", last error: {}", last)?;
                }
                Ok(())
            }
            Self::UnknownKind { kind } => {
                write!(f, "resource kind {} is not registered", kind)
            }
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_coalesce_timeout(&self) -> bool {
        matches!(self, Self::CoalesceTimeout { .. })
    }

    pub fn is_all_sources_failed(&self) -> bool {
        matches!(self, Self::AllSourcesFailed { .. })
    }

    /// Whether retrying the whole fetch later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::BreakerOpen { .. }
            | Self::CoalesceTimeout { .. }
            | Self::AllSourcesFailed { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Validation { .. } | Self::PrimaryFailed { .. } | Self::UnknownKind { .. } => {
                false
            }
        }
    }
}
