#![forbid(unsafe_code)]

//! # Adit
//!
//! Data acquisition and dispatch core for mining operations platforms: the
//! layer between request handlers, a relational store, and external data
//! providers.
//!
//! ## What's inside
//!
//! - **Cache store** with TTL and stale-while-revalidate windows, sharded
//!   for contention, monotone in `created_at`
//! - **Request coalescer** guaranteeing at-most-one in-flight computation
//!   per fingerprint, with identical outcomes for every waiter
//! - **Provider chains** with budgeted timeouts, retries with exponential
//!   backoff and jitter, per-provider circuit breakers, and payload
//!   validation
//! - **Data hub** composing the three into a typed `fetch`, with degraded
//!   stale serves when every source fails
//! - **Leader-elected scheduler** running periodic jobs exactly once
//!   across a fleet, over a database lease row
//! - **Transactional outbox dispatcher** with per-partition ordering, a
//!   dead-letter queue, and a replay tool (`replay-dlq`)
//!
//! ## Quick start
//!
//! ```rust
//! use adit::provider::{FnProvider, ProviderDescriptor, ProviderRegistry};
//! use adit::{DataHub, KindConfig, Params};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), adit::FetchError> {
//!     let registry: ProviderRegistry<f64> = ProviderRegistry::new();
//!     registry.register_validated(
//!         "btc-price",
//!         ProviderDescriptor::new("spot-feed", Duration::from_secs(2)),
//!         Arc::new(FnProvider::new("spot-feed", |_params| {
//!             Box::pin(async { Ok(62_000.0) })
//!         })),
//!         |price: &f64| (0.0..10_000_000.0).contains(price),
//!     );
//!
//!     let hub: DataHub<f64> = DataHub::<f64>::builder().build();
//!     hub.register_kind(
//!         KindConfig::new("btc-price")
//!             .ttls(Duration::from_secs(15), Duration::from_secs(120))
//!             .deadline(Duration::from_secs(3)),
//!         registry.chain("btc-price"),
//!     );
//!
//!     let (price, meta) =
//!         hub.fetch("btc-price", &Params::new(), Duration::from_secs(3)).await?;
//!     assert_eq!(price, 62_000.0);
//!     assert!(!meta.cached);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod hub;
pub mod ident;
pub mod jitter;
pub mod lease;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod sleeper;
pub mod store;
pub mod telemetry;

// Re-exports
pub use backoff::Backoff;
pub use breaker::{Breaker, BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitState};
pub use cache::{CacheConfig, CacheEntry, CacheStats, CacheStore, EntryStatus};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use coalesce::Coalescer;
pub use config::{ConfigError, CoreConfig};
pub use dispatch::{Dispatcher, DispatcherConfig, PublishError, Publisher};
pub use error::FetchError;
pub use fingerprint::{Fingerprint, Params};
pub use hub::{DataHub, DataHubBuilder, FetchMeta, KindConfig};
pub use jitter::Jitter;
pub use lease::LeaderElector;
pub use provider::{
    FnProvider, Provider, ProviderDescriptor, ProviderError, ProviderRegistry, ProviderRole,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use scheduler::{JobContext, JobSpec, Scheduler};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{CoreEvent, Emitter};

pub mod prelude;
