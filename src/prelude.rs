//! Convenience re-exports for embedders.
//!
//! ```rust
//! use adit::prelude::*;
//! ```

pub use crate::breaker::{BreakerConfig, BreakerSnapshot, CircuitState};
pub use crate::cache::{CacheConfig, CacheStats, EntryStatus};
pub use crate::config::CoreConfig;
pub use crate::dispatch::{
    Dispatcher, DispatcherConfig, PublishError, Publisher, ReplayFilter, ReplayReport,
};
pub use crate::error::FetchError;
pub use crate::fingerprint::{Fingerprint, Params};
pub use crate::hub::{DataHub, FetchMeta, KindConfig};
pub use crate::lease::LeaderElector;
pub use crate::provider::{
    FnProvider, Provider, ProviderDescriptor, ProviderError, ProviderRegistry,
};
pub use crate::retry::RetryConfig;
pub use crate::scheduler::{JobContext, JobSpec, Scheduler};
pub use crate::store::{InboxStore, LeaseStore, NewEvent, OutboxStore};
pub use crate::telemetry::{CoreEvent, Emitter, JsonlSink, LogSink, MemorySink};
