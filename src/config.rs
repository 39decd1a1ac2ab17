//! Configuration surface for the core.
//!
//! The wire format is JSON with millisecond integer durations (`*_ms`).
//! Every section has defaults, so an empty object is a valid config.

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::hub::KindConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub outbox: OutboxSettings,
    #[serde(default)]
    pub leader: LeaderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_shards() -> usize {
    8
}

fn default_max_entries() -> usize {
    4_096
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { shards: default_shards(), max_entries: default_max_entries() }
    }
}

impl CacheSettings {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig { shards: self.shards, max_entries: self.max_entries }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default)]
    pub kinds: Vec<KindSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindSettings {
    pub name: String,
    pub fresh_ttl_ms: u64,
    pub stale_ttl_ms: u64,
    pub deadline_ms: u64,
    #[serde(default)]
    pub swr: bool,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// Provider ids forming this kind's chain, in order.
    #[serde(default)]
    pub providers: Vec<String>,
}

impl KindSettings {
    pub fn kind_config(&self) -> KindConfig {
        KindConfig {
            name: self.name.clone(),
            fresh_ttl: Duration::from_millis(self.fresh_ttl_ms),
            stale_ttl: Duration::from_millis(self.stale_ttl_ms),
            deadline: Duration::from_millis(self.deadline_ms),
            swr: self.swr,
            max_concurrent: self.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker.threshold,
            cool_down: Duration::from_millis(self.breaker.cool_down_ms),
            half_open: self.breaker.half_open,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,
    #[serde(default = "default_half_open")]
    pub half_open: usize,
}

fn default_threshold() -> usize {
    5
}

fn default_cool_down_ms() -> u64 {
    30_000
}

fn default_half_open() -> usize {
    1
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            cool_down_ms: default_cool_down_ms(),
            half_open: default_half_open(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    pub name: String,
    pub interval_ms: u64,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default = "default_job_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_job_deadline_ms() -> u64 {
    60_000
}

impl JobSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_outbox_attempts")]
    pub max_attempts: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_outbox_attempts() -> u32 {
    10
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_outbox_attempts(),
        }
    }
}

impl OutboxSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderSettings {
    #[serde(default = "default_lease_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

impl Default for LeaderSettings {
    fn default() -> Self {
        Self { ttl_ms: default_lease_ttl_ms(), heartbeat_interval_ms: default_heartbeat_ms() }
    }
}

impl LeaderSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.shards == 0 {
            return Err(ConfigError::Invalid("cache.shards must be > 0".into()));
        }
        if self.cache.max_entries < self.cache.shards {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be >= cache.shards".into(),
            ));
        }
        for kind in &self.hub.kinds {
            if kind.fresh_ttl_ms > kind.stale_ttl_ms {
                return Err(ConfigError::Invalid(format!(
                    "kind {}: fresh_ttl must be <= stale_ttl",
                    kind.name
                )));
            }
            if kind.deadline_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "kind {}: deadline must be > 0",
                    kind.name
                )));
            }
            for provider in &kind.providers {
                if !self.providers.contains_key(provider) {
                    return Err(ConfigError::Invalid(format!(
                        "kind {} references unknown provider {}",
                        kind.name, provider
                    )));
                }
            }
        }
        for (id, provider) in &self.providers {
            if provider.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider {}: timeout must be > 0",
                    id
                )));
            }
            if provider.retry.multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "provider {}: retry.multiplier must be >= 1",
                    id
                )));
            }
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid("outbox.batch_size must be > 0".into()));
        }
        if self.outbox.max_attempts == 0 {
            return Err(ConfigError::Invalid("outbox.max_attempts must be > 0".into()));
        }
        if self.leader.heartbeat_interval_ms > self.leader.ttl_ms / 3 {
            return Err(ConfigError::Invalid(
                "leader.heartbeat_interval must be <= ttl / 3".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_parses_with_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config.cache.shards, 8);
        assert_eq!(config.cache.max_entries, 4_096);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.leader.ttl(), Duration::from_secs(30));
        assert_eq!(config.leader.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn full_config_round_trips() {
        let raw = r#"{
            "cache": {"shards": 4, "max_entries": 1024},
            "hub": {"kinds": [{
                "name": "btc-price",
                "fresh_ttl_ms": 15000,
                "stale_ttl_ms": 120000,
                "deadline_ms": 3000,
                "swr": true,
                "max_concurrent": 4,
                "providers": ["coingecko", "blockchair"]
            }]},
            "providers": {
                "coingecko": {"timeout_ms": 2000,
                              "retry": {"max_attempts": 4, "initial_delay_ms": 50,
                                        "max_delay_ms": 2000, "multiplier": 2.0},
                              "breaker": {"threshold": 5, "cool_down_ms": 20000, "half_open": 2}},
                "blockchair": {"timeout_ms": 2500}
            },
            "scheduler": {"jobs": [{"name": "telemetry-poll", "interval_ms": 60000, "jitter_ms": 5000}]},
            "outbox": {"batch_size": 50, "poll_interval_ms": 500, "max_attempts": 8},
            "leader": {"ttl_ms": 30000, "heartbeat_interval_ms": 10000}
        }"#;
        let config = CoreConfig::from_json_str(raw).unwrap();

        let kind = &config.hub.kinds[0];
        let kc = kind.kind_config();
        assert_eq!(kc.fresh_ttl, Duration::from_secs(15));
        assert_eq!(kc.stale_ttl, Duration::from_secs(120));
        assert!(kc.swr);
        assert_eq!(kc.max_concurrent, Some(4));

        let provider = &config.providers["coingecko"];
        assert_eq!(provider.timeout(), Duration::from_secs(2));
        assert_eq!(provider.retry_config().max_attempts, 4);
        assert_eq!(provider.breaker_config().half_open, 2);

        // The undetailed provider falls back to defaults.
        assert_eq!(config.providers["blockchair"].retry_config().max_attempts, 3);

        assert_eq!(config.scheduler.jobs[0].interval(), Duration::from_secs(60));
        assert_eq!(config.scheduler.jobs[0].deadline(), Duration::from_secs(60));
    }

    #[test]
    fn fresh_ttl_above_stale_is_rejected() {
        let raw = r#"{"hub": {"kinds": [{
            "name": "k", "fresh_ttl_ms": 200, "stale_ttl_ms": 100, "deadline_ms": 1000
        }]}}"#;
        let err = CoreConfig::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("fresh_ttl"));
    }

    #[test]
    fn unknown_provider_reference_is_rejected() {
        let raw = r#"{"hub": {"kinds": [{
            "name": "k", "fresh_ttl_ms": 100, "stale_ttl_ms": 200, "deadline_ms": 1000,
            "providers": ["ghost"]
        }]}}"#;
        let err = CoreConfig::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn heartbeat_above_third_of_ttl_is_rejected() {
        let raw = r#"{"leader": {"ttl_ms": 9000, "heartbeat_interval_ms": 4000}}"#;
        let err = CoreConfig::from_json_str(raw).unwrap_err();
        assert!(err.to_string().contains("heartbeat"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let raw = r#"{"outbox": {"batch_size": 0}}"#;
        assert!(CoreConfig::from_json_str(raw).is_err());
    }
}
