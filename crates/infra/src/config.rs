//! Engine configuration: defaults, overridable from `DROWL_*` environment
//! variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use drowl_core::{BackoffPolicy, ConfidenceLevel};
use drowl_plugins::Capability;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of dispatcher worker tasks.
    pub worker_count: usize,
    /// Idle workers re-check the store at this interval.
    pub poll_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_concurrent_per_capability: usize,
    pub concurrency_overrides: HashMap<Capability, usize>,
    /// Longest pagination chain a single ingestion may spawn.
    pub max_batches_per_chain: u32,
    /// Enqueue identity resolution and keyword extraction after ingestion.
    pub auto_process_events: bool,
    pub min_link_confidence: ConfidenceLevel,
    pub redis_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(250),
            retry_base_delay: backoff.base_delay,
            retry_max_delay: backoff.max_delay,
            max_concurrent_per_capability: 4,
            concurrency_overrides: HashMap::new(),
            max_batches_per_chain: 100,
            auto_process_events: true,
            min_link_confidence: ConfidenceLevel::Low,
            redis_url: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DROWL_WORKER_COUNT") {
            config.worker_count = positive("DROWL_WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("DROWL_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(positive("DROWL_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("DROWL_RETRY_BASE_DELAY_MS") {
            config.retry_base_delay = Duration::from_millis(parse("DROWL_RETRY_BASE_DELAY_MS", &v)?);
        }
        if let Some(v) = get("DROWL_RETRY_MAX_DELAY_MS") {
            config.retry_max_delay = Duration::from_millis(parse("DROWL_RETRY_MAX_DELAY_MS", &v)?);
        }
        if let Some(v) = get("DROWL_MAX_CONCURRENT_PER_CAPABILITY") {
            config.max_concurrent_per_capability = positive("DROWL_MAX_CONCURRENT_PER_CAPABILITY", &v)?;
        }
        if let Some(v) = get("DROWL_MAX_BATCHES_PER_CHAIN") {
            config.max_batches_per_chain = positive("DROWL_MAX_BATCHES_PER_CHAIN", &v)?;
        }
        if let Some(v) = get("DROWL_AUTO_PROCESS_EVENTS") {
            config.auto_process_events = boolean("DROWL_AUTO_PROCESS_EVENTS", &v)?;
        }
        if let Some(v) = get("DROWL_MIN_LINK_CONFIDENCE") {
            config.min_link_confidence = parse("DROWL_MIN_LINK_CONFIDENCE", &v)?;
        }
        config.redis_url = get("DROWL_REDIS_URL");

        if config.retry_max_delay < config.retry_base_delay {
            return Err(ConfigError::Invalid {
                key: "DROWL_RETRY_MAX_DELAY_MS",
                value: config.retry_max_delay.as_millis().to_string(),
                reason: "must not be smaller than the base delay".to_string(),
            });
        }
        Ok(config)
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max.max(base);
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent_per_capability = n.max(1);
        self
    }

    pub fn with_concurrency_override(mut self, capability: Capability, n: usize) -> Self {
        self.concurrency_overrides.insert(capability, n.max(1));
        self
    }

    pub fn with_max_batches_per_chain(mut self, n: u32) -> Self {
        self.max_batches_per_chain = n.max(1);
        self
    }

    pub fn with_auto_process_events(mut self, enabled: bool) -> Self {
        self.auto_process_events = enabled;
        self
    }

    pub fn with_min_link_confidence(mut self, level: ConfidenceLevel) -> Self {
        self.min_link_confidence = level;
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_base_delay, self.retry_max_delay)
    }

    pub fn concurrency_for(&self, capability: Capability) -> usize {
        self.concurrency_overrides
            .get(&capability)
            .copied()
            .unwrap_or(self.max_concurrent_per_capability)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: core::fmt::Display,
{
    let parsed: T = parse(key, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn boolean(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
