//! Construction-time configuration for the consumer

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::monitoring::MonitoringConfig;
use crate::retry::RetryConfig;

pub const MAX_PROCESS_THREADS: &str = "max.process.threads";
pub const CORE_PROCESS_THREADS: &str = "core.process.threads";
pub const PROCESS_QUEUE_SIZE: &str = "process.queue.size";
pub const PROCESS_KEEPALIVE_MS: &str = "process.keepalive.ms";
pub const BACKPRESSURE_POLL_MS: &str = "backpressure.poll.ms";
pub const DRAIN_TIMEOUT_MS: &str = "drain.timeout.ms";
pub const ERROR_RETRY_MAX: &str = "error.retry.max";
pub const ERROR_THREADS: &str = "error.threads";

/// Configuration for the topic consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Broker properties, passed through untouched apart from the keys above
    pub properties: HashMap<String, String>,
    /// Maximum number of concurrent stage-2 tasks
    pub max_process_workers: usize,
    /// Workers kept alive while idle
    pub core_process_workers: usize,
    /// Stage-2 tasks allowed to wait for a worker (None means `max_process_workers`)
    pub process_queue_capacity: Option<usize>,
    /// How long a non-core worker may sit idle
    pub process_keep_alive: Duration,
    /// Upper bound between capacity checks in the backpressure gate
    pub backpressure_poll_interval: Duration,
    /// How long close() waits for each pool to drain
    pub drain_timeout: Duration,
    /// Stage-2 calls slower than this are logged
    pub slow_process_threshold: Duration,
    /// Workers in the error reprocessor
    pub reprocess_concurrency: usize,
    /// Retry policy of the error reprocessor
    pub retry: RetryConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            properties: HashMap::new(),
            max_process_workers: 10,
            core_process_workers: 1,
            process_queue_capacity: None,
            process_keep_alive: Duration::from_secs(30),
            backpressure_poll_interval: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(30),
            slow_process_threshold: Duration::from_secs(1),
            reprocess_concurrency: 1,
            retry: RetryConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build a config from flat properties.
    ///
    /// Recognised keys override the defaults; every property is kept in
    /// `properties` for the broker.
    pub fn from_properties(properties: HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_key::<usize>(&properties, MAX_PROCESS_THREADS)? {
            config.max_process_workers = v;
        }
        if let Some(v) = parse_key::<usize>(&properties, CORE_PROCESS_THREADS)? {
            config.core_process_workers = v;
        }
        if let Some(v) = parse_key::<usize>(&properties, PROCESS_QUEUE_SIZE)? {
            config.process_queue_capacity = Some(v);
        }
        if let Some(v) = parse_key::<u64>(&properties, PROCESS_KEEPALIVE_MS)? {
            config.process_keep_alive = Duration::from_millis(v);
        }
        if let Some(v) = parse_key::<u64>(&properties, BACKPRESSURE_POLL_MS)? {
            config.backpressure_poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_key::<u64>(&properties, DRAIN_TIMEOUT_MS)? {
            config.drain_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_key::<u32>(&properties, ERROR_RETRY_MAX)? {
            config.retry.max_retries = Some(v);
        }
        if let Some(v) = parse_key::<usize>(&properties, ERROR_THREADS)? {
            config.reprocess_concurrency = v;
        }

        config.properties = properties;
        config.validate()?;
        Ok(config)
    }

    /// Effective stage-2 queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.process_queue_capacity.unwrap_or(self.max_process_workers)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_process_workers == 0 {
            return Err(PipelineError::ConfigError(
                "max_process_workers must be at least 1".to_string(),
            ));
        }
        if self.core_process_workers == 0 || self.core_process_workers > self.max_process_workers {
            return Err(PipelineError::ConfigError(format!(
                "need 1 <= core_process_workers ({}) <= max_process_workers ({})",
                self.core_process_workers, self.max_process_workers
            )));
        }
        if self.reprocess_concurrency == 0 {
            return Err(PipelineError::ConfigError(
                "reprocess_concurrency must be at least 1".to_string(),
            ));
        }
        if self.backpressure_poll_interval.is_zero() {
            return Err(PipelineError::ConfigError(
                "backpressure_poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_key<T: FromStr>(properties: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match properties.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            PipelineError::ConfigError(format!("invalid value {:?} for {}: {}", raw, key, e))
        }),
    }
}
