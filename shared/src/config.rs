use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::QueueName;
use crate::transport::ValidatedUrl;
use crate::{
    DEFAULT_RETENTION_MS, DEFAULT_TRANSPORT_TIMEOUT_MS, MAX_BATCH_SIZE, MAX_TRANSPORT_TIMEOUT_MS,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// One logical queue and the endpoint its batches are posted to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: QueueName,
    pub endpoint: String,
}

impl QueueConfig {
    pub fn new(name: QueueName, endpoint: impl Into<String>) -> Self {
        Self {
            name,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite database file. `None` keeps everything in memory (tests only:
    /// nothing survives a restart).
    pub database_path: Option<PathBuf>,
    pub max_batch_size: usize,
    pub retention_ms: u64,
    pub transport_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
    pub max_payload_bytes: usize,
    pub notify_capacity: usize,
    pub queues: Vec<QueueConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_batch_size: MAX_BATCH_SIZE,
            retention_ms: DEFAULT_RETENTION_MS,
            transport_timeout_ms: DEFAULT_TRANSPORT_TIMEOUT_MS,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter_max_ms: 1_000,
            max_payload_bytes: 1024 * 1024,
            notify_capacity: 64,
            queues: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue(mut self, name: QueueName, endpoint: impl Into<String>) -> Self {
        self.queues.push(QueueConfig::new(name, endpoint));
        self
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub fn queue(&self, name: &QueueName) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| &q.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be > 0".into()));
        }
        if self.retention_ms == 0 {
            return Err(ConfigError::Invalid("retention_ms must be > 0".into()));
        }
        if self.transport_timeout_ms == 0 || self.transport_timeout_ms > MAX_TRANSPORT_TIMEOUT_MS
        {
            return Err(ConfigError::Invalid(format!(
                "transport_timeout_ms must be in 1..={MAX_TRANSPORT_TIMEOUT_MS}"
            )));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.notify_capacity == 0 {
            return Err(ConfigError::Invalid("notify_capacity must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if !seen.insert(&queue.name) {
                return Err(ConfigError::Invalid(format!(
                    "queue {} configured twice",
                    queue.name
                )));
            }
            ValidatedUrl::new(&queue.endpoint).map_err(|e| {
                ConfigError::Invalid(format!("queue {}: {e}", queue.name))
            })?;
        }
        Ok(())
    }
}
