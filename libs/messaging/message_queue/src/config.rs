//! Message queue configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `MESSAGE_QUEUE_*` environment variables.
//!
//! ```toml
//! service_url = "pulsar://broker.internal:6650"
//! receive_timeout_ms = 5000
//! batch_max_messages = 1000
//! batch_max_delay_ms = 1
//! compression = "zstd"            # none, zstd
//! zstd_level = 3
//! metrics_prefix = "message-queue"
//! ```

use crate::broker::{BatchConfig, Compression};
use crate::error::QueueError;
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const ENV_PREFIX: &str = "MESSAGE_QUEUE";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// Broker service URL
    pub service_url: String,

    /// Deadline for a single receive call, in milliseconds
    pub receive_timeout_ms: u64,

    /// Flush a producer batch once it holds this many messages
    pub batch_max_messages: usize,

    /// Flush a producer batch after this long, in milliseconds
    pub batch_max_delay_ms: u64,

    pub compression: Compression,

    pub zstd_level: i32,

    /// First segment of every metric name
    pub metrics_prefix: String,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            service_url: "pulsar://localhost:6650".to_string(),
            receive_timeout_ms: 5_000,
            batch_max_messages: 1000,
            batch_max_delay_ms: 1,
            compression: Compression::Zstd,
            zstd_level: 3,
            metrics_prefix: "message-queue".to_string(),
        }
    }
}

impl MessageQueueConfig {
    /// Load defaults, then `path` if given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, QueueError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            info!("Loading message queue config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, QueueError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        url::Url::parse(&self.service_url).map_err(|e| {
            QueueError::invalid_config(format!("service_url '{}': {}", self.service_url, e))
        })?;

        if self.receive_timeout_ms == 0 {
            return Err(QueueError::invalid_config(
                "receive_timeout_ms must be greater than 0",
            ));
        }
        if self.batch_max_messages == 0 {
            return Err(QueueError::invalid_config(
                "batch_max_messages must be greater than 0",
            ));
        }
        if self.compression == Compression::Zstd && !(1..=22).contains(&self.zstd_level) {
            return Err(QueueError::invalid_config(format!(
                "zstd_level {} outside 1..=22",
                self.zstd_level
            )));
        }
        if self.metrics_prefix.is_empty() {
            return Err(QueueError::invalid_config("metrics_prefix must not be empty"));
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            max_messages: self.batch_max_messages,
            max_delay: Duration::from_millis(self.batch_max_delay_ms),
        }
    }
}
