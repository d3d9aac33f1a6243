use crate::broker::BrokerClient;
use crate::config::MessageQueueConfig;
use crate::error::QueueError;
use crate::metrics::MetricsRegistry;
use crate::reader::BrokerQueueReader;
use crate::writer::BrokerQueueWriter;
use std::sync::Arc;

const TOPIC_SUFFIX: &str = "-message-queue";

/// Broker resource names derived from a queue name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub name: String,
    pub topic: String,
    pub subscription: String,
    pub producer: String,
}

impl QueueNames {
    pub fn new(name: &str) -> Result<Self, QueueError> {
        if name.trim().is_empty() {
            return Err(QueueError::InvalidArgument(
                "queue name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            topic: format!("{}{}", name, TOPIC_SUFFIX),
            subscription: name.to_string(),
            producer: name.to_string(),
        })
    }
}

/// Builds readers and writers that share one broker, config and registry
#[derive(Debug, Clone)]
pub struct MessageQueueFactory {
    broker: Arc<dyn BrokerClient>,
    config: MessageQueueConfig,
    registry: Arc<MetricsRegistry>,
}

impl MessageQueueFactory {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: MessageQueueConfig,
    ) -> Result<Self, QueueError> {
        Self::with_registry(broker, config, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_registry(
        broker: Arc<dyn BrokerClient>,
        config: MessageQueueConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            broker,
            config,
            registry,
        })
    }

    pub fn config(&self) -> &MessageQueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn reader(&self, name: &str) -> Result<BrokerQueueReader, QueueError> {
        Ok(BrokerQueueReader::new(
            self.broker.clone(),
            self.config.clone(),
            QueueNames::new(name)?,
            &self.registry,
        ))
    }

    pub fn writer(&self, name: &str) -> Result<BrokerQueueWriter, QueueError> {
        Ok(BrokerQueueWriter::new(
            self.broker.clone(),
            self.config.clone(),
            QueueNames::new(name)?,
            &self.registry,
        ))
    }
}
