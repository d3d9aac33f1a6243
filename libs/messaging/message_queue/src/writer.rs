//! Broker-backed queue writer
//!
//! Produces to `<name>-message-queue` with producer name `<name>`. Sends are
//! batched and compressed by the producer; each `send` resolves once its
//! batch has been dispatched, so `write` returning `Ok` means every entry
//! reached the topic.

use crate::broker::{
    BrokerClient, BrokerConnection, BrokerProducer, OutboundMessage, ProducerOptions,
};
use crate::config::MessageQueueConfig;
use crate::entry::Entry;
use crate::error::{BrokerOperation, QueueError};
use crate::factory::QueueNames;
use crate::lifecycle::{Lifecycle, Readiness, ServiceHandles, ServiceState};
use crate::metrics::{Direction, MetricsRegistry, QueueMetrics};
use crate::{ManagedService, MessageQueueWriter};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct WriterHandles {
    connection: Arc<dyn BrokerConnection>,
    producer: Arc<dyn BrokerProducer>,
}

#[async_trait]
impl ServiceHandles for WriterHandles {
    async fn close(&self) -> Result<(), QueueError> {
        let mut first_error = None;

        // Flushes the pending batch
        if let Err(e) = self.producer.close().await {
            warn!("Failed to close producer '{}': {}", self.producer.producer_name(), e);
            first_error.get_or_insert(QueueError::broker(BrokerOperation::Close, e));
        }
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close broker connection: {}", e);
            first_error.get_or_insert(QueueError::broker(BrokerOperation::Close, e));
        }

        first_error.map_or(Ok(()), Err)
    }
}

/// Broker message for one entry
///
/// The key is decoded as UTF-8, replacing invalid sequences. Event time is
/// only set for positive timestamps.
fn outbound_message(entry: &Entry) -> OutboundMessage {
    let mut message = OutboundMessage::new(entry.value().clone());
    if let Some(key) = entry.key() {
        message = message.with_key(String::from_utf8_lossy(key).into_owned());
    }
    if let Some(event_time) = entry.event_time() {
        message = message.with_event_time(event_time);
    }
    message
}

#[derive(Debug)]
pub struct BrokerQueueWriter {
    lifecycle: Lifecycle<WriterHandles>,
    broker: Arc<dyn BrokerClient>,
    config: MessageQueueConfig,
    names: QueueNames,
    metrics: QueueMetrics,
}

impl BrokerQueueWriter {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: MessageQueueConfig,
        names: QueueNames,
        registry: &MetricsRegistry,
    ) -> Self {
        let metrics = QueueMetrics::new(
            registry,
            &config.metrics_prefix,
            broker.name(),
            &names.name,
            Direction::Writer,
        );
        Self {
            lifecycle: Lifecycle::new(format!("{}-writer", names.name)),
            broker,
            config,
            names,
            metrics,
        }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn failure_cause(&self) -> Option<QueueError> {
        self.lifecycle.failure_cause()
    }

    fn producer_options(&self) -> ProducerOptions {
        ProducerOptions {
            topic: self.names.topic.clone(),
            producer_name: self.names.producer.clone(),
            batch: self.config.batch(),
            compression: self.config.compression,
            compression_level: self.config.zstd_level,
            interceptor: Some(self.metrics.interceptor()),
        }
    }

    async fn open_handles(&self) -> Result<WriterHandles, QueueError> {
        let connection = self
            .broker
            .connect(&self.config.service_url)
            .await
            .map_err(|e| QueueError::broker(BrokerOperation::Connect, e))?;

        let options = self.producer_options();
        debug!(
            "Creating producer '{}' on {}: batch {} / {:?}, compression {} (level {})",
            options.producer_name,
            options.topic,
            options.batch.max_messages,
            options.batch.max_delay,
            options.compression.name(),
            options.compression_level
        );

        match connection.create_producer(options).await {
            Ok(producer) => {
                info!(
                    "Writer producing to {} as '{}' via {}, metrics under {}",
                    self.names.topic,
                    producer.producer_name(),
                    self.broker.name(),
                    self.metrics.base_name()
                );
                Ok(WriterHandles {
                    connection,
                    producer,
                })
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(
                        "Failed to close broker connection after producer error: {}",
                        close_err
                    );
                }
                Err(QueueError::broker(BrokerOperation::CreateProducer, e))
            }
        }
    }
}

#[async_trait]
impl ManagedService for BrokerQueueWriter {
    async fn start(&self) -> Result<(), QueueError> {
        self.lifecycle.start(|| self.open_handles()).await
    }

    async fn stop(&self) -> Result<(), QueueError> {
        self.lifecycle.stop().await
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    fn interrupt(&self) {
        self.lifecycle.interrupt();
    }
}

#[async_trait]
impl MessageQueueWriter for BrokerQueueWriter {
    async fn write(&self, entries: &[Entry]) -> Result<(), QueueError> {
        if self.lifecycle.await_running().await? == Readiness::Interrupted {
            return Ok(());
        }
        let handles = self.lifecycle.handles()?;

        for entry in entries {
            debug!("Sending message {} to {}", entry, self.names.topic);
            let _timer = self.metrics.timer().time();
            handles
                .producer
                .send(outbound_message(entry))
                .await
                .map_err(|e| QueueError::broker_for_entry(BrokerOperation::Send, entry, e))?;
        }
        Ok(())
    }
}
