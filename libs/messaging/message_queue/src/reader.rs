//! Broker-backed queue reader
//!
//! Consumes `<name>-message-queue` through the shared subscription `<name>`.
//! Reads are bounded per receive by `receive_timeout`; a read of `count`
//! entries either returns all of them or fails.

use crate::broker::{BrokerClient, BrokerConnection, BrokerConsumer, ConsumerOptions};
use crate::config::MessageQueueConfig;
use crate::entry::{Entry, Envelope};
use crate::error::{BrokerOperation, QueueError};
use crate::factory::QueueNames;
use crate::lifecycle::{Lifecycle, Readiness, ServiceHandles, ServiceState};
use crate::metrics::{Direction, MetricsRegistry, QueueMetrics};
use crate::{ManagedService, MessageQueueReader};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ReaderHandles {
    connection: Arc<dyn BrokerConnection>,
    consumer: Arc<dyn BrokerConsumer>,
}

#[async_trait]
impl ServiceHandles for ReaderHandles {
    async fn close(&self) -> Result<(), QueueError> {
        let mut first_error = None;

        if let Err(e) = self.consumer.close().await {
            warn!("Failed to close consumer: {}", e);
            first_error.get_or_insert(QueueError::broker(BrokerOperation::Close, e));
        }
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close broker connection: {}", e);
            first_error.get_or_insert(QueueError::broker(BrokerOperation::Close, e));
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[derive(Debug)]
pub struct BrokerQueueReader {
    lifecycle: Lifecycle<ReaderHandles>,
    broker: Arc<dyn BrokerClient>,
    config: MessageQueueConfig,
    names: QueueNames,
    metrics: QueueMetrics,
}

impl BrokerQueueReader {
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
            Direction::Reader,
        );
        Self {
            lifecycle: Lifecycle::new(format!("{}-reader", names.name)),
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

    async fn open_handles(&self) -> Result<ReaderHandles, QueueError> {
        let connection = self
            .broker
            .connect(&self.config.service_url)
            .await
            .map_err(|e| QueueError::broker(BrokerOperation::Connect, e))?;

        let options = ConsumerOptions {
            topic: self.names.topic.clone(),
            subscription: self.names.subscription.clone(),
            interceptor: Some(self.metrics.interceptor()),
        };

        match connection.create_consumer(options).await {
            Ok(consumer) => {
                info!(
                    "Reader subscribed to {} as '{}' via {}, metrics under {}",
                    self.names.topic,
                    self.names.subscription,
                    self.broker.name(),
                    self.metrics.base_name()
                );
                Ok(ReaderHandles {
                    connection,
                    consumer,
                })
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(
                        "Failed to close broker connection after consumer error: {}",
                        close_err
                    );
                }
                Err(QueueError::broker(BrokerOperation::CreateConsumer, e))
            }
        }
    }

    /// One bounded receive, timed with the reader timer
    async fn receive_one(&self, consumer: &dyn BrokerConsumer) -> Result<Option<Entry>, QueueError> {
        let _timer = self.metrics.timer().time();
        let received = consumer
            .receive(self.config.receive_timeout())
            .await
            .map_err(|e| QueueError::broker(BrokerOperation::Receive, e))?;
        Ok(received.map(Entry::from_message))
    }
}

#[async_trait]
impl ManagedService for BrokerQueueReader {
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
impl MessageQueueReader for BrokerQueueReader {
    async fn read(&self, count: usize) -> Result<Envelope, QueueError> {
        if count == 0 {
            return Err(QueueError::InvalidArgument(
                "read count must be at least 1".to_string(),
            ));
        }
        if self.lifecycle.await_running().await? == Readiness::Interrupted {
            return Err(QueueError::Interrupted);
        }
        let handles = self.lifecycle.handles()?;

        let mut entries = Vec::with_capacity(count.min(1024));
        while entries.len() < count {
            match self.receive_one(handles.consumer.as_ref()).await? {
                Some(entry) => entries.push(entry),
                None => {
                    debug!(
                        "Read from {} timed out after {} of {} entries",
                        self.names.topic,
                        entries.len(),
                        count
                    );
                    return Err(QueueError::Timeout {
                        waited: self.config.receive_timeout(),
                    });
                }
            }
        }

        Ok(Envelope::new(entries, handles.consumer.clone()))
    }

    async fn subscribe(
        &self,
        handler: &mut (dyn FnMut(Envelope) + Send),
    ) -> Result<(), QueueError> {
        if self.lifecycle.await_running().await? == Readiness::Interrupted {
            return Ok(());
        }
        let handles = self.lifecycle.handles()?;
        info!("Subscription loop started on {}", self.names.topic);

        while self.lifecycle.is_running() {
            match self.receive_one(handles.consumer.as_ref()).await {
                Ok(Some(entry)) => {
                    handler(Envelope::new(vec![entry], handles.consumer.clone()));
                }
                Ok(None) => {}
                // Shutdown closes the consumer under us
                Err(e) if !self.lifecycle.is_running() => {
                    debug!("Subscription on {} ended by shutdown: {}", self.names.topic, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!("Subscription loop stopped on {}", self.names.topic);
        Ok(())
    }
}
