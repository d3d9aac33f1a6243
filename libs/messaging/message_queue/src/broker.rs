//! Broker collaborator contract
//!
//! The adapter never talks to a broker's wire protocol directly. Everything it
//! needs is expressed through these traits: connecting, creating one consumer
//! or producer per queue, bounded receive, acknowledge and send. Connection
//! management, batching and compression internals belong to the
//! implementation; the adapter only describes the configuration it wants via
//! [`ConsumerOptions`] and [`ProducerOptions`].
//!
//! [`crate::memory::InMemoryBroker`] is the in-process implementation.

use crate::entry::CommitId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Per-message hook invoked with the payload length at the broker boundary
///
/// Consumers call it once for every message handed to the adapter, producers
/// once for every message dispatched to the topic. It must never alter,
/// delay or drop the message.
pub type MessageInterceptor = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broker handle closed")]
    Closed,

    #[error("Send error: {0}")]
    Send(String),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Acknowledge error: {0}")]
    Acknowledge(String),

    #[error("Unknown commit id {0}")]
    UnknownCommitId(String),

    #[error("Compression error ({algorithm}): {message}")]
    Compression {
        algorithm: &'static str,
        message: String,
    },

    #[error("Invalid service URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

impl BrokerError {
    pub fn compression(algorithm: &'static str, message: impl Into<String>) -> Self {
        BrokerError::Compression {
            algorithm,
            message: message.into(),
        }
    }
}

/// Payload compression applied by the producer before transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }
}

/// Producer-side batching policy: flush at `max_messages` or after
/// `max_delay`, whichever comes first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_messages: usize,
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_delay: Duration::from_millis(1),
        }
    }
}

#[derive(Clone)]
pub struct ConsumerOptions {
    pub topic: String,
    pub subscription: String,
    pub interceptor: Option<MessageInterceptor>,
}

impl Debug for ConsumerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct ProducerOptions {
    pub topic: String,
    pub producer_name: String,
    pub batch: BatchConfig,
    pub compression: Compression,
    pub compression_level: i32,
    pub interceptor: Option<MessageInterceptor>,
}

impl Debug for ProducerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerOptions")
            .field("topic", &self.topic)
            .field("producer_name", &self.producer_name)
            .field("batch", &self.batch)
            .field("compression", &self.compression)
            .field("compression_level", &self.compression_level)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

/// Message handed to a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub value: Bytes,
    pub key: Option<String>,
    /// Event time in epoch millis; always > 0 when set
    pub event_time: Option<u64>,
}

impl OutboundMessage {
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            key: None,
            event_time: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_event_time(mut self, event_time: u64) -> Self {
        self.event_time = Some(event_time);
        self
    }
}

/// Message delivered by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub commit_id: CommitId,
    pub value: Bytes,
    pub key: Option<String>,
    pub event_time: Option<u64>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync + Debug {
    /// Short broker identifier used in metric names
    fn name(&self) -> &str;

    async fn connect(&self, service_url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + Debug {
    async fn create_consumer(
        &self,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError>;

    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync + Debug {
    /// Wait up to `timeout` for the next message; `Ok(None)` if none arrived
    async fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError>;

    async fn acknowledge(&self, commit_id: &CommitId) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync + Debug {
    /// Resolves once the message's batch has been dispatched to the topic
    async fn send(&self, message: OutboundMessage) -> Result<CommitId, BrokerError>;

    fn producer_name(&self) -> &str;

    /// Flushes any pending batch, then rejects further sends
    async fn close(&self) -> Result<(), BrokerError>;
}
