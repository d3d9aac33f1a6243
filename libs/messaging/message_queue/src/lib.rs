//! # Message Queue
//!
//! Durable message queue adapter over a publish/subscribe broker.
//!
//! Each named queue maps onto one broker topic (`<name>-message-queue`). A
//! [`BrokerQueueReader`] consumes it through a shared subscription named
//! after the queue, and a [`BrokerQueueWriter`] produces to it with batching
//! and zstd compression.
//!
//! Both are lifecycle-managed services. Queue operations wait until the
//! service is running, so a writer can be handed out before the broker
//! connection exists:
//!
//! ```rust,no_run
//! use message_queue::{
//!     InMemoryBroker, ManagedService, MessageQueueConfig, MessageQueueFactory,
//!     MessageQueueReader, MessageQueueWriter,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), message_queue::QueueError> {
//! let factory = MessageQueueFactory::new(
//!     Arc::new(InMemoryBroker::new()),
//!     MessageQueueConfig::default(),
//! )?;
//! let writer = factory.writer("events")?;
//! let reader = factory.reader("events")?;
//! writer.start().await?;
//! reader.start().await?;
//!
//! let entry = writer.create_entry(b"id-1".to_vec(), None, b"hello".to_vec(), 0);
//! writer.write(&[entry]).await?;
//!
//! let envelope = reader.read(1).await?;
//! envelope.commit_all().await?;
//!
//! reader.stop().await?;
//! writer.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery
//!
//! Delivery is at-least-once. Entries returned by `read`/`subscribe` stay
//! unacknowledged until committed through their [`Envelope`]; uncommitted
//! entries are redelivered once the consumer closes.
//!
//! ## Metrics
//!
//! Every message crossing the broker boundary is counted by a
//! [`MessageInterceptor`] installed on the consumer or producer, see
//! [`metrics`].

pub mod broker;
pub mod config;
pub mod entry;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod reader;
pub mod writer;

pub use broker::{
    BatchConfig, BrokerClient, BrokerConnection, BrokerConsumer, BrokerError, BrokerProducer,
    Compression, ConsumerOptions, InboundMessage, MessageInterceptor, OutboundMessage,
    ProducerOptions,
};
pub use config::MessageQueueConfig;
pub use entry::{CommitId, Entry, Envelope};
pub use error::{BrokerOperation, QueueError};
pub use factory::{MessageQueueFactory, QueueNames};
pub use lifecycle::{Lifecycle, Readiness, ServiceState};
pub use memory::{ClosedHandle, InMemoryBroker};
pub use metrics::{Direction, MetricValue, MetricsRegistry, MetricsSnapshot, QueueMetrics};
pub use reader::BrokerQueueReader;
pub use writer::BrokerQueueWriter;

use async_trait::async_trait;
use bytes::Bytes;

/// A startable, stoppable queue service
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Connect to the broker and open the readiness gate
    ///
    /// Valid only from `Idle`. On failure the service moves to `Failed` and
    /// anyone waiting on the gate is released with `NotRunning`.
    async fn start(&self) -> Result<(), QueueError>;

    /// Release broker resources and terminate
    async fn stop(&self) -> Result<(), QueueError>;

    fn state(&self) -> ServiceState;

    fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Release callers currently waiting for the service to start
    fn interrupt(&self);
}

/// Consuming side of a named queue
#[async_trait]
pub trait MessageQueueReader: ManagedService {
    fn create_entry(
        &self,
        id: Vec<u8>,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        timestamp: i64,
    ) -> Entry {
        Entry::new(id, key.map(Bytes::from), value, timestamp)
    }

    /// Receive exactly `count` entries
    ///
    /// Fails with [`QueueError::Timeout`] if any single receive times out;
    /// entries received before the timeout are not returned.
    async fn read(&self, count: usize) -> Result<Envelope, QueueError>;

    /// Deliver entries to `handler` one at a time until the service stops
    async fn subscribe(
        &self,
        handler: &mut (dyn FnMut(Envelope) + Send),
    ) -> Result<(), QueueError>;
}

/// Producing side of a named queue
#[async_trait]
pub trait MessageQueueWriter: ManagedService {
    fn create_entry(
        &self,
        id: Vec<u8>,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        timestamp: i64,
    ) -> Entry {
        Entry::new(id, key.map(Bytes::from), value, timestamp)
    }

    /// Send entries in order, stopping at the first failure
    async fn write(&self, entries: &[Entry]) -> Result<(), QueueError>;
}
