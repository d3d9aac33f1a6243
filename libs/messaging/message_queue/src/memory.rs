//! In-process broker
//!
//! A complete [`BrokerClient`] that keeps topics in memory. It behaves like a
//! pub/sub broker with shared subscriptions:
//!
//! - **Topics** are append-only logs. The position in the log is the message
//!   sequence and doubles as its [`CommitId`].
//! - **Subscriptions** start at the earliest message. Each message is
//!   delivered to one consumer of the subscription and stays unacknowledged
//!   until a consumer acknowledges it. Messages a consumer received but never
//!   acknowledged are redelivered once that consumer closes.
//! - **Producers** buffer messages and dispatch a batch when it reaches
//!   `max_messages` or when `max_delay` has elapsed since the first buffered
//!   message. Payloads are compressed at dispatch. `send` resolves only after
//!   the message's batch has been dispatched.
//! - **Interceptors** run once per message: on dispatch for producers and on
//!   delivery for consumers.
//!
//! Faults can be armed on the broker so tests can drive every error path of
//! the reader and writer.

use crate::broker::{
    BrokerClient, BrokerConnection, BrokerConsumer, BrokerError, BrokerProducer, Compression,
    ConsumerOptions, InboundMessage, MessageInterceptor, OutboundMessage, ProducerOptions,
};
use crate::entry::CommitId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

pub const BROKER_NAME: &str = "memory";

/// Fails the operation after `n` more successful calls
#[derive(Debug, Default)]
struct FaultCountdown(Mutex<Option<usize>>);

impl FaultCountdown {
    fn arm(&self, after: usize) {
        *self.0.lock() = Some(after);
    }

    fn should_fail(&self) -> bool {
        let mut remaining = self.0.lock();
        match *remaining {
            Some(0) => {
                *remaining = None;
                true
            }
            Some(n) => {
                *remaining = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    connect: FaultCountdown,
    create_consumer: FaultCountdown,
    create_producer: FaultCountdown,
    receive: FaultCountdown,
    send: FaultCountdown,
    acknowledge: FaultCountdown,
    close: FaultCountdown,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<String>,
    event_time: Option<u64>,
    compression: Compression,
    uncompressed_len: usize,
    payload: Bytes,
    producer_name: String,
}

impl StoredMessage {
    fn decode(&self) -> Result<Bytes, BrokerError> {
        match self.compression {
            Compression::None => Ok(self.payload.clone()),
            Compression::Zstd => zstd::bulk::decompress(&self.payload, self.uncompressed_len)
                .map(Bytes::from)
                .map_err(|e| {
                    BrokerError::compression("zstd", format!("Decompression failed: {}", e))
                }),
        }
    }
}

#[derive(Debug, Default)]
struct SubscriptionState {
    /// Next log position never delivered to this subscription
    cursor: usize,
    redeliver: VecDeque<u64>,
    unacked: BTreeSet<u64>,
    acked: BTreeSet<u64>,
    /// Acknowledged sequences in acknowledgement order
    ack_order: Vec<u64>,
}

#[derive(Debug, Default)]
struct Topic {
    log: Mutex<Vec<StoredMessage>>,
    subscriptions: Mutex<HashMap<String, Arc<Mutex<SubscriptionState>>>>,
    notify: Notify,
    batches: AtomicU64,
}

impl Topic {
    fn subscription(&self, name: &str) -> Arc<Mutex<SubscriptionState>> {
        self.subscriptions
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn existing_subscription(&self, name: &str) -> Option<Arc<Mutex<SubscriptionState>>> {
        self.subscriptions.lock().get(name).cloned()
    }

    /// Next message for a subscription, marking it unacknowledged
    fn next_for(&self, subscription: &Mutex<SubscriptionState>) -> Option<(u64, StoredMessage)> {
        let mut sub = subscription.lock();
        let log = self.log.lock();

        let sequence = match sub.redeliver.pop_front() {
            Some(sequence) => sequence,
            None if sub.cursor < log.len() => {
                let sequence = sub.cursor as u64;
                sub.cursor += 1;
                sequence
            }
            None => return None,
        };

        sub.unacked.insert(sequence);
        log.get(sequence as usize)
            .cloned()
            .map(|message| (sequence, message))
    }
}

fn commit_id_for(sequence: u64) -> CommitId {
    CommitId::new(sequence.to_be_bytes().to_vec())
}

fn sequence_of(commit_id: &CommitId) -> Result<u64, BrokerError> {
    let raw: [u8; 8] = commit_id
        .as_bytes()
        .try_into()
        .map_err(|_| BrokerError::UnknownCommitId(commit_id.to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Broker handle released through `close`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedHandle {
    Consumer { subscription: String },
    Producer { name: String },
    Connection,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    faults: Faults,
    open_connections: AtomicUsize,
    closed_handles: Mutex<Vec<ClosedHandle>>,
}

impl BrokerState {
    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn existing_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.lock().get(name).cloned()
    }

    /// Record a released handle, then apply any armed close fault
    fn close_handle(&self, handle: ClosedHandle) -> Result<(), BrokerError> {
        self.closed_handles.lock().push(handle);
        if self.faults.close.should_fail() {
            return Err(BrokerError::Connection("injected close failure".to_string()));
        }
        Ok(())
    }
}

/// Message as stored on a topic, decoded for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub commit_id: CommitId,
    pub key: Option<String>,
    pub event_time: Option<u64>,
    pub value: Bytes,
    pub compression: Compression,
    /// Size of the payload as stored, after compression
    pub stored_len: usize,
    pub producer_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message directly to a topic, bypassing producers
    pub fn publish(&self, topic: &str, message: OutboundMessage) -> CommitId {
        let topic = self.state.topic(topic);
        let sequence = {
            let mut log = topic.log.lock();
            log.push(StoredMessage {
                key: message.key,
                event_time: message.event_time,
                compression: Compression::None,
                uncompressed_len: message.value.len(),
                payload: message.value,
                producer_name: "direct".to_string(),
            });
            (log.len() - 1) as u64
        };
        topic.notify.notify_waiters();
        commit_id_for(sequence)
    }

    /// Every message on `topic`, in log order
    pub fn published(&self, topic: &str) -> Result<Vec<PublishedMessage>, BrokerError> {
        let Some(topic) = self.state.existing_topic(topic) else {
            return Ok(Vec::new());
        };
        let log = topic.log.lock();
        log.iter()
            .enumerate()
            .map(|(sequence, stored)| {
                Ok(PublishedMessage {
                    commit_id: commit_id_for(sequence as u64),
                    key: stored.key.clone(),
                    event_time: stored.event_time,
                    value: stored.decode()?,
                    compression: stored.compression,
                    stored_len: stored.payload.len(),
                    producer_name: stored.producer_name.clone(),
                })
            })
            .collect()
    }

    /// Commit ids acknowledged on a subscription, in acknowledgement order
    pub fn acknowledged(&self, topic: &str, subscription: &str) -> Vec<CommitId> {
        self.state
            .existing_topic(topic)
            .and_then(|t| t.existing_subscription(subscription))
            .map(|sub| {
                sub.lock()
                    .ack_order
                    .iter()
                    .map(|s| commit_id_for(*s))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Messages delivered on a subscription but not yet acknowledged
    pub fn unacknowledged(&self, topic: &str, subscription: &str) -> usize {
        self.state
            .existing_topic(topic)
            .and_then(|t| t.existing_subscription(subscription))
            .map(|sub| {
                let sub = sub.lock();
                sub.unacked.len() + sub.redeliver.len()
            })
            .unwrap_or(0)
    }

    /// Number of producer batches dispatched to `topic`
    pub fn batch_count(&self, topic: &str) -> u64 {
        self.state
            .existing_topic(topic)
            .map(|t| t.batches.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::Relaxed)
    }

    /// Handles released so far, in the order they were closed
    pub fn closed_handles(&self) -> Vec<ClosedHandle> {
        self.state.closed_handles.lock().clone()
    }

    pub fn fail_next_connect(&self) {
        self.state.faults.connect.arm(0);
    }

    pub fn fail_next_consumer(&self) {
        self.state.faults.create_consumer.arm(0);
    }

    pub fn fail_next_producer(&self) {
        self.state.faults.create_producer.arm(0);
    }

    pub fn fail_next_receive(&self) {
        self.state.faults.receive.arm(0);
    }

    /// Let `successful` sends through, then fail the next one
    pub fn fail_send_after(&self, successful: usize) {
        self.state.faults.send.arm(successful);
    }

    /// Let `successful` acknowledgements through, then fail the next one
    pub fn fail_acknowledge_after(&self, successful: usize) {
        self.state.faults.acknowledge.arm(successful);
    }

    /// Fail the next close of any connection, consumer or producer
    ///
    /// The handle is still released.
    pub fn fail_next_close(&self) {
        self.state.faults.close.arm(0);
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn connect(&self, service_url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        url::Url::parse(service_url).map_err(|e| BrokerError::InvalidUrl {
            url: service_url.to_string(),
            message: e.to_string(),
        })?;

        if self.state.faults.connect.should_fail() {
            return Err(BrokerError::Connection(format!(
                "injected connect failure for {}",
                service_url
            )));
        }

        self.state.open_connections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("In-memory broker connection opened for {}", service_url);

        Ok(Arc::new(InMemoryConnection {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct InMemoryConnection {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_consumer(
        &self,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        self.ensure_open()?;
        if self.state.faults.create_consumer.should_fail() {
            return Err(BrokerError::Connection(
                "injected consumer creation failure".to_string(),
            ));
        }

        let topic = self.state.topic(&options.topic);
        let subscription = topic.subscription(&options.subscription);

        Ok(Arc::new(InMemoryConsumer {
            state: self.state.clone(),
            topic,
            subscription_name: options.subscription,
            subscription,
            interceptor: options.interceptor,
            in_flight: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        self.ensure_open()?;
        if self.state.faults.create_producer.should_fail() {
            return Err(BrokerError::Connection(
                "injected producer creation failure".to_string(),
            ));
        }

        let topic = self.state.topic(&options.topic);
        Ok(Arc::new(InMemoryProducer {
            state: self.state.clone(),
            core: Arc::new(ProducerCore {
                topic,
                name: options.producer_name,
                max_messages: options.batch.max_messages.max(1),
                max_delay: options.batch.max_delay,
                compression: options.compression,
                compression_level: options.compression_level,
                interceptor: options.interceptor,
                pending: Mutex::new(PendingBatch::default()),
            }),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.open_connections.fetch_sub(1, Ordering::Relaxed);
        self.state.close_handle(ClosedHandle::Connection)
    }
}

pub struct InMemoryConsumer {
    state: Arc<BrokerState>,
    topic: Arc<Topic>,
    subscription_name: String,
    subscription: Arc<Mutex<SubscriptionState>>,
    interceptor: Option<MessageInterceptor>,
    /// Delivered to this consumer and not yet acknowledged
    in_flight: Mutex<BTreeSet<u64>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for InMemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConsumer")
            .field("in_flight", &self.in_flight.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }
            if self.state.faults.receive.should_fail() {
                return Err(BrokerError::Receive("injected receive failure".to_string()));
            }

            // Register interest before checking so a concurrent dispatch is not missed
            let notified = self.topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((sequence, stored)) = self.topic.next_for(&self.subscription) {
                self.in_flight.lock().insert(sequence);
                let value = stored.decode()?;
                if let Some(interceptor) = &self.interceptor {
                    interceptor(value.len());
                }
                return Ok(Some(InboundMessage {
                    commit_id: commit_id_for(sequence),
                    value,
                    key: stored.key,
                    event_time: stored.event_time,
                }));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(&self, commit_id: &CommitId) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if self.state.faults.acknowledge.should_fail() {
            return Err(BrokerError::Acknowledge(format!(
                "injected acknowledge failure for {}",
                commit_id
            )));
        }

        let sequence = sequence_of(commit_id)?;
        let mut sub = self.subscription.lock();
        if sub.unacked.remove(&sequence) {
            sub.acked.insert(sequence);
            sub.ack_order.push(sequence);
            self.in_flight.lock().remove(&sequence);
            Ok(())
        } else if sub.acked.contains(&sequence) {
            Ok(())
        } else {
            Err(BrokerError::UnknownCommitId(commit_id.to_string()))
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let in_flight = std::mem::take(&mut *self.in_flight.lock());
        if !in_flight.is_empty() {
            let mut sub = self.subscription.lock();
            for sequence in in_flight {
                if sub.unacked.remove(&sequence) {
                    sub.redeliver.push_back(sequence);
                }
            }
            sub.redeliver.make_contiguous().sort_unstable();
        }

        // Wake receivers blocked on this topic so they observe the close
        self.topic.notify.notify_waiters();
        self.state.close_handle(ClosedHandle::Consumer {
            subscription: self.subscription_name.clone(),
        })
    }
}

struct PendingMessage {
    message: OutboundMessage,
    reply: oneshot::Sender<Result<CommitId, BrokerError>>,
}

#[derive(Default)]
struct PendingBatch {
    messages: Vec<PendingMessage>,
    /// Bumped on every flush so a stale linger timer does nothing
    generation: u64,
}

impl PendingBatch {
    fn take(&mut self) -> Vec<PendingMessage> {
        self.generation += 1;
        std::mem::take(&mut self.messages)
    }
}

struct ProducerCore {
    topic: Arc<Topic>,
    name: String,
    max_messages: usize,
    max_delay: Duration,
    compression: Compression,
    compression_level: i32,
    interceptor: Option<MessageInterceptor>,
    pending: Mutex<PendingBatch>,
}

impl ProducerCore {
    fn encode(&self, value: &Bytes) -> Result<(Compression, Bytes), BrokerError> {
        if value.is_empty() {
            return Ok((Compression::None, value.clone()));
        }
        match self.compression {
            Compression::None => Ok((Compression::None, value.clone())),
            Compression::Zstd => zstd::bulk::compress(value, self.compression_level)
                .map(|compressed| (Compression::Zstd, Bytes::from(compressed)))
                .map_err(|e| {
                    BrokerError::compression("zstd", format!("Compression failed: {}", e))
                }),
        }
    }

    fn dispatch(&self, batch: Vec<PendingMessage>) {
        if batch.is_empty() {
            return;
        }

        let encoded: Vec<_> = batch
            .into_iter()
            .map(|pending| {
                let encoded = self.encode(&pending.message.value);
                (pending, encoded)
            })
            .collect();

        let mut replies = Vec::with_capacity(encoded.len());
        {
            let mut log = self.topic.log.lock();
            for (pending, encoded) in encoded {
                let result = encoded.map(|(compression, payload)| {
                    if let Some(interceptor) = &self.interceptor {
                        interceptor(pending.message.value.len());
                    }
                    let sequence = log.len() as u64;
                    log.push(StoredMessage {
                        key: pending.message.key,
                        event_time: pending.message.event_time,
                        compression,
                        uncompressed_len: pending.message.value.len(),
                        payload,
                        producer_name: self.name.clone(),
                    });
                    commit_id_for(sequence)
                });
                replies.push((pending.reply, result));
            }
        }

        self.topic.batches.fetch_add(1, Ordering::Relaxed);
        self.topic.notify.notify_waiters();

        for (reply, result) in replies {
            // The sender may have given up waiting; the message is published regardless
            let _ = reply.send(result);
        }
    }

    fn flush(&self) {
        let batch = self.pending.lock().take();
        self.dispatch(batch);
    }
}

pub struct InMemoryProducer {
    state: Arc<BrokerState>,
    core: Arc<ProducerCore>,
    closed: AtomicBool,
}

impl std::fmt::Debug for InMemoryProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProducer")
            .field("name", &self.core.name)
            .field("max_messages", &self.core.max_messages)
            .field("max_delay", &self.core.max_delay)
            .field("compression", &self.core.compression)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerProducer for InMemoryProducer {
    async fn send(&self, message: OutboundMessage) -> Result<CommitId, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if self.state.faults.send.should_fail() {
            return Err(BrokerError::Send("injected send failure".to_string()));
        }

        let (reply, receipt) = oneshot::channel();
        let ready = {
            let mut pending = self.core.pending.lock();
            pending.messages.push(PendingMessage { message, reply });

            if pending.messages.len() >= self.core.max_messages || self.core.max_delay.is_zero() {
                Some(pending.take())
            } else {
                if pending.messages.len() == 1 {
                    let core = self.core.clone();
                    let generation = pending.generation;
                    tokio::spawn(async move {
                        tokio::time::sleep(core.max_delay).await;
                        let batch = {
                            let mut pending = core.pending.lock();
                            if pending.generation != generation {
                                return;
                            }
                            pending.take()
                        };
                        core.dispatch(batch);
                    });
                }
                None
            }
        };

        if let Some(batch) = ready {
            self.core.dispatch(batch);
        }

        receipt.await.map_err(|_| BrokerError::Closed)?
    }

    fn producer_name(&self) -> &str {
        &self.core.name
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.core.flush();
        self.state.close_handle(ClosedHandle::Producer {
            name: self.core.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BatchConfig;

    const TOPIC: &str = "events-message-queue";

    fn consumer_options(subscription: &str) -> ConsumerOptions {
        ConsumerOptions {
            topic: TOPIC.to_string(),
            subscription: subscription.to_string(),
            interceptor: None,
        }
    }

    fn producer_options(batch: BatchConfig, compression: Compression) -> ProducerOptions {
        ProducerOptions {
            topic: TOPIC.to_string(),
            producer_name: "events".to_string(),
            batch,
            compression,
            compression_level: 3,
            interceptor: None,
        }
    }

    async fn connect(broker: &InMemoryBroker) -> Arc<dyn BrokerConnection> {
        broker.connect("memory://local").await.unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_url() {
        let broker = InMemoryBroker::new();
        let err = broker.connect("::not a url::").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidUrl { .. }));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_topic() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();

        let start = std::time::Instant::now();
        let received = consumer.receive(Duration::from_millis(30)).await.unwrap();
        assert!(received.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(TOPIC, OutboundMessage::new(Bytes::from_static(b"late")));
        });

        let message = consumer
            .receive(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("message should arrive before the deadline");
        assert_eq!(message.value.as_ref(), b"late");
    }

    #[tokio::test]
    async fn test_batch_flushes_at_max_messages() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let producer = connection
            .create_producer(producer_options(
                BatchConfig {
                    max_messages: 3,
                    max_delay: Duration::from_secs(60),
                },
                Compression::None,
            ))
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            producer.send(OutboundMessage::new(Bytes::from_static(b"0"))),
            producer.send(OutboundMessage::new(Bytes::from_static(b"1"))),
            producer.send(OutboundMessage::new(Bytes::from_static(b"2"))),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(broker.batch_count(TOPIC), 1);
        assert_eq!(broker.published(TOPIC).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_flushes_after_linger() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let producer = connection
            .create_producer(producer_options(
                BatchConfig {
                    max_messages: 1000,
                    max_delay: Duration::from_millis(5),
                },
                Compression::Zstd,
            ))
            .await
            .unwrap();

        let commit_id = tokio::time::timeout(
            Duration::from_secs(1),
            producer.send(OutboundMessage::new(Bytes::from_static(b"lonely"))),
        )
        .await
        .expect("linger timer should dispatch the batch")
        .unwrap();

        assert_eq!(commit_id, commit_id_for(0));
        assert_eq!(broker.batch_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_zstd_payloads_are_stored_compressed() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let producer = connection
            .create_producer(producer_options(BatchConfig::default(), Compression::Zstd))
            .await
            .unwrap();

        let value = Bytes::from(vec![b'x'; 4096]);
        producer
            .send(OutboundMessage::new(value.clone()).with_key("k"))
            .await
            .unwrap();

        let published = broker.published(TOPIC).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].compression, Compression::Zstd);
        assert!(published[0].stored_len < value.len());
        assert_eq!(published[0].value, value);
        assert_eq!(published[0].key.as_deref(), Some("k"));

        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();
        let message = consumer
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.value, value);
    }

    #[tokio::test]
    async fn test_interceptors_count_once_per_message() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;

        let produced = Arc::new(AtomicU64::new(0));
        let produced_clone = produced.clone();
        let mut options = producer_options(BatchConfig::default(), Compression::Zstd);
        options.interceptor = Some(Arc::new(move |len| {
            produced_clone.fetch_add(len as u64, Ordering::Relaxed);
        }));
        let producer = connection.create_producer(options).await.unwrap();

        let consumed = Arc::new(AtomicU64::new(0));
        let consumed_clone = consumed.clone();
        let mut options = consumer_options("events");
        options.interceptor = Some(Arc::new(move |len| {
            consumed_clone.fetch_add(len as u64, Ordering::Relaxed);
        }));
        let consumer = connection.create_consumer(options).await.unwrap();

        producer
            .send(OutboundMessage::new(Bytes::from_static(b"12345")))
            .await
            .unwrap();
        // Uncompressed length is reported, not the stored size
        assert_eq!(produced.load(Ordering::Relaxed), 5);

        consumer.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(consumed.load(Ordering::Relaxed), 5);

        // Nothing more to deliver; a timeout does not count
        consumer.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(consumed.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_shared_subscription_delivers_each_message_once() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let first = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();
        let second = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();
        let other = connection
            .create_consumer(consumer_options("audit"))
            .await
            .unwrap();

        broker.publish(TOPIC, OutboundMessage::new(Bytes::from_static(b"a")));
        broker.publish(TOPIC, OutboundMessage::new(Bytes::from_static(b"b")));

        let timeout = Duration::from_millis(20);
        let a = first.receive(timeout).await.unwrap().unwrap();
        let b = second.receive(timeout).await.unwrap().unwrap();
        assert_eq!(a.value.as_ref(), b"a");
        assert_eq!(b.value.as_ref(), b"b");
        assert!(first.receive(timeout).await.unwrap().is_none());

        // A separate subscription sees the whole topic
        assert_eq!(other.receive(timeout).await.unwrap().unwrap().value.as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_unacked_messages_redelivered_after_close() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();

        broker.publish(TOPIC, OutboundMessage::new(Bytes::from_static(b"a")));
        broker.publish(TOPIC, OutboundMessage::new(Bytes::from_static(b"b")));

        let timeout = Duration::from_millis(20);
        let a = consumer.receive(timeout).await.unwrap().unwrap();
        let _b = consumer.receive(timeout).await.unwrap().unwrap();
        consumer.acknowledge(&a.commit_id).await.unwrap();
        consumer.close().await.unwrap();

        assert_eq!(broker.acknowledged(TOPIC, "events"), vec![a.commit_id]);
        assert_eq!(broker.unacknowledged(TOPIC, "events"), 1);

        let replacement = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();
        let redelivered = replacement.receive(timeout).await.unwrap().unwrap();
        assert_eq!(redelivered.value.as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_repeated_acknowledge_is_idempotent() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();

        for value in ["a", "b", "c"] {
            broker.publish(TOPIC, OutboundMessage::new(Bytes::from(value)));
        }

        let timeout = Duration::from_millis(20);
        let a = consumer.receive(timeout).await.unwrap().unwrap();
        let b = consumer.receive(timeout).await.unwrap().unwrap();
        let c = consumer.receive(timeout).await.unwrap().unwrap();

        consumer.acknowledge(&c.commit_id).await.unwrap();
        consumer.acknowledge(&a.commit_id).await.unwrap();
        consumer.acknowledge(&c.commit_id).await.unwrap();
        consumer.acknowledge(&a.commit_id).await.unwrap();

        // Order of first acknowledgement, no duplicates
        assert_eq!(
            broker.acknowledged(TOPIC, "events"),
            vec![c.commit_id, a.commit_id]
        );
        assert_eq!(broker.unacknowledged(TOPIC, "events"), 1);

        consumer.acknowledge(&b.commit_id).await.unwrap();
        assert_eq!(broker.unacknowledged(TOPIC, "events"), 0);
    }

    #[tokio::test]
    async fn test_inspection_leaves_subscriptions_untouched() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC, OutboundMessage::new(Bytes::from_static(b"a")));

        assert!(broker.acknowledged(TOPIC, "audit").is_empty());
        assert_eq!(broker.unacknowledged(TOPIC, "audit"), 0);

        let topic = broker.state.existing_topic(TOPIC).unwrap();
        assert!(topic.existing_subscription("audit").is_none());
        assert!(topic.subscriptions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_handles_recorded_in_order() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();
        let producer = connection
            .create_producer(producer_options(BatchConfig::default(), Compression::None))
            .await
            .unwrap();

        producer.close().await.unwrap();
        consumer.close().await.unwrap();
        connection.close().await.unwrap();
        // A second close releases nothing new
        connection.close().await.unwrap();

        assert_eq!(
            broker.closed_handles(),
            vec![
                ClosedHandle::Producer {
                    name: "events".to_string()
                },
                ClosedHandle::Consumer {
                    subscription: "events".to_string()
                },
                ClosedHandle::Connection,
            ]
        );
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_commit_id() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();

        let err = consumer
            .acknowledge(&CommitId::new(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownCommitId(_)));

        let err = consumer.acknowledge(&commit_id_for(99)).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownCommitId(_)));
    }

    #[tokio::test]
    async fn test_closed_handles_reject_operations() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        assert_eq!(broker.open_connections(), 1);

        let consumer = connection
            .create_consumer(consumer_options("events"))
            .await
            .unwrap();
        let producer = connection
            .create_producer(producer_options(BatchConfig::default(), Compression::None))
            .await
            .unwrap();

        consumer.close().await.unwrap();
        producer.close().await.unwrap();
        connection.close().await.unwrap();

        assert_eq!(
            consumer.receive(Duration::from_millis(5)).await.unwrap_err(),
            BrokerError::Closed
        );
        assert_eq!(
            producer
                .send(OutboundMessage::new(Bytes::from_static(b"x")))
                .await
                .unwrap_err(),
            BrokerError::Closed
        );
        assert!(connection
            .create_consumer(consumer_options("events"))
            .await
            .is_err());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_producer_close_flushes_pending_batch() {
        let broker = InMemoryBroker::new();
        let connection = connect(&broker).await;
        let producer: Arc<dyn BrokerProducer> = connection
            .create_producer(producer_options(
                BatchConfig {
                    max_messages: 100,
                    max_delay: Duration::from_secs(60),
                },
                Compression::None,
            ))
            .await
            .unwrap();

        let sender = producer.clone();
        let pending = tokio::spawn(async move {
            sender
                .send(OutboundMessage::new(Bytes::from_static(b"buffered")))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(broker.published(TOPIC).unwrap().is_empty());

        producer.close().await.unwrap();
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(broker.published(TOPIC).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_countdown() {
        let countdown = FaultCountdown::default();
        assert!(!countdown.should_fail());

        countdown.arm(2);
        assert!(!countdown.should_fail());
        assert!(!countdown.should_fail());
        assert!(countdown.should_fail());
        assert!(!countdown.should_fail());
    }
}
