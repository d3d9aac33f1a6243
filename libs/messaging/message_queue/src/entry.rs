use crate::broker::{BrokerConsumer, InboundMessage};
use crate::error::{BrokerOperation, QueueError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Opaque broker handle needed to acknowledge one delivered message
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CommitId(Bytes);

impl CommitId {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A single queue record
///
/// `timestamp` is epoch millis; values `<= 0` mean "no timestamp".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    id: Bytes,
    key: Option<Bytes>,
    value: Bytes,
    timestamp: i64,
    commit_id: Option<CommitId>,
}

impl Entry {
    pub fn new(
        id: impl Into<Bytes>,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            key,
            value: value.into(),
            timestamp,
            commit_id: None,
        }
    }

    /// Wrap a delivered broker message. The entry id is the commit id bytes.
    pub(crate) fn from_message(message: InboundMessage) -> Self {
        let timestamp = message
            .event_time
            .and_then(|t| i64::try_from(t).ok())
            .unwrap_or(0);
        Self {
            id: Bytes::copy_from_slice(message.commit_id.as_bytes()),
            key: message.key.map(Bytes::from),
            value: message.value,
            timestamp,
            commit_id: Some(message.commit_id),
        }
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Timestamp to forward as broker event time, if it is set
    pub fn event_time(&self) -> Option<u64> {
        if self.timestamp > 0 {
            Some(self.timestamp as u64)
        } else {
            None
        }
    }

    pub fn commit_id(&self) -> Option<&CommitId> {
        self.commit_id.as_ref()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} key_len={} value_len={} timestamp={}",
            hex::encode(&self.id),
            self.key.as_ref().map(|k| k.len()).unwrap_or(0),
            self.value.len(),
            self.timestamp
        )
    }
}

/// Ordered entries from one receive operation, committable through the
/// consumer that delivered them
pub struct Envelope {
    entries: Vec<Entry>,
    consumer: Arc<dyn BrokerConsumer>,
}

impl Envelope {
    pub(crate) fn new(entries: Vec<Entry>, consumer: Arc<dyn BrokerConsumer>) -> Self {
        Self { entries, consumer }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Acknowledge a single entry to the broker
    pub async fn commit(&self, entry: &Entry) -> Result<(), QueueError> {
        let commit_id = entry.commit_id().ok_or_else(|| QueueError::NotCommittable {
            entry: entry.to_string(),
        })?;

        self.consumer
            .acknowledge(commit_id)
            .await
            .map_err(|e| QueueError::broker_for_entry(BrokerOperation::Acknowledge, entry, e))
    }

    /// Acknowledge every entry in order, stopping at the first failure
    ///
    /// Entries after the failing one stay unacknowledged and will be
    /// redelivered by the broker.
    pub async fn commit_all(&self) -> Result<(), QueueError> {
        for entry in &self.entries {
            self.commit(entry).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl<'a> IntoIterator for &'a Envelope {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Consumer that records acknowledgements and fails on a chosen commit id
    #[derive(Debug, Default)]
    struct RecordingConsumer {
        acked: Mutex<Vec<CommitId>>,
        fail_on: Option<CommitId>,
    }

    #[async_trait]
    impl BrokerConsumer for RecordingConsumer {
        async fn receive(&self, _timeout: Duration) -> Result<Option<InboundMessage>, BrokerError> {
            Ok(None)
        }

        async fn acknowledge(&self, commit_id: &CommitId) -> Result<(), BrokerError> {
            if self.fail_on.as_ref() == Some(commit_id) {
                return Err(BrokerError::Acknowledge("rejected".to_string()));
            }
            self.acked.lock().push(commit_id.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn delivered(seq: u8, value: &'static [u8]) -> Entry {
        Entry::from_message(InboundMessage {
            commit_id: CommitId::new(vec![seq]),
            value: Bytes::from_static(value),
            key: None,
            event_time: None,
        })
    }

    #[test]
    fn test_event_time_only_for_positive_timestamps() {
        assert_eq!(Entry::new(vec![1], None, vec![2], 0).event_time(), None);
        assert_eq!(Entry::new(vec![1], None, vec![2], -5).event_time(), None);
        assert_eq!(
            Entry::new(vec![1], None, vec![2], 1_700_000_000_000).event_time(),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_entry_from_message() {
        let entry = Entry::from_message(InboundMessage {
            commit_id: CommitId::new(vec![0, 7]),
            value: Bytes::from_static(b"payload"),
            key: Some("user-1".to_string()),
            event_time: Some(42),
        });

        assert_eq!(entry.id().as_ref(), &[0, 7]);
        assert_eq!(entry.key().map(|k| k.as_ref()), Some(&b"user-1"[..]));
        assert_eq!(entry.value().as_ref(), b"payload");
        assert_eq!(entry.timestamp(), 42);
        assert_eq!(entry.commit_id(), Some(&CommitId::new(vec![0, 7])));
    }

    #[test]
    fn test_entry_display_is_hex() {
        let entry = Entry::new(vec![0xab, 0x01], Some(Bytes::from_static(b"k")), vec![0; 3], 9);
        assert_eq!(entry.to_string(), "id=ab01 key_len=1 value_len=3 timestamp=9");
    }

    #[tokio::test]
    async fn test_commit_all_in_order() {
        let consumer = Arc::new(RecordingConsumer::default());
        let envelope = Envelope::new(
            vec![delivered(1, b"a"), delivered(2, b"b"), delivered(3, b"c")],
            consumer.clone(),
        );

        envelope.commit_all().await.unwrap();

        let acked = consumer.acked.lock().clone();
        assert_eq!(
            acked,
            vec![
                CommitId::new(vec![1]),
                CommitId::new(vec![2]),
                CommitId::new(vec![3])
            ]
        );
    }

    #[tokio::test]
    async fn test_commit_all_halts_at_first_failure() {
        let consumer = Arc::new(RecordingConsumer {
            acked: Mutex::new(Vec::new()),
            fail_on: Some(CommitId::new(vec![2])),
        });
        let envelope = Envelope::new(
            vec![delivered(1, b"a"), delivered(2, b"b"), delivered(3, b"c")],
            consumer.clone(),
        );

        let err = envelope.commit_all().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Broker {
                operation: BrokerOperation::Acknowledge,
                entry: Some(_),
                ..
            }
        ));
        assert_eq!(consumer.acked.lock().clone(), vec![CommitId::new(vec![1])]);
    }

    #[tokio::test]
    async fn test_commit_rejects_caller_built_entry() {
        let consumer = Arc::new(RecordingConsumer::default());
        let envelope = Envelope::new(vec![], consumer.clone());

        let entry = Entry::new(vec![1], None, vec![2], 0);
        let err = envelope.commit(&entry).await.unwrap_err();
        assert!(matches!(err, QueueError::NotCommittable { .. }));
        assert!(consumer.acked.lock().is_empty());
    }

    #[test]
    fn test_envelope_iteration_preserves_order() {
        let envelope = Envelope::new(
            vec![delivered(1, b"first"), delivered(2, b"second")],
            Arc::new(RecordingConsumer::default()),
        );

        let values: Vec<&[u8]> = (&envelope).into_iter().map(|e| e.value().as_ref()).collect();
        assert_eq!(values, vec![&b"first"[..], &b"second"[..]]);
        assert_eq!(envelope.len(), 2);
        assert!(!envelope.is_empty());
    }
}
