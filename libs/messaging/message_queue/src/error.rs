use crate::broker::BrokerError;
use crate::lifecycle::ServiceState;
use std::fmt;
use std::time::Duration;

/// Broker call that produced a [`QueueError::Broker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOperation {
    Connect,
    CreateConsumer,
    CreateProducer,
    Receive,
    Send,
    Acknowledge,
    Close,
}

impl BrokerOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerOperation::Connect => "connect",
            BrokerOperation::CreateConsumer => "create consumer",
            BrokerOperation::CreateProducer => "create producer",
            BrokerOperation::Receive => "receive",
            BrokerOperation::Send => "send",
            BrokerOperation::Acknowledge => "acknowledge",
            BrokerOperation::Close => "close",
        }
    }
}

impl fmt::Display for BrokerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Timeout waiting for messages after {waited:?}")]
    Timeout { waited: Duration },

    #[error("Broker {operation} failed{}: {source}", .entry.as_ref().map(|e| format!(" for entry <{}>", e)).unwrap_or_default())]
    Broker {
        operation: BrokerOperation,
        /// Display form of the offending entry, when the failure is tied to one
        entry: Option<String>,
        #[source]
        source: BrokerError,
    },

    #[error("Message queue service '{name}' is not running (state: {state:?})")]
    NotRunning { name: String, state: ServiceState },

    #[error("Message queue service '{name}' failed to start: {cause}")]
    StartupFailure { name: String, cause: Box<QueueError> },

    #[error("Message queue service '{name}' failed to shut down: {cause}")]
    ShutdownFailure { name: String, cause: Box<QueueError> },

    /// Lifecycle method called from a state that does not allow it.
    #[error("Illegal {action} on message queue service '{name}' in state {from:?}")]
    IllegalState {
        name: String,
        from: ServiceState,
        action: &'static str,
    },

    #[error("Entry <{entry}> was not received from a broker and cannot be committed")]
    NotCommittable { entry: String },

    #[error("Interrupted while waiting for the service to become ready")]
    Interrupted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Wrap a broker error without entry context
    pub fn broker(operation: BrokerOperation, source: BrokerError) -> Self {
        QueueError::Broker {
            operation,
            entry: None,
            source,
        }
    }

    /// Wrap a broker error raised while handling a specific entry
    pub fn broker_for_entry(
        operation: BrokerOperation,
        entry: impl fmt::Display,
        source: BrokerError,
    ) -> Self {
        QueueError::Broker {
            operation,
            entry: Some(entry.to_string()),
            source,
        }
    }

    pub fn not_running(name: impl Into<String>, state: ServiceState) -> Self {
        QueueError::NotRunning {
            name: name.into(),
            state,
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        QueueError::InvalidConfig(msg.into())
    }

    /// Expected conditions a caller can simply retry or wait out
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QueueError::Timeout { .. } | QueueError::NotRunning { .. }
        )
    }

    /// Errors that should be treated as fatal for the queue instance
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::Broker { .. }
                | QueueError::StartupFailure { .. }
                | QueueError::ShutdownFailure { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::Timeout { .. })
    }
}

impl From<config_crate::ConfigError> for QueueError {
    fn from(err: config_crate::ConfigError) -> Self {
        QueueError::InvalidConfig(err.to_string())
    }
}

impl From<toml::de::Error> for QueueError {
    fn from(err: toml::de::Error) -> Self {
        QueueError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
