//! Transport error types.

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by a [`TransportConnection`](crate::TransportConnection) or one of its links.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Connection lost before the broker acknowledged the request")]
    ConnectionLost,

    #[error("Not connected (state: {0})")]
    NotConnected(crate::ConnectionState),

    #[error("Timed out after {0:?} waiting for the broker to accept the connection")]
    ConnectTimeout(std::time::Duration),

    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidTopicFilter { filter: String, reason: String },

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Request rejected by link: {0}")]
    Request(String),

    #[error("Connection closed")]
    Closed,
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Serialization(e.to_string())
    }
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Request(e.to_string())
    }
}

#[cfg(feature = "mqtt")]
impl From<rumqttc::ConnectionError> for TransportError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        TransportError::Connection(e.to_string())
    }
}
