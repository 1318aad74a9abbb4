//! Error types for command sessions.

use std::time::Duration;

use scopelink_transport::TransportError;
use thiserror::Error;

use crate::command::Verb;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session error types.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport error outside the publish retry path.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every publish attempt failed.
    #[error("Publish failed after {attempts} attempt(s): {last_error}")]
    PublishFailed {
        attempts: u32,
        last_error: TransportError,
    },

    /// No response within the call deadline.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The session was closed while the call was waiting.
    #[error("Call cancelled")]
    Cancelled,

    /// The session is closed.
    #[error("Session closed")]
    Closed,

    /// Ordinal correlation allows a single outstanding command.
    #[error("Another command is already pending on this session")]
    Busy,

    /// An abandoned ordinal call left a response unaccounted for.
    #[error("Session desynchronized: a previous call was abandoned while pending")]
    Desynchronized,

    /// A response could not belong to the command it was matched with.
    #[error("Correlation violation: {0}")]
    CorrelationViolation(String),

    /// The response could not be decoded for its verb.
    #[error("Cannot decode {verb} response: {reason}")]
    Decode { verb: Verb, reason: String },

    /// The device answered with an error.
    #[error("Device reported an error: {0}")]
    Device(String),

    /// The stitching tool could not be run or produced no output.
    #[error("Stitching tool failed: {0}")]
    ExternalTool(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}
