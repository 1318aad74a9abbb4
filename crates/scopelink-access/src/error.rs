//! Error types for the access gate.

use thiserror::Error;

/// Result type for access operations.
pub type Result<T> = std::result::Result<T, AccessError>;

/// Access error types.
///
/// Rejected keys and cooldowns are ordinary results, not errors.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Key store failure.
    #[error("Storage error: {0}")]
    Store(String),

    /// The broker account could not be provisioned.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Durations that cannot be represented as timestamps.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AccessError {
    fn from(e: serde_json::Error) -> Self {
        AccessError::Serialization(e.to_string())
    }
}

impl From<chrono::ParseError> for AccessError {
    fn from(e: chrono::ParseError) -> Self {
        AccessError::Serialization(format!("Invalid timestamp: {}", e))
    }
}

impl From<reqwest::Error> for AccessError {
    fn from(e: reqwest::Error) -> Self {
        AccessError::Provisioning(e.to_string())
    }
}

impl From<redb::Error> for AccessError {
    fn from(e: redb::Error) -> Self {
        AccessError::Store(format!("Redb error: {}", e))
    }
}

impl From<redb::DatabaseError> for AccessError {
    fn from(e: redb::DatabaseError) -> Self {
        AccessError::Store(format!("Redb database error: {}", e))
    }
}

impl From<redb::TransactionError> for AccessError {
    fn from(e: redb::TransactionError) -> Self {
        AccessError::Store(format!("Redb transaction error: {}", e))
    }
}

impl From<redb::TableError> for AccessError {
    fn from(e: redb::TableError) -> Self {
        AccessError::Store(format!("Redb table error: {}", e))
    }
}

impl From<redb::StorageError> for AccessError {
    fn from(e: redb::StorageError) -> Self {
        AccessError::Store(format!("Redb storage error: {}", e))
    }
}

impl From<redb::CommitError> for AccessError {
    fn from(e: redb::CommitError) -> Self {
        AccessError::Store(format!("Redb commit error: {}", e))
    }
}
