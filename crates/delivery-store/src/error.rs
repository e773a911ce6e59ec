//! Store layer error types

use thiserror::Error;

/// Store layer errors.
///
/// Write conflicts are not errors: [`crate::store::PutOutcome::Conflict`]
/// carries them as an ordinary outcome.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    /// Known-transient backend condition; scans retry on it.
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Redis error during {op} on {collection}: {code}: {message}")]
    Redis {
        op: &'static str,
        collection: String,
        code: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record {collection}/{id} field {field:?}: {reason}")]
    Codec {
        collection: &'static str,
        id: i64,
        field: String,
        reason: String,
    },

    /// A geo-indexed field holds a point the index cannot store.
    #[error("Record {collection}/{id} field {field:?} is not indexable: {reason}")]
    Unindexable {
        collection: String,
        id: i64,
        field: String,
        reason: String,
    },

    #[error("Scan worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

impl From<delivery_domain::DomainError> for StoreError {
    fn from(err: delivery_domain::DomainError) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
