use async_trait::async_trait;
use redis::{ErrorKind, RedisError};
use thiserror::Error;

pub mod client;
pub mod mock;

pub use client::RedisKv;
pub use mock::{MockKvCall, MockKvClient};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("kv client is not connected")]
    NotConnected,
    #[error("kv i/o error: {0}")]
    Io(String),
    #[error("kv timeout")]
    Timeout,
    #[error("kv error: {0}")]
    Other(String),
}

impl KvError {
    /// Transient errors are worth one reconnect-and-retry; everything else
    /// is surfaced as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::NotConnected | KvError::Io(_) | KvError::Timeout)
    }
}

impl From<RedisError> for KvError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            KvError::Timeout
        } else if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.kind() == ErrorKind::IoError
        {
            KvError::Io(err.to_string())
        } else {
            KvError::Other(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for KvError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        KvError::Timeout
    }
}

/// One entry read from a stream consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub body: String,
}

/// Key-value store operations the services consume. Connections are
/// established lazily; callers own the bounded reconnection loops.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Establish (or re-establish) the connection. One attempt, no retry.
    async fn connect(&self) -> Result<(), KvError>;

    fn is_connected(&self) -> bool;

    /// `ttl_seconds` of 0 means no expiry.
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Best-effort group creation; an already-existing group is not an error.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), KvError>;

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, KvError>;

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), KvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_is_typed() {
        assert!(KvError::NotConnected.is_transient());
        assert!(KvError::Timeout.is_transient());
        assert!(KvError::Io("reset".to_string()).is_transient());
        assert!(!KvError::Other("wrong type".to_string()).is_transient());
    }

    #[test]
    fn driver_errors_map_by_kind() {
        let io: KvError = RedisError::from((ErrorKind::IoError, "broken pipe")).into();
        assert!(matches!(io, KvError::Io(_)));

        let other: KvError = RedisError::from((ErrorKind::TypeError, "wrong type")).into();
        assert!(matches!(other, KvError::Other(_)));
    }
}
