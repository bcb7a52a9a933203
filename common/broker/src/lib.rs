use lapin::types::{AMQPValue, FieldTable};
use thiserror::Error;

pub mod config;
pub mod consumer;
pub mod mock;
pub mod publisher;

pub use config::BrokerConfig;
pub use consumer::AmqpConsumer;
pub use mock::{MockPublisher, PublishedMessage};
pub use publisher::{AmqpPublisher, QueuePublisher};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker client is not connected")]
    NotConnected,
    #[error("broker i/o error: {0}")]
    Io(String),
    #[error("broker protocol error: {0}")]
    Protocol(String),
    #[error("publish was not confirmed by the broker")]
    NotConfirmed,
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Transient errors are worth one reconnect-and-retry; everything else
    /// is surfaced as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::NotConnected | BrokerError::Io(_) | BrokerError::NotConfirmed
        )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(err) => BrokerError::Io(err.to_string()),
            lapin::Error::InvalidChannel(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_) => BrokerError::NotConnected,
            lapin::Error::ProtocolError(err) => BrokerError::Protocol(err.to_string()),
            err => BrokerError::Other(err.to_string()),
        }
    }
}

/// Per-queue attributes fixed at declaration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePolicies {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl_ms: Option<u32>,
}

impl QueuePolicies {
    pub fn to_queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.as_str().into()),
            );
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.as_str().into()),
            );
        }
        if let Some(ttl_ms) = self.message_ttl_ms {
            arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl_ms));
        }
        arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_arguments_only_carry_configured_policies() {
        let empty = QueuePolicies::default().to_queue_arguments();
        assert!(empty.inner().is_empty());

        let full = QueuePolicies {
            dead_letter_exchange: Some("dlx".to_string()),
            dead_letter_routing_key: Some("dead".to_string()),
            message_ttl_ms: Some(60_000),
        }
        .to_queue_arguments();
        let keys: Vec<String> = full
            .inner()
            .keys()
            .map(|k| k.as_str().to_string())
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&"x-message-ttl".to_string()));
    }

    #[test]
    fn transient_classification_is_typed() {
        assert!(BrokerError::NotConnected.is_transient());
        assert!(BrokerError::Io("reset".to_string()).is_transient());
        assert!(!BrokerError::Protocol("precondition failed".to_string()).is_transient());
        assert!(!BrokerError::Other("bad".to_string()).is_transient());
    }
}
