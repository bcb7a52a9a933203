use std::sync::Mutex;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::{BrokerConfig, BrokerError};

/// The publish surface the ingest side consumes. One attempt per call; the
/// caller owns bounded reconnection loops.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Establish (or re-establish) connection and channel. One attempt.
    async fn connect(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        content_type: &str,
        ttl_ms: Option<u32>,
    ) -> Result<(), BrokerError>;
}

struct PublisherState {
    connection: Connection,
    channel: Channel,
}

/// AMQP work-queue publisher. Publishes to the default exchange with the
/// queue name as routing key; queue declaration belongs to the consumer,
/// whose declaration carries the dead-letter/TTL arguments.
pub struct AmqpPublisher {
    config: BrokerConfig,
    state: Mutex<Option<PublisherState>>,
}

impl AmqpPublisher {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    fn current_channel(&self) -> Result<Channel, BrokerError> {
        self.state
            .lock()
            .expect("publisher state lock poisoned")
            .as_ref()
            .map(|state| state.channel.clone())
            .ok_or(BrokerError::NotConnected)
    }
}

#[async_trait]
impl QueuePublisher for AmqpPublisher {
    async fn connect(&self) -> Result<(), BrokerError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(&self.config.amqp_uri(), properties).await?;
        let channel = connection.create_channel().await?;
        // Publisher confirms turn broker-side drops into publish errors.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            channel_id = self.config.channel_id,
            "broker publisher connected"
        );
        *self.state.lock().expect("publisher state lock poisoned") = Some(PublisherState {
            connection,
            channel,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state
            .lock()
            .expect("publisher state lock poisoned")
            .as_ref()
            .map(|state| state.connection.status().connected())
            .unwrap_or(false)
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        content_type: &str,
        ttl_ms: Option<u32>,
    ) -> Result<(), BrokerError> {
        let channel = self.current_channel()?;

        let mut properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(2);
        if let Some(ttl_ms) = ttl_ms {
            properties = properties.with_expiration(ttl_ms.to_string().into());
        }

        let confirmation = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        if matches!(confirmation, Confirmation::Nack(_)) {
            return Err(BrokerError::NotConfirmed);
        }
        debug!(queue, bytes = body.len(), "message published");
        Ok(())
    }
}
